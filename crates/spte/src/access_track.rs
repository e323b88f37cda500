//! Access tracking without hardware accessed bits.
//!
//! When an entry can't carry a hardware accessed bit, the MMU emulates one by stripping
//! the entry's permissions so the next guest access faults. The read and execute bits
//! are stashed in otherwise unused high bits so the fast fault path can put them back
//! without consulting the guest tables.

use crate::layout::{SHADOW_ACC_TRACK_SAVED_BITS_MASK, SHADOW_ACC_TRACK_SAVED_BITS_SHIFT};
use crate::masks::MaskConfig;
use crate::spte::Spte;

/// Saved-permission bits in their stashed position.
const SAVED_MASK: u64 = SHADOW_ACC_TRACK_SAVED_BITS_MASK << SHADOW_ACC_TRACK_SAVED_BITS_SHIFT;

/// Ages `spte`.
///
/// With hardware A/D bits the accessed bit is simply cleared. Otherwise the R/X bits are
/// saved and the access-track bits cleared, so the entry stays shadow-present but any
/// access faults. An entry that is already access-tracked is returned unchanged.
pub fn mark_spte_for_access_track(masks: &MaskConfig, spte: Spte) -> Spte {
    if spte.ad_enabled() {
        return spte.without(masks.accessed_mask());
    }

    if spte.is_access_track(masks) {
        return spte;
    }

    // Write access is dropped here and must come back through the lockless fast path,
    // which is only possible if the entry could be made writable without the MMU lock.
    if spte.is_writable() && !spte.can_locklessly_be_made_writable(masks) {
        log::warn!("access-tracking {:?}, which cannot be made writable again", spte);
    }

    if spte.raw() & SAVED_MASK != 0 {
        log::warn!("access-track saved bits already occupied in {:?}", spte);
    }

    let saved = (spte.raw() & SHADOW_ACC_TRACK_SAVED_BITS_MASK) << SHADOW_ACC_TRACK_SAVED_BITS_SHIFT;
    log::trace!("access-tracking {:?}", spte);
    spte.with(saved).without(masks.acc_track_mask())
}

/// Undoes [`mark_spte_for_access_track`] for an entry without hardware A/D bits.
///
/// Restores the saved R/X bits into their architectural positions and clears the stash.
/// Write access is not restored.
pub fn restore_acc_track_spte(masks: &MaskConfig, spte: Spte) -> Spte {
    debug_assert!(!spte.ad_enabled(), "restoring {:?}, which uses hardware A/D bits", spte);
    debug_assert!(spte.is_access_track(masks), "restoring {:?}, which is not access-tracked", spte);

    let saved = (spte.raw() >> SHADOW_ACC_TRACK_SAVED_BITS_SHIFT) & SHADOW_ACC_TRACK_SAVED_BITS_MASK;

    spte.without(masks.acc_track_mask()).without(SAVED_MASK).with(saved)
}
