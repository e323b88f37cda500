//! MMIO placeholder entries.
//!
//! A guest access to emulated device memory would normally walk the guest tables and the
//! memslots on every fault. Instead the MMU installs a deliberately faulting entry that
//! caches the GFN, the permitted access and the memslot generation it was created under.
//! The generation lets a stale placeholder be recognized after the memslots change.

use crate::layout::{
    MEMSLOT_GEN_UPDATE_IN_PROGRESS, MMIO_SPTE_GEN_HIGH_MASK, MMIO_SPTE_GEN_HIGH_SHIFT,
    MMIO_SPTE_GEN_LOW_MASK, MMIO_SPTE_GEN_LOW_SHIFT, MMIO_SPTE_GEN_MASK, PAGE_SHIFT,
    SHADOW_NONPRESENT_OR_RSVD_MASK_LEN,
};
use crate::make::{Access, MmuContext};
use crate::masks::MaskConfig;
use crate::numbers::Gfn;
use crate::spte::Spte;

/// Scatters a 19-bit generation into its two entry fields.
///
/// Bits above the generation width are dropped with a warning.
pub fn generation_mmio_spte_mask(generation: u64) -> u64 {
    if generation & !MMIO_SPTE_GEN_MASK != 0 {
        log::warn!("MMIO generation {:#x} truncated to {} bits", generation, MMIO_SPTE_GEN_MASK.count_ones());
    }

    let low = (generation << MMIO_SPTE_GEN_LOW_SHIFT) & MMIO_SPTE_GEN_LOW_MASK;
    let high = (generation << MMIO_SPTE_GEN_HIGH_SHIFT) & MMIO_SPTE_GEN_HIGH_MASK;
    low | high
}

/// Gathers the generation from an MMIO entry.
#[inline]
pub const fn get_mmio_spte_generation(spte: Spte) -> u64 {
    let low = (spte.raw() & MMIO_SPTE_GEN_LOW_MASK) >> MMIO_SPTE_GEN_LOW_SHIFT;
    let high = (spte.raw() & MMIO_SPTE_GEN_HIGH_MASK) >> MMIO_SPTE_GEN_HIGH_SHIFT;
    low | high
}

/// Builds an MMIO placeholder for `gfn` under the current memslot generation.
///
/// Any access bits outside the configured MMIO access mask are dropped. The GPA bits
/// that fall in the L1TF reserved range are moved above it and the range itself is
/// filled with ones, so the entry never points into cacheable memory.
pub fn make_mmio_spte<C: MmuContext + ?Sized>(
    masks: &MaskConfig,
    ctx: &C,
    gfn: Gfn,
    access: Access,
) -> Spte {
    let generation = ctx.memslot_generation() & MMIO_SPTE_GEN_MASK;

    if masks.mmio_value() == 0 {
        log::warn!("building MMIO entry for {} with MMIO caching disabled", gfn);
    }

    let access = access & masks.mmio_access_mask();
    let gpa = gfn.gpa();
    let rsvd = masks.nonpresent_or_rsvd_mask();

    let spte = generation_mmio_spte_mask(generation)
        | masks.mmio_value()
        | access.as_spte_bits()
        | gpa
        | rsvd
        | ((gpa & rsvd) << SHADOW_NONPRESENT_OR_RSVD_MASK_LEN);

    log::trace!("MMIO entry for {} generation {:#x}: {:#018x}", gfn, generation, spte);
    Spte::new(spte)
}

/// Recovers the GFN cached in an MMIO entry, undoing the L1TF relocation.
pub fn get_mmio_spte_gfn(masks: &MaskConfig, spte: Spte) -> Gfn {
    let raw = spte.raw();
    let gpa = (raw & masks.nonpresent_or_rsvd_lower_gfn_mask())
        | ((raw >> SHADOW_NONPRESENT_OR_RSVD_MASK_LEN) & masks.nonpresent_or_rsvd_mask());
    Gfn::new(gpa >> PAGE_SHIFT)
}

/// Recovers the access bits cached in an MMIO entry.
pub fn get_mmio_spte_access(masks: &MaskConfig, spte: Spte) -> Access {
    let cached = spte.raw() & masks.mmio_access_mask().as_spte_bits();
    Access::from_bits_truncate(cached as u8)
}

/// Checks an MMIO entry against the live memslot generation.
///
/// Always stale while a memslot update is in flight.
pub fn check_mmio_spte(spte: Spte, live_generation: u64) -> bool {
    if live_generation & MEMSLOT_GEN_UPDATE_IN_PROGRESS != 0 {
        return false;
    }

    let live = live_generation & MMIO_SPTE_GEN_MASK;
    let cached = get_mmio_spte_generation(spte);
    if live != cached {
        log::trace!("stale MMIO entry: generation {:#x}, live {:#x}", cached, live);
    }
    live == cached
}
