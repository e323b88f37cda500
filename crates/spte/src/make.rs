//! Building new shadow entries.
//!
//! The bit-level encoding is owned by this crate, while policy questions (is the guest
//! page write-tracked? is the host frame MMIO? what memory type applies?) belong to the
//! surrounding MMU and are asked through [`MmuContext`].

use bitflags::bitflags;
use x86_64::structures::paging::{PhysFrame, Size4KiB};

use crate::access_track::mark_spte_for_access_track;
use crate::layout::{
    PT_PAGE_SIZE_MASK, PT_USER_MASK, PT_WRITABLE_MASK, SPTE_MMU_PRESENT_MASK, SPTE_TDP_AD_DISABLED_MASK,
    SPTE_TDP_AD_WRPROT_ONLY_MASK,
};
use crate::masks::MaskConfig;
use crate::numbers::{Gfn, PageLevel, Pfn};
use crate::spte::Spte;

bitflags! {
    /// Guest access rights requested for a mapping.
    ///
    /// The bit values line up with the legacy page table encoding (`WRITE` and `USER`
    /// are the hardware bits 1 and 2), which lets MMIO entries cache them verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const EXEC = 1 << 0;
        const WRITE = PT_WRITABLE_MASK as u8;
        const USER = PT_USER_MASK as u8;
        const ALL = Self::EXEC.bits() | Self::WRITE.bits() | Self::USER.bits();
    }
}

impl Access {
    /// The access bits positioned as they are cached in an entry.
    #[inline]
    pub const fn as_spte_bits(self) -> u64 {
        self.bits() as u64
    }
}

bitflags! {
    /// Outcome of building or installing a leaf entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SetSpteFlags: u32 {
        /// The guest page is write-tracked; write access was withheld.
        const WRITE_PROTECTED_PT = 1 << 0;
        /// Stale translations may be cached by other CPUs.
        const NEED_REMOTE_TLB_FLUSH = 1 << 1;
        /// The new entry equals the old one.
        const SPURIOUS = 1 << 2;
    }
}

/// Policy hooks supplied by the MMU that owns the shadow tables.
pub trait MmuContext {
    /// Current memslot generation, including the update-in-progress flag.
    fn memslot_generation(&self) -> u64;

    /// Two-dimensional paging is in use.
    fn tdp_enabled(&self) -> bool;

    /// Writes to `gfn` must keep faulting, for example because a shadowed guest page
    /// table lives there.
    fn need_write_protect(&self, gfn: Gfn, can_unsync: bool) -> bool;

    /// New leaves use the write-protect-only A/D encoding.
    fn ad_need_write_protect(&self) -> bool {
        false
    }

    /// Executable huge pages are split to work around the multihit erratum.
    fn nx_huge_pages_enabled(&self) -> bool {
        false
    }

    /// Memory-type bits for a TDP leaf mapping `gfn`.
    fn memory_type_mask(&self, _gfn: Gfn, _is_mmio: bool) -> u64 {
        0
    }

    /// The host frame is device memory rather than RAM.
    fn is_mmio_pfn(&self, _pfn: Pfn) -> bool {
        false
    }
}

impl<T: MmuContext + ?Sized> MmuContext for &T {
    fn memslot_generation(&self) -> u64 {
        (**self).memslot_generation()
    }

    fn tdp_enabled(&self) -> bool {
        (**self).tdp_enabled()
    }

    fn need_write_protect(&self, gfn: Gfn, can_unsync: bool) -> bool {
        (**self).need_write_protect(gfn, can_unsync)
    }

    fn ad_need_write_protect(&self) -> bool {
        (**self).ad_need_write_protect()
    }

    fn nx_huge_pages_enabled(&self) -> bool {
        (**self).nx_huge_pages_enabled()
    }

    fn memory_type_mask(&self, gfn: Gfn, is_mmio: bool) -> u64 {
        (**self).memory_type_mask(gfn, is_mmio)
    }

    fn is_mmio_pfn(&self, pfn: Pfn) -> bool {
        (**self).is_mmio_pfn(pfn)
    }
}

/// Everything needed to build one leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMapping {
    pub gfn: Gfn,
    pub pfn: Pfn,
    pub level: PageLevel,
    pub access: Access,
    /// The entry currently in the slot.
    pub old_spte: Spte,
    /// Prefetched rather than faulted in; created without the accessed state.
    pub speculative: bool,
    /// The guest page may be left writable while its shadow is out of sync.
    pub can_unsync: bool,
    /// The host mapping allows writes.
    pub host_writable: bool,
    /// The owning shadow page doesn't use hardware A/D bits.
    pub ad_disabled: bool,
}

impl LeafMapping {
    /// A faulted-in, host-writable mapping replacing an empty slot.
    pub const fn new(gfn: Gfn, pfn: Pfn, level: PageLevel, access: Access) -> Self {
        Self {
            gfn,
            pfn,
            level,
            access,
            old_spte: Spte::new(0),
            speculative: false,
            can_unsync: true,
            host_writable: true,
            ad_disabled: false,
        }
    }
}

/// Builds a leaf entry mapping `leaf.gfn` to `leaf.pfn`.
///
/// Returns the entry together with [`SetSpteFlags::WRITE_PROTECTED_PT`] if write access
/// was requested but withheld because the guest page is write-tracked.
pub fn make_spte<C: MmuContext + ?Sized>(
    masks: &MaskConfig,
    ctx: &C,
    leaf: &LeafMapping,
) -> (SetSpteFlags, Spte) {
    let level = leaf.level;
    let mut access = leaf.access;
    let mut flags = SetSpteFlags::empty();
    let mut spte = SPTE_MMU_PRESENT_MASK;

    if leaf.ad_disabled {
        spte |= SPTE_TDP_AD_DISABLED_MASK;
    } else if ctx.ad_need_write_protect() {
        spte |= SPTE_TDP_AD_WRPROT_ONLY_MASK;
    }

    // With EPT execute-only support the present mask is zero and readability comes from
    // the user mask instead.
    spte |= masks.present_mask();
    if !leaf.speculative {
        spte |= Spte::new(spte).shadow_accessed_mask(masks);
    }

    if level > PageLevel::Level4K && access.contains(Access::EXEC) && ctx.nx_huge_pages_enabled() {
        access.remove(Access::EXEC);
    }

    if access.contains(Access::EXEC) {
        spte |= masks.x_mask();
    } else {
        spte |= masks.nx_mask();
    }

    if access.contains(Access::USER) {
        spte |= masks.user_mask();
    }

    if level > PageLevel::Level4K {
        spte |= PT_PAGE_SIZE_MASK;
    }

    let is_mmio_pfn = ctx.is_mmio_pfn(leaf.pfn);
    if ctx.tdp_enabled() {
        spte |= ctx.memory_type_mask(leaf.gfn, is_mmio_pfn);
    }

    if leaf.host_writable {
        spte |= masks.host_writable_mask();
    } else {
        access.remove(Access::WRITE);
    }

    if !is_mmio_pfn {
        spte |= masks.me_mask();
    }

    debug_assert_eq!(
        leaf.pfn.start() & !masks.base_addr_mask(),
        0,
        "{:?} does not fit the frame field",
        leaf.pfn
    );
    spte |= leaf.pfn.start();

    let spte = 'build: {
        if access.contains(Access::WRITE) {
            spte |= PT_WRITABLE_MASK | masks.mmu_writable_mask();

            // Re-syncing a page that was already writable: the unsync decision was made
            // when it first became writable.
            if !leaf.can_unsync && leaf.old_spte.is_writable() {
                break 'build Spte::new(spte);
            }

            if ctx.need_write_protect(leaf.gfn, leaf.can_unsync) {
                log::trace!("write-protecting {} at level {}", leaf.gfn, level);
                flags |= SetSpteFlags::WRITE_PROTECTED_PT;
                access.remove(Access::WRITE);
                spte &= !(PT_WRITABLE_MASK | masks.mmu_writable_mask());
            }
        }

        if access.contains(Access::WRITE) {
            spte |= Spte::new(spte).shadow_dirty_mask(masks);
        }

        let spte = Spte::new(spte);
        if leaf.speculative {
            mark_spte_for_access_track(masks, spte)
        } else {
            spte
        }
    };

    (flags, spte)
}

/// Builds a non-leaf entry pointing at the child table in `child`.
///
/// Non-leaf entries grant everything; permissions are enforced at the leaves.
pub fn make_nonleaf_spte(masks: &MaskConfig, child: PhysFrame<Size4KiB>, ad_disabled: bool) -> Spte {
    let mut spte = SPTE_MMU_PRESENT_MASK;

    spte |= child.start_address().as_u64()
        | masks.present_mask()
        | PT_WRITABLE_MASK
        | masks.user_mask()
        | masks.x_mask()
        | masks.me_mask();

    if ad_disabled {
        spte |= SPTE_TDP_AD_DISABLED_MASK;
    } else {
        spte |= masks.accessed_mask();
    }

    Spte::new(spte)
}

/// Rebuilds `old_spte` for a host page that moved to `new_pfn`.
///
/// The new entry is read-only (the host copy-on-write path will fault writes back in)
/// and access-tracked. The encryption bit of the old entry is kept.
pub fn changed_pte_notifier_make_spte(masks: &MaskConfig, old_spte: Spte, new_pfn: Pfn) -> Spte {
    debug_assert!(old_spte.is_shadow_present(), "remapping non-present {:?}", old_spte);

    let spte = old_spte
        .without(masks.base_addr_mask())
        .with(new_pfn.start())
        .without(PT_WRITABLE_MASK | masks.host_writable_mask());

    mark_spte_for_access_track(masks, spte)
}
