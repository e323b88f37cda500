//! The shadow page table entry and its classifier predicates.

use core::fmt;

use crate::layout::{
    PAGE_SHIFT, PT_PAGE_SIZE_MASK, PT_WRITABLE_MASK, REMOVED_SPTE, SPTE_MMU_PRESENT_MASK,
    SPTE_TDP_AD_DISABLED_MASK, SPTE_TDP_AD_ENABLED_MASK, SPTE_TDP_AD_MASK,
    SPTE_TDP_AD_WRPROT_ONLY_MASK,
};
use crate::masks::MaskConfig;
use crate::mmio;
use crate::numbers::{PageLevel, Pfn};

/// A single shadow page table entry.
///
/// The raw value is exactly what sits in the hardware page table, so this type never
/// carries any interpretation of its own. Whether an entry is present, an MMIO
/// placeholder, access-tracked or the removed sentinel is decided by the predicates
/// below, some of which need the active [`MaskConfig`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Spte(u64);

/// How accessed/dirty state is tracked for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdType {
    /// Hardware A/D bits are authoritative.
    Enabled,
    /// No hardware A/D bits; access is tracked by making the entry inaccessible.
    Disabled,
    /// Hardware A/D bits exist but writes must still fault.
    WriteProtectOnly,
    /// Encoding 3 is never produced.
    Reserved,
}

impl Spte {
    /// The removed sentinel.
    pub const REMOVED: Spte = Spte(REMOVED_SPTE);

    /// Wraps a raw entry value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns this entry with `mask` set.
    #[inline]
    pub const fn with(self, mask: u64) -> Self {
        Self(self.0 | mask)
    }

    /// Returns this entry with `mask` cleared.
    #[inline]
    pub const fn without(self, mask: u64) -> Self {
        Self(self.0 & !mask)
    }

    /// Exact match with the removed sentinel. A value differing in any bit is not removed.
    #[inline]
    pub const fn is_removed(self) -> bool {
        self.0 == REMOVED_SPTE
    }

    /// The slot holds a populated entry (present or access-tracked).
    #[inline]
    pub const fn is_shadow_present(self) -> bool {
        self.0 & SPTE_MMU_PRESENT_MASK != 0
    }

    /// Decodes the A/D-type field.
    #[inline]
    pub const fn ad_type(self) -> AdType {
        match self.0 & SPTE_TDP_AD_MASK {
            SPTE_TDP_AD_ENABLED_MASK => AdType::Enabled,
            SPTE_TDP_AD_DISABLED_MASK => AdType::Disabled,
            SPTE_TDP_AD_WRPROT_ONLY_MASK => AdType::WriteProtectOnly,
            _ => AdType::Reserved,
        }
    }

    /// Hardware A/D bits are usable for this entry.
    ///
    /// Only meaningful for present entries; the A/D field of a non-present entry holds
    /// unrelated data (for example MMIO generation bits).
    #[inline]
    pub fn ad_enabled(self) -> bool {
        debug_assert!(self.is_shadow_present(), "A/D query on non-present spte {:?}", self);
        self.0 & SPTE_TDP_AD_MASK != SPTE_TDP_AD_DISABLED_MASK
    }

    /// Writes to this entry must be intercepted.
    ///
    /// True for both the disabled and the write-protect-only encodings, which is why this
    /// compares against the enabled encoding rather than negating [`Spte::ad_enabled`].
    #[inline]
    pub fn ad_need_write_protect(self) -> bool {
        debug_assert!(self.is_shadow_present(), "A/D query on non-present spte {:?}", self);
        self.0 & SPTE_TDP_AD_MASK != SPTE_TDP_AD_ENABLED_MASK
    }

    /// The page-size bit is set.
    #[inline]
    pub const fn is_large(self) -> bool {
        self.0 & PT_PAGE_SIZE_MASK != 0
    }

    /// The entry maps a page rather than pointing at a child table.
    #[inline]
    pub const fn is_last(self, level: PageLevel) -> bool {
        level.is_leaf_only() || self.is_large()
    }

    /// The hardware writable bit is set.
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & PT_WRITABLE_MASK != 0
    }

    /// Host frame held in the physical address field, without the encryption bit.
    #[inline]
    pub const fn pfn(self, masks: &MaskConfig) -> Pfn {
        Pfn::new((self.0 & masks.base_addr_mask()) >> PAGE_SHIFT)
    }

    /// The MMIO generation embedded in this entry. Only meaningful for MMIO entries.
    #[inline]
    pub const fn mmio_generation(self) -> u64 {
        mmio::get_mmio_spte_generation(self)
    }

    /// The entry is an MMIO placeholder.
    ///
    /// A zero MMIO value means MMIO caching is disabled; without that check every zeroed
    /// slot would look like MMIO.
    #[inline]
    pub const fn is_mmio(self, masks: &MaskConfig) -> bool {
        self.0 & masks.mmio_mask() == masks.mmio_value() && masks.mmio_value() != 0
    }

    /// The accessed bit to use for this entry, zero if A/D is disabled for it.
    #[inline]
    pub fn shadow_accessed_mask(self, masks: &MaskConfig) -> u64 {
        if self.ad_enabled() {
            masks.accessed_mask()
        } else {
            0
        }
    }

    /// The dirty bit to use for this entry, zero if A/D is disabled for it.
    #[inline]
    pub fn shadow_dirty_mask(self, masks: &MaskConfig) -> u64 {
        if self.ad_enabled() {
            masks.dirty_mask()
        } else {
            0
        }
    }

    /// The entry has been made inaccessible to emulate an accessed bit.
    #[inline]
    pub fn is_access_track(self, masks: &MaskConfig) -> bool {
        !self.ad_enabled() && self.0 & masks.acc_track_mask() == 0
    }

    /// Execute permission is granted: the X bit (if any) is set and NX is clear.
    #[inline]
    pub const fn is_executable(self, masks: &MaskConfig) -> bool {
        self.0 & (masks.x_mask() | masks.nx_mask()) == masks.x_mask()
    }

    /// The entry has been accessed since it was last aged.
    ///
    /// Without hardware A/D bits, "accessed" means "not access-tracked".
    #[inline]
    pub fn is_accessed(self, masks: &MaskConfig) -> bool {
        let accessed_mask = self.shadow_accessed_mask(masks);
        if accessed_mask != 0 {
            self.0 & accessed_mask != 0
        } else {
            !self.is_access_track(masks)
        }
    }

    /// The entry may have been written through.
    ///
    /// Without hardware A/D bits any writable entry is assumed dirty.
    #[inline]
    pub fn is_dirty(self, masks: &MaskConfig) -> bool {
        let dirty_mask = self.shadow_dirty_mask(masks);
        if dirty_mask != 0 {
            self.0 & dirty_mask != 0
        } else {
            self.is_writable()
        }
    }

    /// Write access can be restored without taking the MMU lock.
    ///
    /// Requires both the host-writable and the MMU-writable flag.
    #[inline]
    pub const fn can_locklessly_be_made_writable(self, masks: &MaskConfig) -> bool {
        let both = masks.host_writable_mask() | masks.mmu_writable_mask();
        self.0 & both == both
    }

    /// Bits of this entry can change underneath a writer that holds the MMU lock,
    /// either by hardware setting A/D bits or by the lockless fast path.
    pub fn has_volatile_bits(self, masks: &MaskConfig) -> bool {
        if !self.is_shadow_present() {
            return false;
        }

        if self.can_locklessly_be_made_writable(masks) || self.is_access_track(masks) {
            return true;
        }

        if self.ad_enabled() {
            let not_accessed = self.0 & masks.accessed_mask() == 0;
            let writable_not_dirty = self.is_writable() && self.0 & masks.dirty_mask() == 0;
            return not_accessed || writable_not_dirty;
        }

        false
    }
}

impl fmt::Debug for Spte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spte({:#018x})", self.0)
    }
}

impl From<u64> for Spte {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Spte> for u64 {
    #[inline]
    fn from(spte: Spte) -> Self {
        spte.0
    }
}
