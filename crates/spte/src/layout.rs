//! Bit layout of a shadow page table entry.
//!
//! Every mask and shift used by the codec is defined here, once. Hardware bits come
//! from the x86_64 crate's page table flags (legacy/NPT format) or the EPT format;
//! software-only bits live in positions the hardware ignores. The same physical bit
//! can mean different things depending on whether an entry is present, access-tracked
//! or an MMIO placeholder; the `const` assertions at the bottom of this file fail the
//! build if two pieces of state that can coexist ever share a bit.

use x86_64::structures::paging::PageTableFlags;

/// Creates a mask with bits `low..=high` set.
#[inline]
pub const fn genmask(high: u32, low: u32) -> u64 {
    (u64::MAX >> (63 - high)) & (u64::MAX << low)
}

/// Creates a mask covering the reserved bits `low..=high` (alias of [`genmask`] with the
/// argument order used by the reserved-bit tables).
#[inline]
pub const fn rsvd_bits(low: u32, high: u32) -> u64 {
    if high < low {
        return 0;
    }
    genmask(high, low)
}

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Largest physical address width any supported paging mode can express.
pub const MAX_PHYS_BITS: u32 = 52;

/// Software-defined "this slot is populated" marker.
///
/// Bit 11 is ignored by hardware in every 64-bit paging format, so it is free for the MMU
/// to claim. It is the authoritative present check; hardware present/readable bits are not.
pub const SPTE_MMU_PRESENT_MASK: u64 = PageTableFlags::BIT_11.bits();

// A/D tracking type, stored in two ignored high bits.
pub const SPTE_TDP_AD_SHIFT: u32 = 52;
pub const SPTE_TDP_AD_MASK: u64 = 3 << SPTE_TDP_AD_SHIFT;
pub const SPTE_TDP_AD_ENABLED_MASK: u64 = 0 << SPTE_TDP_AD_SHIFT;
pub const SPTE_TDP_AD_DISABLED_MASK: u64 = 1 << SPTE_TDP_AD_SHIFT;
pub const SPTE_TDP_AD_WRPROT_ONLY_MASK: u64 = 2 << SPTE_TDP_AD_SHIFT;

// Legacy / NPT hardware bits.
pub const PT_PRESENT_MASK: u64 = PageTableFlags::PRESENT.bits();
pub const PT_WRITABLE_MASK: u64 = PageTableFlags::WRITABLE.bits();
pub const PT_USER_MASK: u64 = PageTableFlags::USER_ACCESSIBLE.bits();
pub const PT_ACCESSED_MASK: u64 = PageTableFlags::ACCESSED.bits();
pub const PT_DIRTY_MASK: u64 = PageTableFlags::DIRTY.bits();
pub const PT_PAGE_SIZE_MASK: u64 = PageTableFlags::HUGE_PAGE.bits();
pub const PT64_NX_MASK: u64 = PageTableFlags::NO_EXECUTE.bits();

// EPT hardware bits.
pub const VMX_EPT_READABLE_MASK: u64 = 1 << 0;
pub const VMX_EPT_WRITABLE_MASK: u64 = 1 << 1;
pub const VMX_EPT_EXECUTABLE_MASK: u64 = 1 << 2;
pub const VMX_EPT_RWX_MASK: u64 =
    VMX_EPT_READABLE_MASK | VMX_EPT_WRITABLE_MASK | VMX_EPT_EXECUTABLE_MASK;
pub const VMX_EPT_ACCESS_BIT: u64 = 1 << 8;
pub const VMX_EPT_DIRTY_BIT: u64 = 1 << 9;

/// Write+execute without read is an EPT misconfiguration, which is exactly what an MMIO
/// placeholder wants: the access exits instead of faulting.
pub const VMX_EPT_MISCONFIG_WX_VALUE: u64 = VMX_EPT_WRITABLE_MASK | VMX_EPT_EXECUTABLE_MASK;

/// Physical frame field, bits 12..=51.
pub const SPTE_BASE_ADDR_MASK: u64 = genmask(MAX_PHYS_BITS - 1, PAGE_SHIFT);

pub const PT64_LEVEL_BITS: u32 = 9;
pub const PT64_ENT_PER_PAGE: usize = 1 << PT64_LEVEL_BITS;

/// Shift of the address bits translated by a table at `level` (level 1 = 4K).
#[inline]
pub const fn pt64_level_shift(level: u8) -> u32 {
    PAGE_SHIFT + (level as u32 - 1) * PT64_LEVEL_BITS
}

/// Index of `address` within a table at `level`.
#[inline]
pub const fn pt64_index(address: u64, level: u8) -> usize {
    ((address >> pt64_level_shift(level)) & (PT64_ENT_PER_PAGE as u64 - 1)) as usize
}

/// Mask of the address bits that are an offset within a page mapped at `level`.
#[inline]
pub const fn pt64_level_offset_mask(level: u8) -> u64 {
    (1 << pt64_level_shift(level)) - 1
}

// Access tracking: original R/X bits are parked in the high ignored bits while the
// entry is made non-accessible.
pub const SHADOW_ACC_TRACK_SAVED_BITS_MASK: u64 = VMX_EPT_READABLE_MASK | VMX_EPT_EXECUTABLE_MASK;
pub const SHADOW_ACC_TRACK_SAVED_BITS_SHIFT: u32 = 54;
pub const SHADOW_ACC_TRACK_SAVED_MASK: u64 =
    SHADOW_ACC_TRACK_SAVED_BITS_MASK << SHADOW_ACC_TRACK_SAVED_BITS_SHIFT;

// Lockless-writable flags. Legacy paging has bits 9 and 10 free; EPT uses them for A/D
// so the flags move up next to the saved bits.
pub const DEFAULT_SPTE_HOST_WRITABLE: u64 = PageTableFlags::BIT_9.bits();
pub const DEFAULT_SPTE_MMU_WRITABLE: u64 = PageTableFlags::BIT_10.bits();
pub const EPT_SPTE_HOST_WRITABLE: u64 = 1 << 57;
pub const EPT_SPTE_MMU_WRITABLE: u64 = 1 << 58;

// The MMIO generation is a 19 bit subset of the memslot generation:
//   bits 0-7  -> spte bits 3-10
//   bits 8-18 -> spte bits 52-62
// The update-in-progress flag of the memslot generation is deliberately not stored; it
// is checked against the live generation instead.
pub const MMIO_SPTE_GEN_LOW_START: u32 = 3;
pub const MMIO_SPTE_GEN_LOW_END: u32 = 10;
pub const MMIO_SPTE_GEN_HIGH_START: u32 = 52;
pub const MMIO_SPTE_GEN_HIGH_END: u32 = 62;

pub const MMIO_SPTE_GEN_LOW_MASK: u64 = genmask(MMIO_SPTE_GEN_LOW_END, MMIO_SPTE_GEN_LOW_START);
pub const MMIO_SPTE_GEN_HIGH_MASK: u64 = genmask(MMIO_SPTE_GEN_HIGH_END, MMIO_SPTE_GEN_HIGH_START);

pub const MMIO_SPTE_GEN_LOW_BITS: u32 = MMIO_SPTE_GEN_LOW_END - MMIO_SPTE_GEN_LOW_START + 1;
pub const MMIO_SPTE_GEN_HIGH_BITS: u32 = MMIO_SPTE_GEN_HIGH_END - MMIO_SPTE_GEN_HIGH_START + 1;

pub const MMIO_SPTE_GEN_LOW_SHIFT: u32 = MMIO_SPTE_GEN_LOW_START;
pub const MMIO_SPTE_GEN_HIGH_SHIFT: u32 = MMIO_SPTE_GEN_HIGH_START - MMIO_SPTE_GEN_LOW_BITS;

pub const MMIO_SPTE_GEN_MASK: u64 = genmask(MMIO_SPTE_GEN_LOW_BITS + MMIO_SPTE_GEN_HIGH_BITS - 1, 0);

/// Set in a memslot generation while a memslot update is in flight.
pub const MEMSLOT_GEN_UPDATE_IN_PROGRESS: u64 = 1 << 63;

/// Number of GPA bits relocated above the cache-addressable range when the L1TF
/// mitigation is active.
pub const SHADOW_NONPRESENT_OR_RSVD_MASK_LEN: u32 = 5;

/// Transient placeholder published while an entry is being replaced.
///
/// The value sets no RWX bit, no frame bit and not the present marker, so a CPU (or a
/// hardware walker) that loads it mid-update treats the slot as non-present.
pub const REMOVED_SPTE: u64 = 0x5a0;

const fn disjoint(masks: &[u64]) -> bool {
    let mut i = 0;
    while i < masks.len() {
        let mut j = i + 1;
        while j < masks.len() {
            if masks[i] & masks[j] != 0 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(SPTE_TDP_AD_ENABLED_MASK == 0);
const _: () = assert!(MMIO_SPTE_GEN_LOW_BITS == 8 && MMIO_SPTE_GEN_HIGH_BITS == 11);
const _: () = assert!(MMIO_SPTE_GEN_MASK == 0x7_FFFF);
const _: () = assert!(
    SPTE_MMU_PRESENT_MASK & (MMIO_SPTE_GEN_LOW_MASK | MMIO_SPTE_GEN_HIGH_MASK) == 0
);
const _: () = assert!(MMIO_SPTE_GEN_LOW_MASK & MMIO_SPTE_GEN_HIGH_MASK == 0);
const _: () = assert!(REMOVED_SPTE & SPTE_MMU_PRESENT_MASK == 0);
const _: () = assert!(REMOVED_SPTE & (VMX_EPT_RWX_MASK | PT_PRESENT_MASK | PT_WRITABLE_MASK) == 0);
const _: () = assert!(REMOVED_SPTE & SPTE_BASE_ADDR_MASK == 0);
const _: () = assert!(disjoint(&[
    SPTE_MMU_PRESENT_MASK,
    SHADOW_ACC_TRACK_SAVED_MASK,
    SPTE_TDP_AD_MASK,
    EPT_SPTE_HOST_WRITABLE,
    EPT_SPTE_MMU_WRITABLE,
]));
const _: () = assert!(disjoint(&[
    SPTE_MMU_PRESENT_MASK,
    DEFAULT_SPTE_HOST_WRITABLE,
    DEFAULT_SPTE_MMU_WRITABLE,
    SPTE_TDP_AD_MASK,
    SHADOW_ACC_TRACK_SAVED_MASK,
]));
const _: () = assert!(SHADOW_ACC_TRACK_SAVED_MASK & SPTE_BASE_ADDR_MASK == 0);
const _: () = assert!(SPTE_TDP_AD_MASK & SPTE_BASE_ADDR_MASK == 0);
