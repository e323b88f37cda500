#![cfg_attr(not(test), no_std)]

//! # Shadow Page Table Entries (SPTE)
//!
//! Encoding and decoding of the 64-bit entries a hypervisor MMU installs in the page
//! tables the hardware walks on behalf of a guest. It provides:
//!
//! - The fixed bit layout, plus a runtime [`MaskConfig`] for legacy/NPT and EPT paging.
//! - Classifier predicates on [`Spte`] (present, MMIO, access-tracked, dirty, ...).
//! - Construction of leaf, non-leaf and MMIO entries.
//! - Access tracking for hardware without accessed/dirty bits.
//! - Atomic slots with the removed-entry protocol for concurrent updates.

mod access_track;
mod decode;
pub mod layout;
mod make;
mod masks;
mod mmio;
mod numbers;
mod slot;
mod spte;

pub use access_track::{mark_spte_for_access_track, restore_acc_track_spte};
pub use decode::{Decoded, HumanSpte, SpteKind};
pub use make::{
    Access, LeafMapping, MmuContext, SetSpteFlags, changed_pte_notifier_make_spte, make_nonleaf_spte,
    make_spte,
};
pub use masks::{CpuFeatures, MaskConfig, MaskConfigBuilder, MaskError, PagingMode};
pub use mmio::{
    check_mmio_spte, generation_mmio_spte_mask, get_mmio_spte_access, get_mmio_spte_gfn,
    get_mmio_spte_generation, make_mmio_spte,
};
pub use numbers::{Gfn, PageLevel, Pfn};
pub use slot::{SpteSlot, SpteTable, UpdateGuard};
pub use spte::{AdType, Spte};
