//! Atomic entry slots and the removed-entry update protocol.
//!
//! Slots are read without any lock by the fault fast path and by concurrent walkers. A
//! writer that needs more than a single atomic store to replace an entry (tearing down a
//! child table, for example) first parks [`Spte::REMOVED`] in the slot. Readers that see
//! the sentinel back off and retry; other writers wait until the final value lands.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::layout::{PT64_ENT_PER_PAGE, REMOVED_SPTE, pt64_index};
use crate::make::{LeafMapping, MmuContext, SetSpteFlags, make_spte};
use crate::masks::MaskConfig;
use crate::numbers::PageLevel;
use crate::spte::Spte;

/// One page table entry that may be shared with hardware and other CPUs.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct SpteSlot(AtomicU64);

impl SpteSlot {
    pub const fn new(spte: Spte) -> Self {
        Self(AtomicU64::new(spte.raw()))
    }

    /// Reads the current entry. May return [`Spte::REMOVED`].
    #[inline]
    pub fn load(&self) -> Spte {
        Spte::new(self.0.load(Ordering::Acquire))
    }

    /// Publishes `spte` into a slot no one else can be updating.
    ///
    /// A frozen slot belongs to the writer holding its [`UpdateGuard`]; storing over it
    /// would be undone when that guard restores the old entry.
    pub fn store(&self, spte: Spte) {
        debug_assert!(!spte.is_removed(), "removed sentinel stored outside an update");
        debug_assert!(!self.load().is_removed(), "store into a slot frozen by an update");
        self.0.store(spte.raw(), Ordering::Release);
    }

    /// Gives non-atomic access to the entry (by holding a mutable reference).
    pub fn get_mut(&mut self) -> &mut u64 {
        self.0.get_mut()
    }

    /// Replaces `current` with `new` if the slot still holds `current`.
    ///
    /// Returns the value found in the slot on failure. A frozen slot is never changed
    /// here; only the writer that froze it may publish its replacement.
    pub fn compare_exchange(&self, current: Spte, new: Spte) -> Result<Spte, Spte> {
        if current.is_removed() || new.is_removed() {
            return Err(self.load());
        }

        self.0
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(Spte::new)
            .map_err(Spte::new)
    }

    /// Freezes the slot for a multi-step update, waiting out any update already in
    /// flight.
    pub fn begin_update(&self) -> UpdateGuard<'_> {
        loop {
            let current = self.0.load(Ordering::Relaxed);
            if current == REMOVED_SPTE {
                core::hint::spin_loop();
                continue;
            }

            if self
                .0
                .compare_exchange_weak(current, REMOVED_SPTE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return UpdateGuard {
                    slot: self,
                    old: Spte::new(current),
                    committed: false,
                };
            }
        }
    }

    /// Freezes the slot only if it still holds `expected`.
    ///
    /// Returns the value found in the slot on failure.
    pub fn try_begin_update(&self, expected: Spte) -> Result<UpdateGuard<'_>, Spte> {
        if expected.is_removed() {
            return Err(self.load());
        }

        self.0
            .compare_exchange(expected.raw(), REMOVED_SPTE, Ordering::Acquire, Ordering::Acquire)
            .map(|_| UpdateGuard {
                slot: self,
                old: expected,
                committed: false,
            })
            .map_err(Spte::new)
    }

    /// Clears the slot, returning the entry it held.
    ///
    /// Observers see the removed sentinel before the slot becomes empty.
    pub fn zap(&self) -> Spte {
        let guard = self.begin_update();
        let old = guard.old();
        guard.commit(Spte::default());
        old
    }

    /// Replaces the entry, returning whether other CPUs must flush their TLBs.
    ///
    /// A flush is needed when the old entry could be made writable locklessly but the
    /// new one isn't writable, or when accessed or dirty state would be lost.
    pub fn update(&self, masks: &MaskConfig, new: Spte) -> bool {
        debug_assert!(!new.is_removed(), "removed sentinel stored outside an update");

        let old = loop {
            let current = self.0.load(Ordering::Relaxed);
            if current == REMOVED_SPTE {
                core::hint::spin_loop();
                continue;
            }

            if self
                .0
                .compare_exchange_weak(current, new.raw(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break Spte::new(current);
            }
        };

        if !old.is_shadow_present() {
            return false;
        }

        let new_present = new.is_shadow_present();
        let mut flush = false;

        if old.can_locklessly_be_made_writable(masks) && !new.is_writable() {
            flush = true;
        }

        if old.is_accessed(masks) && !(new_present && new.is_accessed(masks)) {
            flush = true;
        }

        if old.is_dirty(masks) && !(new_present && new.is_dirty(masks)) {
            flush = true;
        }

        if flush {
            log::trace!("{:?} -> {:?} needs a remote TLB flush", old, new);
        }
        flush
    }

    /// Builds and installs a leaf entry.
    ///
    /// `leaf.old_spte` is ignored and replaced by the slot's current value.
    pub fn set_spte<C: MmuContext + ?Sized>(
        &self,
        masks: &MaskConfig,
        ctx: &C,
        leaf: &LeafMapping,
    ) -> SetSpteFlags {
        let leaf = LeafMapping {
            old_spte: self.load(),
            ..*leaf
        };
        let (mut flags, spte) = make_spte(masks, ctx, &leaf);

        if leaf.old_spte == spte {
            flags |= SetSpteFlags::SPURIOUS;
        } else if self.update(masks, spte) {
            flags |= SetSpteFlags::NEED_REMOTE_TLB_FLUSH;
        }

        flags
    }
}

/// A slot frozen with the removed sentinel.
///
/// Dropping the guard without committing puts the old entry back.
#[must_use = "dropping the guard immediately restores the old entry"]
pub struct UpdateGuard<'a> {
    slot: &'a SpteSlot,
    old: Spte,
    committed: bool,
}

impl UpdateGuard<'_> {
    /// The entry the slot held before it was frozen.
    pub fn old(&self) -> Spte {
        self.old
    }

    /// Publishes the final entry and unfreezes the slot.
    pub fn commit(mut self, new: Spte) {
        debug_assert!(!new.is_removed(), "committing the removed sentinel");
        self.slot.0.store(new.raw(), Ordering::Release);
        self.committed = true;
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slot.0.store(self.old.raw(), Ordering::Release);
        }
    }
}

/// One shadow page table: a page worth of slots.
#[repr(C, align(4096))]
pub struct SpteTable([SpteSlot; PT64_ENT_PER_PAGE]);

impl SpteTable {
    /// Creates a table with every slot empty.
    pub const fn new() -> Self {
        Self([const { SpteSlot::new(Spte::new(0)) }; PT64_ENT_PER_PAGE])
    }

    /// The slot translating `address` at `level`.
    pub fn entry(&self, address: u64, level: PageLevel) -> &SpteSlot {
        &self.0[pt64_index(address, level.as_u8())]
    }

    /// Iterates over the populated slots, skipping empty and frozen ones.
    pub fn present(&self) -> impl Iterator<Item = (usize, Spte)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, slot.load()))
            .filter(|(_, spte)| spte.is_shadow_present())
    }
}

impl Default for SpteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PT_ACCESSED_MASK, PT_DIRTY_MASK, PT_WRITABLE_MASK, SPTE_MMU_PRESENT_MASK};
    use crate::make::Access;
    use crate::masks::CpuFeatures;
    use crate::numbers::{Gfn, Pfn};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct Mmu;

    impl MmuContext for Mmu {
        fn memslot_generation(&self) -> u64 {
            0
        }

        fn tdp_enabled(&self) -> bool {
            false
        }

        fn need_write_protect(&self, _gfn: Gfn, _can_unsync: bool) -> bool {
            false
        }
    }

    fn shadow() -> MaskConfig {
        MaskConfig::shadow_paging(&CpuFeatures::default())
    }

    fn present(bits: u64) -> Spte {
        Spte::new(SPTE_MMU_PRESENT_MASK | 0x1234_5000 | bits)
    }

    mod protocol {
        use super::*;

        #[test]
        fn guard_commit() {
            let slot = SpteSlot::new(present(0));
            let guard = slot.begin_update();
            assert_eq!(guard.old(), present(0));
            assert!(slot.load().is_removed());
            guard.commit(present(PT_WRITABLE_MASK));
            assert_eq!(slot.load(), present(PT_WRITABLE_MASK));
        }

        #[test]
        fn guard_drop_restores() {
            let slot = SpteSlot::new(present(0));
            {
                let _guard = slot.begin_update();
                assert!(slot.load().is_removed());
            }
            assert_eq!(slot.load(), present(0));
        }

        #[test]
        fn try_begin_update_checks_expected() {
            let slot = SpteSlot::new(present(0));
            assert_eq!(slot.try_begin_update(present(1)).err(), Some(present(0)));

            let guard = slot.try_begin_update(present(0)).unwrap();
            assert_eq!(slot.try_begin_update(present(0)).err(), Some(Spte::REMOVED));
            guard.commit(Spte::default());
            assert_eq!(slot.load(), Spte::default());
        }

        #[test]
        fn compare_exchange_refuses_frozen_slot() {
            let slot = SpteSlot::new(present(0));
            let guard = slot.begin_update();
            assert_eq!(slot.compare_exchange(Spte::REMOVED, present(1)), Err(Spte::REMOVED));
            assert_eq!(slot.compare_exchange(present(0), present(1)), Err(Spte::REMOVED));
            drop(guard);
            assert_eq!(slot.compare_exchange(present(0), present(1)), Ok(present(0)));
            assert_eq!(slot.load(), present(1));
        }

        #[test]
        #[cfg(debug_assertions)]
        #[should_panic(expected = "frozen by an update")]
        fn store_into_frozen_slot() {
            let slot = SpteSlot::new(present(0));
            let _guard = slot.begin_update();
            slot.store(present(PT_WRITABLE_MASK));
        }

        #[test]
        fn store_after_commit() {
            let slot = SpteSlot::new(present(0));
            slot.begin_update().commit(Spte::default());
            slot.store(present(PT_WRITABLE_MASK));
            assert_eq!(slot.load(), present(PT_WRITABLE_MASK));
        }

        #[test]
        fn zap_returns_old() {
            let slot = SpteSlot::new(present(0));
            assert_eq!(slot.zap(), present(0));
            assert_eq!(slot.load(), Spte::default());
        }

        #[test]
        fn get_mut() {
            let mut slot = SpteSlot::default();
            *slot.get_mut() = present(0).raw();
            assert_eq!(slot.load(), present(0));
        }
    }

    mod flush {
        use super::*;

        #[test]
        fn from_empty_never_flushes() {
            let masks = shadow();
            let slot = SpteSlot::default();
            assert!(!slot.update(&masks, present(PT_ACCESSED_MASK)));
        }

        #[test]
        fn losing_write_access() {
            let masks = shadow();
            let lockless = masks.host_writable_mask() | masks.mmu_writable_mask();
            let old = present(lockless | PT_WRITABLE_MASK | PT_ACCESSED_MASK | PT_DIRTY_MASK);
            let slot = SpteSlot::new(old);
            let new = present(masks.host_writable_mask() | PT_ACCESSED_MASK | PT_DIRTY_MASK);
            assert!(slot.update(&masks, new));
        }

        #[test]
        fn losing_accessed() {
            let masks = shadow();
            let slot = SpteSlot::new(present(PT_ACCESSED_MASK));
            assert!(slot.update(&masks, present(0)));
        }

        #[test]
        fn losing_dirty() {
            let masks = shadow();
            let slot = SpteSlot::new(present(PT_ACCESSED_MASK | PT_DIRTY_MASK));
            assert!(slot.update(&masks, present(PT_ACCESSED_MASK)));
        }

        #[test]
        fn adding_state_does_not_flush() {
            let masks = shadow();
            let slot = SpteSlot::new(present(0));
            assert!(!slot.update(&masks, present(PT_ACCESSED_MASK | PT_DIRTY_MASK)));
        }

        #[test]
        fn clearing_accessed_entry() {
            let masks = shadow();
            let slot = SpteSlot::new(present(PT_ACCESSED_MASK));
            assert!(slot.update(&masks, Spte::default()));
        }
    }

    mod set_spte {
        use super::*;

        #[test]
        fn spurious_and_flush() {
            let masks = shadow();
            let slot = SpteSlot::default();
            let leaf = LeafMapping::new(Gfn::new(1), Pfn::new(0x42), PageLevel::Level4K, Access::ALL);

            assert!(slot.set_spte(&masks, &Mmu, &leaf).is_empty());
            assert!(slot.load().is_writable());

            assert_eq!(slot.set_spte(&masks, &Mmu, &leaf), SetSpteFlags::SPURIOUS);

            let read_only = LeafMapping { access: Access::USER, ..leaf };
            assert_eq!(
                slot.set_spte(&masks, &Mmu, &read_only),
                SetSpteFlags::NEED_REMOTE_TLB_FLUSH
            );
            assert!(!slot.load().is_writable());
        }
    }

    mod table {
        use super::*;

        #[test]
        fn indexing() {
            let table = SpteTable::new();
            table.entry(0x0040_3000, PageLevel::Level4K).store(present(0));
            table.entry(0x0040_3000, PageLevel::Level2M).store(present(PT_WRITABLE_MASK));

            let populated: Vec<_> = table.present().collect();
            assert_eq!(populated.len(), 2);
            assert_eq!(populated[0], (2, present(PT_WRITABLE_MASK)));
            assert_eq!(populated[1], (3, present(0)));
        }
    }

    mod concurrency {
        use super::*;

        const THREADS: u64 = 4;
        const ROUNDS: u64 = 2_000;

        #[test]
        fn frozen_updates_are_exclusive() {
            let slot = Arc::new(SpteSlot::new(Spte::new(SPTE_MMU_PRESENT_MASK)));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    thread::spawn(move || {
                        let masks = shadow();
                        for _ in 0..ROUNDS {
                            let guard = slot.begin_update();
                            let next = Pfn::new(guard.old().pfn(&masks).as_u64() + 1);
                            guard.commit(Spte::new(SPTE_MMU_PRESENT_MASK | next.start()));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(slot.load().pfn(&shadow()), Pfn::new(THREADS * ROUNDS));
        }

        #[test]
        fn readers_see_old_new_or_removed() {
            let a = present(0);
            let b = present(PT_WRITABLE_MASK);
            let slot = Arc::new(SpteSlot::new(a));
            let done = Arc::new(AtomicBool::new(false));

            let readers: Vec<_> = (0..2)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    let done = Arc::clone(&done);
                    thread::spawn(move || {
                        while !done.load(Ordering::Acquire) {
                            let seen = slot.load();
                            assert!(seen == a || seen == b || seen.is_removed(), "{seen:?}");
                        }
                    })
                })
                .collect();

            for round in 0..ROUNDS {
                let guard = slot.begin_update();
                guard.commit(if round % 2 == 0 { b } else { a });
            }
            done.store(true, Ordering::Release);

            for reader in readers {
                reader.join().unwrap();
            }
        }

        #[test]
        fn compare_exchange_races() {
            let slot = Arc::new(SpteSlot::new(Spte::new(SPTE_MMU_PRESENT_MASK)));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            loop {
                                let current = slot.load();
                                if current.is_removed() {
                                    continue;
                                }
                                let next = Spte::new(current.raw() + (1 << 12));
                                if slot.compare_exchange(current, next).is_ok() {
                                    break;
                                }
                            }
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(slot.load().pfn(&shadow()), Pfn::new(THREADS * ROUNDS));
        }
    }
}
