//! Runtime mask configuration.
//!
//! Which bits mean "accessed", "executable" or "MMIO" depends on the paging mode the
//! hardware gives us (legacy/NPT shadow paging or EPT) and on a handful of CPU features.
//! [`MaskConfig`] captures all of those decisions in one immutable value that is built
//! once during MMU initialization and then shared by every CPU walking shadow tables.

use core::fmt;

use crate::layout::{
    MAX_PHYS_BITS, PAGE_SHIFT, PT_ACCESSED_MASK, PT_DIRTY_MASK, PT_PRESENT_MASK, PT_USER_MASK,
    PT64_NX_MASK, REMOVED_SPTE, SHADOW_ACC_TRACK_SAVED_MASK, SHADOW_NONPRESENT_OR_RSVD_MASK_LEN,
    SPTE_BASE_ADDR_MASK, SPTE_MMU_PRESENT_MASK, SPTE_TDP_AD_MASK, DEFAULT_SPTE_HOST_WRITABLE,
    DEFAULT_SPTE_MMU_WRITABLE, EPT_SPTE_HOST_WRITABLE, EPT_SPTE_MMU_WRITABLE, VMX_EPT_ACCESS_BIT,
    VMX_EPT_DIRTY_BIT, VMX_EPT_EXECUTABLE_MASK, VMX_EPT_MISCONFIG_WX_VALUE,
    VMX_EPT_READABLE_MASK, VMX_EPT_RWX_MASK, genmask, rsvd_bits,
};
use crate::make::Access;

/// Errors produced when a mask configuration is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskError {
    /// A runtime mask claims the software present marker.
    OverlapsPresentBit,
    /// A runtime mask overlaps the bits that hold saved R/X permissions.
    SavedBitsOverlap,
    /// The access-track mask overlaps the L1TF reserved-address mask.
    AccessTrackOverlapsReservedMask,
    /// The host-writable and MMU-writable flags are missing, equal, or collide with
    /// another software field.
    WritableBitsOverlap,
    /// The MMIO value does not match its own mask.
    MmioValueOutsideMask,
    /// The MMIO value/mask pair would classify the removed sentinel as MMIO.
    MmioMatchesRemoved,
    /// The physical address width is outside what 64-bit paging can express.
    PhysicalBitsOutOfRange,
    /// A global configuration has already been installed.
    AlreadyInstalled,
}

impl fmt::Display for MaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OverlapsPresentBit => "mask overlaps the MMU-present bit",
            Self::SavedBitsOverlap => "mask overlaps the access-track saved bits",
            Self::AccessTrackOverlapsReservedMask => {
                "access-track mask overlaps the non-present reserved mask"
            }
            Self::WritableBitsOverlap => "host/MMU writable bits are invalid or overlap",
            Self::MmioValueOutsideMask => "MMIO value has bits outside the MMIO mask",
            Self::MmioMatchesRemoved => "MMIO value/mask would match the removed sentinel",
            Self::PhysicalBitsOutOfRange => "physical address width out of range",
            Self::AlreadyInstalled => "mask configuration already installed",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for MaskError {}

/// Which hardware page table format shadow entries are built in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Legacy x86-64 / NPT page table format.
    Shadow,
    /// Intel Extended Page Tables.
    Ept,
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shadow => f.write_str("shadow"),
            Self::Ept => f.write_str("ept"),
        }
    }
}

/// Hardware capabilities that influence the mask layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// Physical address width reported by CPUID.
    pub phys_bits: u8,
    /// Physical address width used to index the L1 data cache.
    pub cache_bits: u8,
    /// The CPU is affected by L1 Terminal Fault.
    pub l1tf: bool,
    /// Memory encryption bit (SME/MKTME), zero when unused.
    pub me_mask: u64,
    /// EPT supports hardware accessed/dirty bits.
    pub ept_ad_bits: bool,
    /// EPT supports execute-only mappings.
    pub ept_exec_only: bool,
    /// MMIO caching is allowed by the administrator.
    pub mmio_caching: bool,
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self {
            phys_bits: 46,
            cache_bits: 46,
            l1tf: false,
            me_mask: 0,
            ept_ad_bits: true,
            ept_exec_only: true,
            mmio_caching: true,
        }
    }
}

/// The complete runtime bit layout for shadow entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskConfig {
    mode: PagingMode,
    phys_bits: u8,
    user_mask: u64,
    accessed_mask: u64,
    dirty_mask: u64,
    nx_mask: u64,
    x_mask: u64,
    present_mask: u64,
    acc_track_mask: u64,
    me_mask: u64,
    host_writable_mask: u64,
    mmu_writable_mask: u64,
    nonpresent_or_rsvd_mask: u64,
    nonpresent_or_rsvd_lower_gfn_mask: u64,
    mmio_value: u64,
    mmio_mask: u64,
    mmio_access_mask: Access,
    mmio_caching_allowed: bool,
}

impl MaskConfig {
    /// Builds the legacy/NPT layout.
    ///
    /// This is also the starting point for EPT, which overrides most of the permission
    /// bits but keeps the L1TF and physical-width derived masks.
    pub fn shadow_paging(features: &CpuFeatures) -> Self {
        let mut phys_bits = features.phys_bits as u32;
        if phys_bits > MAX_PHYS_BITS || phys_bits <= PAGE_SHIFT {
            log::warn!("clamping physical address width {} to {}", phys_bits, MAX_PHYS_BITS);
            phys_bits = MAX_PHYS_BITS;
        }

        // With 46 or fewer cacheable address bits the CPU may leak L1 data through a
        // non-present entry, so the MMIO GPA is partly relocated above that range. CPUs
        // whose cache is addressed with more bits are assumed not to be vulnerable.
        let mut nonpresent_or_rsvd_mask = 0;
        let mut low_phys_bits = phys_bits;
        if features.l1tf {
            let cache_bits = features.cache_bits as u32;
            if cache_bits >= MAX_PHYS_BITS - SHADOW_NONPRESENT_OR_RSVD_MASK_LEN
                || cache_bits <= PAGE_SHIFT + SHADOW_NONPRESENT_OR_RSVD_MASK_LEN
            {
                log::warn!(
                    "L1TF mitigation skipped: unusable cache address width {}",
                    cache_bits
                );
            } else {
                low_phys_bits = cache_bits - SHADOW_NONPRESENT_OR_RSVD_MASK_LEN;
                nonpresent_or_rsvd_mask = rsvd_bits(low_phys_bits, cache_bits - 1);
            }
        }

        let mut me_mask = features.me_mask;
        if me_mask & !SPTE_BASE_ADDR_MASK != 0 {
            log::warn!("ignoring memory encryption mask {:#x} outside the frame field", me_mask);
            me_mask = 0;
        }

        let config = Self {
            mode: PagingMode::Shadow,
            phys_bits: phys_bits as u8,
            user_mask: PT_USER_MASK,
            accessed_mask: PT_ACCESSED_MASK,
            dirty_mask: PT_DIRTY_MASK,
            nx_mask: PT64_NX_MASK,
            x_mask: 0,
            present_mask: PT_PRESENT_MASK,
            acc_track_mask: 0,
            me_mask,
            host_writable_mask: DEFAULT_SPTE_HOST_WRITABLE,
            mmu_writable_mask: DEFAULT_SPTE_MMU_WRITABLE,
            nonpresent_or_rsvd_mask,
            nonpresent_or_rsvd_lower_gfn_mask: rsvd_bits(PAGE_SHIFT, low_phys_bits - 1),
            mmio_value: 0,
            mmio_mask: 0,
            mmio_access_mask: Access::empty(),
            mmio_caching_allowed: features.mmio_caching,
        };

        // A reserved physical address bit makes MMIO accesses fault with PFEC.RSVD. With
        // a full 52-bit physical address width no such bit exists, and caching is off.
        let mmio_mask = if phys_bits < MAX_PHYS_BITS {
            (1 << 51) | PT_PRESENT_MASK
        } else {
            0
        };

        let config = config.with_mmio_masks(mmio_mask, mmio_mask, Access::WRITE | Access::USER);
        debug_assert_eq!(config.validate(), Ok(()));
        config
    }

    /// Builds the EPT layout.
    pub fn ept(features: &CpuFeatures) -> Self {
        let base = Self::shadow_paging(features);
        let config = Self {
            mode: PagingMode::Ept,
            user_mask: VMX_EPT_READABLE_MASK,
            accessed_mask: if features.ept_ad_bits { VMX_EPT_ACCESS_BIT } else { 0 },
            dirty_mask: if features.ept_ad_bits { VMX_EPT_DIRTY_BIT } else { 0 },
            nx_mask: 0,
            x_mask: VMX_EPT_EXECUTABLE_MASK,
            present_mask: if features.ept_exec_only { 0 } else { VMX_EPT_READABLE_MASK },
            acc_track_mask: VMX_EPT_RWX_MASK,
            host_writable_mask: EPT_SPTE_HOST_WRITABLE,
            mmu_writable_mask: EPT_SPTE_MMU_WRITABLE,
            ..base
        };

        // Bits 2:0 == 110b (write/execute, not readable) is an EPT misconfiguration.
        let config = config.with_mmio_masks(VMX_EPT_MISCONFIG_WX_VALUE, VMX_EPT_RWX_MASK, Access::empty());
        debug_assert_eq!(config.validate(), Ok(()));
        config
    }

    /// Replaces the MMIO value, mask and cached access bits.
    ///
    /// MMIO caching is disabled (the value forced to zero) when the administrator turned
    /// it off, when the value collides with the relocated L1TF GFN bits, when the value
    /// doesn't match its own mask, or when the removed sentinel would be taken for MMIO.
    #[must_use]
    pub fn with_mmio_masks(mut self, mmio_value: u64, mmio_mask: u64, access: Access) -> Self {
        let mut value = mmio_value;

        if value & self.nonpresent_or_rsvd_lower_gfn_mask != 0 {
            log::warn!("MMIO value {:#x} overlaps the GFN field", value);
        }

        if !self.mmio_caching_allowed {
            value = 0;
        }

        if value & (self.nonpresent_or_rsvd_mask << SHADOW_NONPRESENT_OR_RSVD_MASK_LEN) != 0 {
            log::warn!(
                "MMIO value {:#x} collides with relocated GFN bits; caching disabled",
                value
            );
            value = 0;
        }

        if value & mmio_mask != value {
            log::warn!("MMIO value {:#x} does not match mask {:#x}", value, mmio_mask);
            value = 0;
        } else if value != 0 && REMOVED_SPTE & mmio_mask == value {
            log::warn!("MMIO value {:#x} would match the removed sentinel", value);
            value = 0;
        }

        self.mmio_value = value;
        self.mmio_mask = mmio_mask;
        self.mmio_access_mask = access;
        self
    }

    /// Checks the invariants that make the overlaid bit fields unambiguous.
    pub fn validate(&self) -> Result<(), MaskError> {
        let phys_bits = self.phys_bits as u32;
        if phys_bits <= PAGE_SHIFT || phys_bits > MAX_PHYS_BITS {
            return Err(MaskError::PhysicalBitsOutOfRange);
        }

        let runtime = [
            self.user_mask,
            self.accessed_mask,
            self.dirty_mask,
            self.nx_mask,
            self.x_mask,
            self.present_mask,
            self.acc_track_mask,
            self.me_mask,
            self.host_writable_mask,
            self.mmu_writable_mask,
            self.nonpresent_or_rsvd_mask,
        ];
        if runtime.iter().any(|mask| mask & SPTE_MMU_PRESENT_MASK != 0) {
            return Err(MaskError::OverlapsPresentBit);
        }

        if self.acc_track_mask & self.nonpresent_or_rsvd_mask != 0 {
            return Err(MaskError::AccessTrackOverlapsReservedMask);
        }
        if (self.acc_track_mask | self.nonpresent_or_rsvd_mask) & SHADOW_ACC_TRACK_SAVED_MASK != 0 {
            return Err(MaskError::SavedBitsOverlap);
        }

        let writable = self.host_writable_mask | self.mmu_writable_mask;
        if self.host_writable_mask == 0
            || self.mmu_writable_mask == 0
            || self.host_writable_mask & self.mmu_writable_mask != 0
            || writable & (SPTE_TDP_AD_MASK | SHADOW_ACC_TRACK_SAVED_MASK) != 0
        {
            return Err(MaskError::WritableBitsOverlap);
        }

        if self.mmio_value & self.mmio_mask != self.mmio_value {
            return Err(MaskError::MmioValueOutsideMask);
        }
        if self.mmio_value != 0 && REMOVED_SPTE & self.mmio_mask == self.mmio_value {
            return Err(MaskError::MmioMatchesRemoved);
        }

        Ok(())
    }

    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    pub const fn phys_bits(&self) -> u8 {
        self.phys_bits
    }

    pub const fn user_mask(&self) -> u64 {
        self.user_mask
    }

    pub const fn accessed_mask(&self) -> u64 {
        self.accessed_mask
    }

    pub const fn dirty_mask(&self) -> u64 {
        self.dirty_mask
    }

    pub const fn nx_mask(&self) -> u64 {
        self.nx_mask
    }

    pub const fn x_mask(&self) -> u64 {
        self.x_mask
    }

    pub const fn present_mask(&self) -> u64 {
        self.present_mask
    }

    pub const fn acc_track_mask(&self) -> u64 {
        self.acc_track_mask
    }

    pub const fn me_mask(&self) -> u64 {
        self.me_mask
    }

    /// Bits of a present entry that hold the host frame.
    ///
    /// The memory encryption bit sits inside the physical address range but is not
    /// part of the frame number.
    pub const fn base_addr_mask(&self) -> u64 {
        SPTE_BASE_ADDR_MASK & !self.me_mask
    }

    pub const fn host_writable_mask(&self) -> u64 {
        self.host_writable_mask
    }

    pub const fn mmu_writable_mask(&self) -> u64 {
        self.mmu_writable_mask
    }

    pub const fn nonpresent_or_rsvd_mask(&self) -> u64 {
        self.nonpresent_or_rsvd_mask
    }

    pub const fn nonpresent_or_rsvd_lower_gfn_mask(&self) -> u64 {
        self.nonpresent_or_rsvd_lower_gfn_mask
    }

    pub const fn mmio_value(&self) -> u64 {
        self.mmio_value
    }

    pub const fn mmio_mask(&self) -> u64 {
        self.mmio_mask
    }

    pub const fn mmio_access_mask(&self) -> Access {
        self.mmio_access_mask
    }

    /// Hardware accessed/dirty bits are available in this layout.
    pub const fn ad_supported(&self) -> bool {
        self.accessed_mask != 0
    }

    /// MMIO placeholders can be created.
    pub const fn mmio_caching_enabled(&self) -> bool {
        self.mmio_value != 0
    }

    /// Publishes `config` as the process-wide configuration.
    ///
    /// The configuration is validated first. Only the first successful call wins; later
    /// calls return [`MaskError::AlreadyInstalled`].
    pub fn install(config: MaskConfig) -> Result<&'static MaskConfig, MaskError> {
        config.validate()?;

        let mut installed = false;

        #[cfg(not(test))]
        let current = MASK_CONFIG.call_once(|| {
            installed = true;
            config
        });

        #[cfg(test)]
        let current = MASK_CONFIG.with(|m| {
            *m.call_once(|| {
                installed = true;
                std::boxed::Box::leak(std::boxed::Box::new(config))
            })
        });

        if !installed {
            return Err(MaskError::AlreadyInstalled);
        }

        log::debug!(
            "installed {} mask configuration: {} physical bits, MMIO value {:#x} mask {:#x}",
            current.mode,
            current.phys_bits,
            current.mmio_value,
            current.mmio_mask
        );
        Ok(current)
    }

    /// Returns the process-wide configuration.
    ///
    /// # Panics
    ///
    /// Panics if [`MaskConfig::install`] has not been called yet.
    pub fn current() -> &'static MaskConfig {
        Self::try_current()
            .expect("mask configuration not installed; call MaskConfig::install during MMU setup")
    }

    /// Returns the process-wide configuration if it has been installed.
    pub fn try_current() -> Option<&'static MaskConfig> {
        #[cfg(not(test))]
        {
            MASK_CONFIG.get()
        }

        #[cfg(test)]
        {
            MASK_CONFIG.with(|m| m.get().copied())
        }
    }
}

/// Builds a [`MaskConfig`] with an arbitrary layout.
///
/// Starts from the defaults of the chosen paging mode; [`MaskConfigBuilder::build`]
/// rejects layouts that break the overlay invariants instead of silently falling back.
#[derive(Debug, Clone, Copy)]
pub struct MaskConfigBuilder {
    config: MaskConfig,
}

impl MaskConfigBuilder {
    /// Starts from the defaults for `mode` on a CPU with default features.
    pub fn new(mode: PagingMode) -> Self {
        Self::with_features(mode, &CpuFeatures::default())
    }

    /// Starts from the defaults for `mode` on a CPU with `features`.
    pub fn with_features(mode: PagingMode, features: &CpuFeatures) -> Self {
        let config = match mode {
            PagingMode::Shadow => MaskConfig::shadow_paging(features),
            PagingMode::Ept => MaskConfig::ept(features),
        };
        Self { config }
    }

    pub fn accessed_dirty(mut self, accessed: u64, dirty: u64) -> Self {
        self.config.accessed_mask = accessed;
        self.config.dirty_mask = dirty;
        self
    }

    pub fn executable(mut self, x_mask: u64, nx_mask: u64) -> Self {
        self.config.x_mask = x_mask;
        self.config.nx_mask = nx_mask;
        self
    }

    pub fn user_mask(mut self, mask: u64) -> Self {
        self.config.user_mask = mask;
        self
    }

    pub fn present_mask(mut self, mask: u64) -> Self {
        self.config.present_mask = mask;
        self
    }

    pub fn acc_track_mask(mut self, mask: u64) -> Self {
        self.config.acc_track_mask = mask;
        self
    }

    pub fn me_mask(mut self, mask: u64) -> Self {
        self.config.me_mask = mask;
        self
    }

    pub fn writable(mut self, host: u64, mmu: u64) -> Self {
        self.config.host_writable_mask = host;
        self.config.mmu_writable_mask = mmu;
        self
    }

    /// Sets the L1TF reserved mask and the GFN bits below it.
    pub fn nonpresent_or_rsvd(mut self, mask: u64, lower_gfn_mask: u64) -> Self {
        self.config.nonpresent_or_rsvd_mask = mask;
        self.config.nonpresent_or_rsvd_lower_gfn_mask = lower_gfn_mask;
        self
    }

    /// Sets the MMIO value, mask and access bits verbatim.
    pub fn mmio(mut self, value: u64, mask: u64, access: Access) -> Self {
        self.config.mmio_value = value;
        self.config.mmio_mask = mask;
        self.config.mmio_access_mask = access;
        self
    }

    pub fn phys_bits(mut self, bits: u8) -> Self {
        self.config.phys_bits = bits;
        if (bits as u32) > PAGE_SHIFT && (bits as u32) <= MAX_PHYS_BITS {
            self.config.nonpresent_or_rsvd_lower_gfn_mask = genmask(bits as u32 - 1, PAGE_SHIFT);
        }
        self
    }

    pub fn build(self) -> Result<MaskConfig, MaskError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Global mask configuration.
///
/// Set once during MMU initialization. In test builds this is thread-local so each test
/// can install its own layout.
#[cfg(not(test))]
static MASK_CONFIG: spin::Once<MaskConfig> = spin::Once::new();

#[cfg(test)]
std::thread_local! {
    static MASK_CONFIG: spin::Once<&'static MaskConfig> = spin::Once::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    mod shadow_paging {
        use super::*;

        #[test]
        fn legacy_defaults() {
            let masks = MaskConfig::shadow_paging(&CpuFeatures::default());
            assert_eq!(masks.mode(), PagingMode::Shadow);
            assert_eq!(masks.present_mask(), PT_PRESENT_MASK);
            assert_eq!(masks.accessed_mask(), PT_ACCESSED_MASK);
            assert_eq!(masks.dirty_mask(), PT_DIRTY_MASK);
            assert_eq!(masks.nx_mask(), PT64_NX_MASK);
            assert_eq!(masks.x_mask(), 0);
            assert_eq!(masks.acc_track_mask(), 0);
            assert_eq!(masks.host_writable_mask(), DEFAULT_SPTE_HOST_WRITABLE);
            assert_eq!(masks.mmu_writable_mask(), DEFAULT_SPTE_MMU_WRITABLE);
            assert!(masks.ad_supported());
        }

        #[test]
        fn mmio_uses_reserved_bit_51() {
            let masks = MaskConfig::shadow_paging(&CpuFeatures::default());
            assert_eq!(masks.mmio_value(), (1 << 51) | 1);
            assert_eq!(masks.mmio_mask(), (1 << 51) | 1);
            assert_eq!(masks.mmio_access_mask(), Access::WRITE | Access::USER);
            assert!(masks.mmio_caching_enabled());
        }

        #[test]
        fn full_width_disables_mmio_caching() {
            let features = CpuFeatures { phys_bits: 52, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            assert_eq!(masks.mmio_value(), 0);
            assert!(!masks.mmio_caching_enabled());
        }

        #[test]
        fn administrator_can_disable_mmio_caching() {
            let features = CpuFeatures { mmio_caching: false, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            assert_eq!(masks.mmio_value(), 0);
        }

        #[test]
        fn lower_gfn_mask_without_l1tf() {
            let masks = MaskConfig::shadow_paging(&CpuFeatures::default());
            assert_eq!(masks.nonpresent_or_rsvd_mask(), 0);
            assert_eq!(masks.nonpresent_or_rsvd_lower_gfn_mask(), genmask(45, 12));
        }

        #[test]
        fn l1tf_relocates_top_cache_bits() {
            let features = CpuFeatures { l1tf: true, cache_bits: 44, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            assert_eq!(masks.nonpresent_or_rsvd_mask(), genmask(43, 39));
            assert_eq!(masks.nonpresent_or_rsvd_lower_gfn_mask(), genmask(38, 12));
        }

        #[test]
        fn encryption_bit_leaves_frame_field() {
            let features = CpuFeatures { me_mask: 1 << 47, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            assert_eq!(masks.me_mask(), 1 << 47);
            assert_eq!(masks.base_addr_mask(), SPTE_BASE_ADDR_MASK & !(1 << 47));

            let plain = MaskConfig::shadow_paging(&CpuFeatures::default());
            assert_eq!(plain.base_addr_mask(), SPTE_BASE_ADDR_MASK);
        }

        #[test]
        fn misplaced_encryption_bit_is_dropped() {
            for me_mask in [SPTE_MMU_PRESENT_MASK, 1 << 63] {
                let features = CpuFeatures { me_mask, ..CpuFeatures::default() };
                let masks = MaskConfig::shadow_paging(&features);
                assert_eq!(masks.me_mask(), 0);
                assert_eq!(masks.validate(), Ok(()));
                assert_eq!(MaskConfig::ept(&features).me_mask(), 0);
            }
        }

        #[test]
        fn l1tf_skipped_for_wide_cache() {
            let features = CpuFeatures { l1tf: true, cache_bits: 47, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            assert_eq!(masks.nonpresent_or_rsvd_mask(), 0);
        }
    }

    mod ept {
        use super::*;

        #[test]
        fn ept_overrides() {
            let masks = MaskConfig::ept(&CpuFeatures::default());
            assert_eq!(masks.mode(), PagingMode::Ept);
            assert_eq!(masks.user_mask(), VMX_EPT_READABLE_MASK);
            assert_eq!(masks.accessed_mask(), VMX_EPT_ACCESS_BIT);
            assert_eq!(masks.dirty_mask(), VMX_EPT_DIRTY_BIT);
            assert_eq!(masks.x_mask(), VMX_EPT_EXECUTABLE_MASK);
            assert_eq!(masks.nx_mask(), 0);
            assert_eq!(masks.present_mask(), 0);
            assert_eq!(masks.acc_track_mask(), VMX_EPT_RWX_MASK);
            assert_eq!(masks.host_writable_mask(), EPT_SPTE_HOST_WRITABLE);
            assert_eq!(masks.mmu_writable_mask(), EPT_SPTE_MMU_WRITABLE);
        }

        #[test]
        fn keeps_encryption_bit() {
            let features = CpuFeatures { me_mask: 1 << 47, ..CpuFeatures::default() };
            let masks = MaskConfig::ept(&features);
            assert_eq!(masks.me_mask(), 1 << 47);
            assert_eq!(masks.validate(), Ok(()));
        }

        #[test]
        fn without_ad_bits() {
            let features = CpuFeatures { ept_ad_bits: false, ..CpuFeatures::default() };
            let masks = MaskConfig::ept(&features);
            assert_eq!(masks.accessed_mask(), 0);
            assert_eq!(masks.dirty_mask(), 0);
            assert!(!masks.ad_supported());
        }

        #[test]
        fn without_exec_only_sets_readable() {
            let features = CpuFeatures { ept_exec_only: false, ..CpuFeatures::default() };
            let masks = MaskConfig::ept(&features);
            assert_eq!(masks.present_mask(), VMX_EPT_READABLE_MASK);
        }

        #[test]
        fn mmio_is_misconfiguration() {
            let masks = MaskConfig::ept(&CpuFeatures::default());
            assert_eq!(masks.mmio_value(), VMX_EPT_MISCONFIG_WX_VALUE);
            assert_eq!(masks.mmio_mask(), VMX_EPT_RWX_MASK);
            assert_eq!(masks.mmio_access_mask(), Access::empty());
        }
    }

    mod mmio_masks {
        use super::*;

        fn base() -> MaskConfig {
            MaskConfig::shadow_paging(&CpuFeatures::default())
        }

        #[test]
        fn value_outside_mask_disables_caching() {
            let masks = base().with_mmio_masks(0b110, 0b011, Access::empty());
            assert_eq!(masks.mmio_value(), 0);
            assert_eq!(masks.mmio_mask(), 0b011);
        }

        #[test]
        fn removed_sentinel_match_disables_caching() {
            // 0x5a0 & 0x0a0 == 0x0a0: the sentinel would look like MMIO.
            let masks = base().with_mmio_masks(0x0a0, 0x0a0, Access::empty());
            assert_eq!(masks.mmio_value(), 0);
        }

        #[test]
        fn relocated_gfn_collision_disables_caching() {
            let features = CpuFeatures { l1tf: true, cache_bits: 44, ..CpuFeatures::default() };
            let masks = MaskConfig::shadow_paging(&features);
            let relocated = masks.nonpresent_or_rsvd_mask() << SHADOW_NONPRESENT_OR_RSVD_MASK_LEN;
            let value = (relocated & relocated.wrapping_neg()) | 1;
            let masks = masks.with_mmio_masks(value, value, Access::empty());
            assert_eq!(masks.mmio_value(), 0);
        }

        #[test]
        fn valid_value_is_kept() {
            let masks = base().with_mmio_masks(0x6, 0x7, Access::WRITE);
            assert_eq!(masks.mmio_value(), 0x6);
            assert_eq!(masks.mmio_access_mask(), Access::WRITE);
        }
    }

    mod builder {
        use super::*;

        #[test]
        fn defaults_validate() {
            assert!(MaskConfigBuilder::new(PagingMode::Shadow).build().is_ok());
            assert!(MaskConfigBuilder::new(PagingMode::Ept).build().is_ok());
        }

        #[test]
        fn rejects_present_bit_overlap() {
            let result = MaskConfigBuilder::new(PagingMode::Ept)
                .acc_track_mask(VMX_EPT_RWX_MASK | SPTE_MMU_PRESENT_MASK)
                .build();
            assert_eq!(result, Err(MaskError::OverlapsPresentBit));
        }

        #[test]
        fn rejects_access_track_over_reserved() {
            let result = MaskConfigBuilder::new(PagingMode::Ept)
                .nonpresent_or_rsvd(0x4, genmask(45, 12))
                .build();
            assert_eq!(result, Err(MaskError::AccessTrackOverlapsReservedMask));
        }

        #[test]
        fn rejects_saved_bits_overlap() {
            let result = MaskConfigBuilder::new(PagingMode::Ept)
                .acc_track_mask(VMX_EPT_RWX_MASK | SHADOW_ACC_TRACK_SAVED_MASK)
                .build();
            assert_eq!(result, Err(MaskError::SavedBitsOverlap));
        }

        #[test]
        fn rejects_identical_writable_bits() {
            let result = MaskConfigBuilder::new(PagingMode::Shadow)
                .writable(DEFAULT_SPTE_HOST_WRITABLE, DEFAULT_SPTE_HOST_WRITABLE)
                .build();
            assert_eq!(result, Err(MaskError::WritableBitsOverlap));
        }

        #[test]
        fn rejects_mmio_value_outside_mask() {
            let result = MaskConfigBuilder::new(PagingMode::Shadow)
                .mmio(0x6, 0x3, Access::empty())
                .build();
            assert_eq!(result, Err(MaskError::MmioValueOutsideMask));
        }

        #[test]
        fn rejects_mmio_matching_removed() {
            let result = MaskConfigBuilder::new(PagingMode::Shadow)
                .mmio(0x0a0, 0x0a0, Access::empty())
                .build();
            assert_eq!(result, Err(MaskError::MmioMatchesRemoved));
        }

        #[test]
        fn rejects_bad_phys_bits() {
            let result = MaskConfigBuilder::new(PagingMode::Shadow).phys_bits(60).build();
            assert_eq!(result, Err(MaskError::PhysicalBitsOutOfRange));
        }

        #[test]
        fn accepts_custom_mmio() {
            let masks = MaskConfigBuilder::new(PagingMode::Shadow)
                .mmio(0x1230_0000_0000_0001, 0xFF30_0000_0000_0003, Access::empty())
                .build()
                .unwrap();
            assert_eq!(masks.mmio_value(), 0x1230_0000_0000_0001);
        }
    }

    mod global {
        use super::*;

        #[test]
        fn install_once() {
            assert!(MaskConfig::try_current().is_none());

            let masks = MaskConfig::ept(&CpuFeatures::default());
            let installed = MaskConfig::install(masks).unwrap();
            assert_eq!(*installed, masks);
            assert_eq!(*MaskConfig::current(), masks);

            let again = MaskConfig::install(MaskConfig::shadow_paging(&CpuFeatures::default()));
            assert_eq!(again, Err(MaskError::AlreadyInstalled));
            assert_eq!(MaskConfig::current().mode(), PagingMode::Ept);
        }

        #[test]
        fn install_rejects_invalid() {
            let invalid = MaskConfigBuilder::new(PagingMode::Shadow)
                .writable(0, DEFAULT_SPTE_MMU_WRITABLE)
                .config;
            assert_eq!(MaskConfig::install(invalid), Err(MaskError::WritableBitsOverlap));
            assert!(MaskConfig::try_current().is_none());
        }
    }
}
