//! Human-readable rendering of shadow entries.

use core::fmt;

use crate::masks::{MaskConfig, PagingMode};
use crate::mmio::{get_mmio_spte_access, get_mmio_spte_gfn};
use crate::numbers::PageLevel;
use crate::spte::{AdType, Spte};

/// Wraps a raw entry and formats it as an uppercase hexadecimal value with `0x` prefix
/// and `_` digit separators every 4 digits.
///
/// # Examples
///
/// ```
/// use spte::HumanSpte;
///
/// assert_eq!(format!("{}", HumanSpte(0x0)), "0x0");
/// assert_eq!(format!("{}", HumanSpte(0x5A0)), "0x5A0");
/// assert_eq!(format!("{}", HumanSpte(0x8000_0000_1234_5867)), "0x8000_0000_1234_5867");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HumanSpte(pub u64);

impl From<Spte> for HumanSpte {
    #[inline]
    fn from(spte: Spte) -> Self {
        Self(spte.raw())
    }
}

impl fmt::Display for HumanSpte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        if value == 0 {
            return write!(f, "0x0");
        }

        write!(f, "0x")?;

        let bits = u64::BITS - value.leading_zeros();
        let num_digits = bits.div_ceil(4);

        for index in 0..num_digits {
            let remaining = num_digits - index;
            if index != 0 && remaining % 4 == 0 {
                write!(f, "_")?;
            }

            let digit = ((value >> ((remaining - 1) * 4)) & 0xF) as u8;
            let c = if digit < 10 {
                b'0' + digit
            } else {
                b'A' + (digit - 10)
            };
            write!(f, "{}", c as char)?;
        }

        Ok(())
    }
}

/// What a raw entry represents under a given mask layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpteKind {
    /// Zero or otherwise unpopulated.
    NotPresent,
    /// Frozen by an in-flight update.
    Removed,
    /// MMIO placeholder.
    Mmio,
    /// Present but with permissions stripped for access tracking.
    AccessTracked,
    /// Present and accessible.
    Present,
}

impl SpteKind {
    pub fn classify(masks: &MaskConfig, spte: Spte) -> Self {
        if spte.is_removed() {
            Self::Removed
        } else if spte.is_mmio(masks) {
            Self::Mmio
        } else if !spte.is_shadow_present() {
            Self::NotPresent
        } else if spte.is_access_track(masks) {
            Self::AccessTracked
        } else {
            Self::Present
        }
    }
}

impl fmt::Display for SpteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotPresent => "not present",
            Self::Removed => "removed",
            Self::Mmio => "mmio",
            Self::AccessTracked => "access-tracked",
            Self::Present => "present",
        };
        f.write_str(name)
    }
}

/// A raw entry interpreted under a mask layout, ready for display.
///
/// The level is optional; without it, leaf-ness is only reported for large pages.
#[derive(Debug, Clone, Copy)]
pub struct Decoded<'a> {
    masks: &'a MaskConfig,
    spte: Spte,
    level: Option<PageLevel>,
}

impl<'a> Decoded<'a> {
    pub fn new(masks: &'a MaskConfig, spte: Spte) -> Self {
        Self { masks, spte, level: None }
    }

    /// Interprets the entry as sitting at `level`.
    pub fn at_level(mut self, level: PageLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn kind(&self) -> SpteKind {
        SpteKind::classify(self.masks, self.spte)
    }

    fn fmt_present(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masks = self.masks;
        let spte = self.spte;

        writeln!(f, "pfn:        {}", spte.pfn(masks))?;
        match self.level {
            Some(level) if spte.is_last(level) => writeln!(f, "level:      {} leaf", level)?,
            Some(level) => writeln!(f, "level:      {} table", level)?,
            None if spte.is_large() => writeln!(f, "level:      large leaf")?,
            None => {}
        }

        let ad = match spte.ad_type() {
            AdType::Enabled => "enabled",
            AdType::Disabled => "disabled",
            AdType::WriteProtectOnly => "write-protect only",
            AdType::Reserved => "reserved",
        };
        writeln!(f, "a/d:        {}", ad)?;

        let user = match masks.mode() {
            PagingMode::Shadow => 'u',
            PagingMode::Ept => 'r',
        };
        write!(f, "access:     ")?;
        write_flag(f, spte.raw() & masks.user_mask() != 0, user)?;
        write_flag(f, spte.is_writable(), 'w')?;
        write_flag(f, spte.is_executable(masks), 'x')?;
        writeln!(f)?;

        write!(f, "state:     ")?;
        if spte.is_accessed(masks) {
            write!(f, " accessed")?;
        }
        if spte.is_dirty(masks) {
            write!(f, " dirty")?;
        }
        if spte.raw() & masks.host_writable_mask() != 0 {
            write!(f, " host-writable")?;
        }
        if spte.raw() & masks.mmu_writable_mask() != 0 {
            write!(f, " mmu-writable")?;
        }
        if spte.has_volatile_bits(masks) {
            write!(f, " volatile")?;
        }
        writeln!(f)
    }
}

fn write_flag(f: &mut fmt::Formatter<'_>, set: bool, flag: char) -> fmt::Result {
    if set {
        write!(f, "{}", flag)
    } else {
        write!(f, "-")
    }
}

impl fmt::Display for Decoded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        writeln!(f, "spte:       {}", HumanSpte::from(self.spte))?;
        writeln!(f, "kind:       {}", kind)?;

        match kind {
            SpteKind::NotPresent | SpteKind::Removed => Ok(()),
            SpteKind::Mmio => {
                writeln!(f, "gfn:        {}", get_mmio_spte_gfn(self.masks, self.spte))?;
                writeln!(f, "generation: {:#x}", self.spte.mmio_generation())?;
                writeln!(f, "access:     {:?}", get_mmio_spte_access(self.masks, self.spte))
            }
            SpteKind::AccessTracked | SpteKind::Present => self.fmt_present(f),
        }
    }
}
