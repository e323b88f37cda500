//! Guest and host frame numbers, and page table levels.
//!
//! A shadow entry maps a guest frame (GFN) to a host frame (PFN). Both are plain 64-bit
//! page-granular numbers; the newtypes exist so the two can't be swapped by accident.

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::layout::{PAGE_SHIFT, PT64_LEVEL_BITS};

/// Macro to define common frame number functionality.
macro_rules! impl_frame_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new frame number.
            #[inline]
            pub const fn new(number: u64) -> Self {
                Self(number)
            }

            /// Returns the raw frame number.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns the frame containing the given byte address.
            #[inline]
            pub const fn containing(address: u64) -> Self {
                Self(address >> PAGE_SHIFT)
            }

            /// Returns the byte address at the start of this frame.
            #[inline]
            pub const fn start(self) -> u64 {
                self.0 << PAGE_SHIFT
            }

            /// Rounds down to the first frame of the page mapped at `level`.
            #[inline]
            pub const fn round_for_level(self, level: PageLevel) -> Self {
                Self(self.0 & !(level.pages_per_entry() - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<u64> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u64) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_frame_number_common!(
    Gfn,
    "A guest frame number.\n\n\
     Guest-physical address divided by the 4 KiB page size."
);

impl Gfn {
    /// Returns the guest-physical address at the start of this frame.
    #[inline]
    pub const fn gpa(self) -> u64 {
        self.start()
    }
}

impl_frame_number_common!(
    Pfn,
    "A host physical frame number.\n\n\
     Host-physical address divided by the 4 KiB page size. This is what ends up in the\n\
     frame field of a present shadow entry."
);

/// Level of a page table in the shadow hierarchy.
///
/// Level 1 holds 4 KiB leaves; every level above it translates 9 more address bits and
/// may hold either a pointer to a child table or a large-page leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageLevel {
    Level4K = 1,
    Level2M = 2,
    Level1G = 3,
    Level512G = 4,
    Level256T = 5,
}

impl PageLevel {
    /// Deepest level a 5-level hierarchy can root at.
    pub const MAX: PageLevel = PageLevel::Level256T;

    /// Converts a raw level number (1-5).
    pub const fn from_raw(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Level4K),
            2 => Some(Self::Level2M),
            3 => Some(Self::Level1G),
            4 => Some(Self::Level512G),
            5 => Some(Self::Level256T),
            _ => None,
        }
    }

    /// Returns the raw level number.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Number of 4 KiB frames covered by one entry at this level.
    #[inline]
    pub const fn pages_per_entry(self) -> u64 {
        1 << ((self as u32 - 1) * PT64_LEVEL_BITS)
    }

    /// Size in bytes of the region covered by one entry at this level.
    #[inline]
    pub const fn page_size(self) -> u64 {
        self.pages_per_entry() << PAGE_SHIFT
    }

    /// Entries at this level are always leaves.
    #[inline]
    pub const fn is_leaf_only(self) -> bool {
        matches!(self, Self::Level4K)
    }
}

impl fmt::Display for PageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Level4K => "4K",
            Self::Level2M => "2M",
            Self::Level1G => "1G",
            Self::Level512G => "512G",
            Self::Level256T => "256T",
        };
        f.write_str(name)
    }
}
