//! Packed 24-bit integers.
//!
//! Hardware instance records store ids and offsets as 24-bit fields sitting
//! next to an 8-bit mask or flags byte. [`U24`] is the 3-byte value type used
//! for those fields.

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// A 24-bit unsigned integer stored as a 16-bit major part followed by an
/// 8-bit minor part.
///
/// The major part holds the low 16 bits, the minor part bits 16..24, both
/// little-endian, so the three bytes read back as the low 24 bits of the
/// original `u32`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct U24 {
    major: [u8; 2],
    minor: u8,
}

impl U24 {
    /// Largest representable value.
    pub const MAX: u32 = (1 << 24) - 1;

    /// Zero.
    pub const ZERO: Self = Self {
        major: [0; 2],
        minor: 0,
    };

    /// Encode the low 24 bits of `value`.
    ///
    /// Bits above 24 are dropped.
    #[inline]
    pub const fn new(value: u32) -> Self {
        let [b0, b1, b2, _] = value.to_le_bytes();
        Self {
            major: [b0, b1],
            minor: b2,
        }
    }

    /// Build from an explicit major/minor pair.
    #[inline]
    pub const fn from_parts(major: u16, minor: u8) -> Self {
        Self {
            major: major.to_le_bytes(),
            minor,
        }
    }

    /// The 16-bit major part.
    #[inline]
    pub const fn major(self) -> u16 {
        u16::from_le_bytes(self.major)
    }

    /// The 8-bit minor part.
    #[inline]
    pub const fn minor(self) -> u8 {
        self.minor
    }

    /// Decode into a `u32`. The top byte is always zero.
    #[inline]
    pub const fn get(self) -> u32 {
        u32::from_le_bytes([self.major[0], self.major[1], self.minor, 0])
    }
}

impl From<u32> for U24 {
    #[inline]
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<U24> for u32 {
    #[inline]
    fn from(value: U24) -> Self {
        value.get()
    }
}

impl fmt::Debug for U24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U24({:#08x})", self.get())
    }
}

impl fmt::Display for U24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.get(), f)
    }
}
