use std::ops::{BitOr, BitOrAssign};

use crate::error::FrameError;

/// OP_MSG flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    /// A CRC-32C checksum follows the sections.
    pub const CHECKSUM_PRESENT: Self = Self(1 << 0);
    /// The sender will not wait for a reply (requests) or more replies follow (replies).
    pub const MORE_TO_COME: Self = Self(1 << 1);
    pub const EXHAUST_ALLOWED: Self = Self(1 << 16);

    const KNOWN: u32 = Self::CHECKSUM_PRESENT.0 | Self::MORE_TO_COME.0 | Self::EXHAUST_ALLOWED.0;
    // Bits 0-15 must be understood by the parser; 16-31 are optional.
    const REQUIRED_MASK: u32 = 0xffff;

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Parse flag bits off the wire, rejecting unknown required bits.
    pub fn from_bits(bits: u32) -> Result<Self, FrameError> {
        if bits & Self::REQUIRED_MASK & !Self::KNOWN != 0 {
            return Err(FrameError::InvalidFlags(bits));
        }
        Ok(Self(bits & Self::KNOWN))
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
