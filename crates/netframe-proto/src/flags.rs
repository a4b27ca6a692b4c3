//! Packet-level feature flags.
//!
//! A one-byte bitset carried in the packet header. All operations are pure:
//! setting or clearing a flag returns a new value rather than mutating in
//! place, matching the immutable-packet design this protocol uses throughout.

use std::fmt;

/// Bitset of packet-level features.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    /// Sender requests an acknowledgement.
    pub const ACK_REQUIRED: Self = Self(0x01);
    /// This packet is itself an acknowledgement.
    pub const ACKNOWLEDGED: Self = Self(0x02);
    /// Payload is compressed.
    pub const COMPRESSED: Self = Self(0x04);
    /// Payload is ciphertext.
    pub const ENCRYPTED: Self = Self(0x08);
    /// Sender wants reliable (retried) delivery.
    pub const RELIABLE: Self = Self(0x10);
    /// This packet is one fragment of a larger logical message.
    pub const FRAGMENTED: Self = Self(0x20);
    /// Part of a stream rather than a single discrete message.
    pub const STREAM: Self = Self(0x40);
    /// Payload carries a trailing signature (see [`crate::codec`]).
    pub const SIGNED: Self = Self(0x80);

    /// The empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Construct from a raw byte (all bit patterns are valid).
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte representation.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Returns a new value with `other`'s bits set.
    #[must_use]
    pub const fn set(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns a new value with `other`'s bits cleared.
    #[must_use]
    pub const fn clear(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True iff every bit in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: &[(Flags, &str)] = &[
            (Flags::ACK_REQUIRED, "ACK_REQUIRED"),
            (Flags::ACKNOWLEDGED, "ACKNOWLEDGED"),
            (Flags::COMPRESSED, "COMPRESSED"),
            (Flags::ENCRYPTED, "ENCRYPTED"),
            (Flags::RELIABLE, "RELIABLE"),
            (Flags::FRAGMENTED, "FRAGMENTED"),
            (Flags::STREAM, "STREAM"),
            (Flags::SIGNED, "SIGNED"),
        ];
        let mut list = f.debug_list();
        for (flag, name) in names {
            if self.contains(*flag) {
                list.entry(name);
            }
        }
        list.finish()
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.set(rhs)
    }
}
