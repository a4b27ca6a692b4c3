//! Packet header: two wire layouts, selected once per deployment.
//!
//! §6.1 describes two conflicting header shapes found in the source
//! material. Rather than guess, this codebase picks the modern 11-byte
//! little-endian layout as canonical (it is the only one carrying a
//! self-describing `magic` field) and keeps the legacy 7-byte layout
//! available for interop, selected by [`HeaderLayout`] at the
//! [`crate::PacketCodec`]/transport configuration level. Both MUST NOT be
//! mixed within one deployment (§6.1), so the choice is never made
//! per-packet.
//!
//! Both layouts use fixed, unaligned, packed byte layouts parsed with
//! `zerocopy` so that decoding never copies the header out of the receive
//! buffer before validation.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Flags, Opcode, Priority, Transport,
    errors::{ProtocolError, Result},
};

/// Which header layout a deployment has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderLayout {
    /// 11-byte header: `magic(4) opcode(2) length(2) flags(1) priority(1)
    /// transport(1)`.
    Modern,
    /// 7-byte header: `length(2) kind(1) flags(1) priority(1) opcode(2)`,
    /// optionally followed by a 4-byte CRC32 checksum.
    Legacy {
        /// Whether a trailing 4-byte CRC32 checksum follows the header.
        with_checksum: bool,
    },
}

impl HeaderLayout {
    /// Size of the header itself, excluding payload (and, for `Legacy`,
    /// including the checksum trailer when present).
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            Self::Modern => ModernHeader::SIZE,
            Self::Legacy { with_checksum: true } => LegacyHeader::SIZE + 4,
            Self::Legacy { with_checksum: false } => LegacyHeader::SIZE,
        }
    }
}

/// Raw wire bytes for the modern header. All multi-byte fields are
/// little-endian.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ModernWire {
    magic: [u8; 4],
    opcode: [u8; 2],
    length: [u8; 2],
    flags: u8,
    priority: u8,
    transport: u8,
}

/// Decoded modern-layout header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModernHeader {
    /// Identifies the packet variant; fixed per deployment.
    pub magic: u32,
    /// Dispatch key.
    pub opcode: Opcode,
    /// Total length: header (11) + payload, `<= 65535`.
    pub length: u16,
    /// Packet-level feature flags.
    pub flags: Flags,
    /// Advisory scheduling priority.
    pub priority: Priority,
    /// Transport the packet travels over.
    pub transport: Transport,
}

impl ModernHeader {
    /// Serialized size in bytes.
    pub const SIZE: usize = 11;

    /// Default magic number for this deployment's modern layout.
    pub const DEFAULT_MAGIC: u32 = 0x4E58_4C58;

    /// Parse a modern header from the front of `bytes`. Does not validate
    /// `length` against the buffer; callers slice the payload separately.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire = ModernWire::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        Ok(Self {
            magic: u32::from_le_bytes(wire.magic),
            opcode: Opcode::new(u16::from_le_bytes(wire.opcode)),
            length: u16::from_le_bytes(wire.length),
            flags: Flags::from_byte(wire.flags),
            priority: Priority::from_u8(wire.priority),
            transport: Transport::from_u8(wire.transport),
        })
    }

    /// Serialize to an 11-byte array.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let wire = ModernWire {
            magic: self.magic.to_le_bytes(),
            opcode: self.opcode.as_u16().to_le_bytes(),
            length: self.length.to_le_bytes(),
            flags: self.flags.to_byte(),
            priority: self.priority.to_u8(),
            transport: self.transport.to_u8(),
        };
        let bytes = wire.as_bytes();
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }
}

/// Raw wire bytes for the legacy header (checksum handled separately).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LegacyWire {
    length: [u8; 2],
    kind: u8,
    flags: u8,
    priority: u8,
    opcode: [u8; 2],
}

/// Decoded legacy-layout header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHeader {
    /// Total length: header (7, +4 if checksummed) + payload.
    pub length: u16,
    /// Packet kind/type byte (legacy equivalent of a coarse transport tag).
    pub kind: u8,
    /// Packet-level feature flags.
    pub flags: Flags,
    /// Advisory scheduling priority.
    pub priority: Priority,
    /// Dispatch key.
    pub opcode: Opcode,
    /// CRC32 checksum over the payload, when this deployment enables it.
    pub checksum: Option<u32>,
}

impl LegacyHeader {
    /// Serialized size in bytes, excluding the optional checksum trailer.
    pub const SIZE: usize = 7;

    /// Parse a legacy header (and, if `with_checksum`, its 4-byte CRC32
    /// trailer) from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8], with_checksum: bool) -> Result<Self> {
        let wire = LegacyWire::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        let checksum = if with_checksum {
            let tail = bytes.get(Self::SIZE..Self::SIZE + 4).ok_or(ProtocolError::FrameTooShort {
                expected: Self::SIZE + 4,
                actual: bytes.len(),
            })?;
            let mut arr = [0u8; 4];
            arr.copy_from_slice(tail);
            Some(u32::from_le_bytes(arr))
        } else {
            None
        };

        Ok(Self {
            length: u16::from_le_bytes(wire.length),
            kind: wire.kind,
            flags: Flags::from_byte(wire.flags),
            priority: Priority::from_u8(wire.priority),
            opcode: Opcode::new(u16::from_le_bytes(wire.opcode)),
            checksum,
        })
    }

    /// Serialize to bytes, appending the checksum trailer iff `self.checksum`
    /// is `Some`.
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let wire = LegacyWire {
            length: self.length.to_le_bytes(),
            kind: self.kind,
            flags: self.flags.to_byte(),
            priority: self.priority.to_u8(),
            opcode: self.opcode.as_u16().to_le_bytes(),
        };
        let mut out = wire.as_bytes().to_vec();
        if let Some(crc) = self.checksum {
            out.extend_from_slice(&crc.to_le_bytes());
        }
        out
    }
}

/// A decoded packet header, tagged by which wire layout produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    /// Modern 11-byte layout.
    Modern(ModernHeader),
    /// Legacy 7 (+4) byte layout.
    Legacy(LegacyHeader),
}

impl PacketHeader {
    /// Total length field (header + payload), as carried on the wire.
    #[must_use]
    pub const fn length(&self) -> u16 {
        match self {
            Self::Modern(h) => h.length,
            Self::Legacy(h) => h.length,
        }
    }

    /// Set the length field, returning a new header.
    #[must_use]
    pub const fn with_length(self, length: u16) -> Self {
        match self {
            Self::Modern(mut h) => {
                h.length = length;
                Self::Modern(h)
            },
            Self::Legacy(mut h) => {
                h.length = length;
                Self::Legacy(h)
            },
        }
    }

    /// Dispatch key.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Modern(h) => h.opcode,
            Self::Legacy(h) => h.opcode,
        }
    }

    /// Packet-level feature flags.
    #[must_use]
    pub const fn flags(&self) -> Flags {
        match self {
            Self::Modern(h) => h.flags,
            Self::Legacy(h) => h.flags,
        }
    }

    /// Return a new header with `flags` replaced.
    #[must_use]
    pub const fn with_flags(self, flags: Flags) -> Self {
        match self {
            Self::Modern(mut h) => {
                h.flags = flags;
                Self::Modern(h)
            },
            Self::Legacy(mut h) => {
                h.flags = flags;
                Self::Legacy(h)
            },
        }
    }

    /// Advisory priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        match self {
            Self::Modern(h) => h.priority,
            Self::Legacy(h) => h.priority,
        }
    }

    /// Size of this header on the wire (including any checksum trailer).
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Modern(_) => ModernHeader::SIZE,
            Self::Legacy(h) => LegacyHeader::SIZE + if h.checksum.is_some() { 4 } else { 0 },
        }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Self::Modern(h) => h.to_bytes().to_vec(),
            Self::Legacy(h) => h.to_bytes(),
        }
    }

    /// Parse a header from `bytes` according to `layout`.
    pub fn from_bytes(bytes: &[u8], layout: HeaderLayout) -> Result<Self> {
        match layout {
            HeaderLayout::Modern => {
                let header = ModernHeader::from_bytes(bytes)?;
                if header.magic != ModernHeader::DEFAULT_MAGIC {
                    return Err(ProtocolError::InvalidMagic);
                }
                Ok(Self::Modern(header))
            },
            HeaderLayout::Legacy { with_checksum } => {
                Ok(Self::Legacy(LegacyHeader::from_bytes(bytes, with_checksum)?))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn modern_header_size_is_eleven() {
        assert_eq!(ModernHeader::SIZE, 11);
    }

    #[test]
    fn legacy_header_size_is_seven() {
        assert_eq!(LegacyHeader::SIZE, 7);
    }

    #[test]
    fn modern_round_trip() {
        let header = ModernHeader {
            magic: ModernHeader::DEFAULT_MAGIC,
            opcode: Opcode::new(0x0101),
            length: 15,
            flags: Flags::empty(),
            priority: Priority::High,
            transport: Transport::Tcp,
        };
        let bytes = header.to_bytes();
        let parsed = ModernHeader::from_bytes(&bytes).expect("parses");
        assert_eq!(header, parsed);
    }

    #[test]
    fn modern_rejects_wrong_magic() {
        let header = ModernHeader {
            magic: 0xDEAD_BEEF,
            opcode: Opcode::new(1),
            length: 11,
            flags: Flags::empty(),
            priority: Priority::Normal,
            transport: Transport::None,
        };
        let bytes = header.to_bytes();
        let result = PacketHeader::from_bytes(&bytes, HeaderLayout::Modern);
        assert_eq!(result, Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn legacy_round_trip_with_checksum() {
        let header = LegacyHeader {
            length: 50,
            kind: 1,
            flags: Flags::COMPRESSED,
            priority: Priority::Low,
            opcode: Opcode::new(7),
            checksum: Some(0x1234_5678),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LegacyHeader::SIZE + 4);
        let parsed = LegacyHeader::from_bytes(&bytes, true).expect("parses");
        assert_eq!(header, parsed);
    }

    #[test]
    fn legacy_round_trip_without_checksum() {
        let header = LegacyHeader {
            length: 7,
            kind: 0,
            flags: Flags::empty(),
            priority: Priority::Normal,
            opcode: Opcode::new(0),
            checksum: None,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LegacyHeader::SIZE);
        let parsed = LegacyHeader::from_bytes(&bytes, false).expect("parses");
        assert_eq!(header, parsed);
    }

    #[test]
    fn example_scenario_one_length_bytes() {
        // spec §8 scenario 1: magic=0x4E584C58, opcode=0x0101, flags=0,
        // priority=1, transport=1, payload length 4 -> total length 15,
        // little-endian length bytes at offset 6 are 0x0F, 0x00.
        let header = ModernHeader {
            magic: 0x4E58_4C58,
            opcode: Opcode::new(0x0101),
            length: 15,
            flags: Flags::empty(),
            priority: Priority::from_u8(1),
            transport: Transport::from_u8(1),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 11);
        assert_eq!(&bytes[6..8], &[0x0F, 0x00]);
    }

    proptest! {
        #[test]
        fn modern_header_round_trip_prop(
            opcode in any::<u16>(),
            length in any::<u16>(),
            flags in any::<u8>(),
            priority in 0u8..4,
            transport in 0u8..3,
        ) {
            let header = ModernHeader {
                magic: ModernHeader::DEFAULT_MAGIC,
                opcode: Opcode::new(opcode),
                length,
                flags: Flags::from_byte(flags),
                priority: Priority::from_u8(priority),
                transport: Transport::from_u8(transport),
            };
            let bytes = header.to_bytes();
            let parsed = ModernHeader::from_bytes(&bytes).expect("parses");
            prop_assert_eq!(header, parsed);
        }
    }
}
