//! `Packet`: an immutable header + payload value.
//!
//! Mutation is modeled as producing a new `Packet` rather than mutating one
//! in place (§9's "mutable-ref packet types" re-architecture note) — every
//! `PacketCodec` transform (`Compress`, `Encrypt`, `Sign`, ...) takes a
//! `Packet` by value and returns a new one.

use bytes::Bytes;

use crate::{
    HeaderLayout, PacketHeader,
    errors::{ProtocolError, Result},
    header::{LegacyHeader, ModernHeader},
};

/// Maximum total wire size (`length` field is a `u16`).
pub const MAX_PACKET_SIZE: usize = 65_535;

/// A header paired with its payload.
///
/// # Invariants
///
/// - `header.length() as usize == header.size() + payload.len()`, enforced
///   by [`Packet::new`] and re-validated by [`Packet::decode`].
/// - The total size never exceeds [`MAX_PACKET_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header (layout-tagged).
    pub header: PacketHeader,
    /// Raw payload bytes. Meaning depends on `header.flags()` — compressed,
    /// encrypted, and/or signed payloads are opaque until the corresponding
    /// `PacketCodec` operation is applied.
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet, stamping `header`'s length field to match `payload`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacket` if the resulting total size would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let total = header.size() + payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: total, max: MAX_PACKET_SIZE });
        }
        #[allow(clippy::cast_possible_truncation)]
        let length = total as u16;
        Ok(Self { header: header.with_length(length), payload })
    }

    /// Replace this packet's payload, restamping the header's length field.
    pub fn with_payload(self, payload: impl Into<Bytes>) -> Result<Self> {
        Self::new(self.header, payload)
    }

    /// Decode a packet from `bytes` using the given layout.
    ///
    /// Reads the length field first, validates `header_size <= length <=
    /// bytes.len()`, then slices out exactly `length - header_size` payload
    /// bytes.
    ///
    /// # Errors
    ///
    /// `InvalidPacket` if the declared length is smaller than the header
    /// size or larger than the buffer actually supplied.
    pub fn decode(bytes: &[u8], layout: HeaderLayout) -> Result<Self> {
        let header_size = layout.header_size();
        if bytes.len() < header_size {
            return Err(ProtocolError::FrameTooShort { expected: header_size, actual: bytes.len() });
        }

        let header = PacketHeader::from_bytes(bytes, layout)?;
        let length = header.length() as usize;

        if length < header_size {
            return Err(ProtocolError::InvalidPacket(format!(
                "length {length} is smaller than header size {header_size}"
            )));
        }
        if length > bytes.len() {
            return Err(ProtocolError::FrameTruncated {
                expected: length - header_size,
                actual: bytes.len().saturating_sub(header_size),
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[header_size..length]);
        Ok(Self { header, payload })
    }

    /// Encode this packet to a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// `InvalidPacket` if `payload.len() > MAX_PACKET_SIZE - header size`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = self.header.size() + self.payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: total, max: MAX_PACKET_SIZE });
        }
        let mut out = self.header.to_bytes();
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Encode into a caller-provided destination slice.
    ///
    /// Returns `(true, n)` with `n` bytes written on success, or
    /// `(false, 0)` if `dest` is too small to hold the encoded packet.
    #[must_use]
    pub fn try_encode(&self, dest: &mut [u8]) -> (bool, usize) {
        let total = self.header.size() + self.payload.len();
        if dest.len() < total || total > MAX_PACKET_SIZE {
            return (false, 0);
        }
        let header_bytes = self.header.to_bytes();
        dest[..header_bytes.len()].copy_from_slice(&header_bytes);
        dest[header_bytes.len()..total].copy_from_slice(&self.payload);
        (true, total)
    }

    /// Convenience constructor for the modern layout with this deployment's
    /// default magic number.
    pub fn modern(opcode: crate::Opcode, flags: crate::Flags, priority: crate::Priority, transport: crate::Transport, payload: impl Into<Bytes>) -> Result<Self> {
        let header = PacketHeader::Modern(ModernHeader {
            magic: ModernHeader::DEFAULT_MAGIC,
            opcode,
            length: 0,
            flags,
            priority,
            transport,
        });
        Self::new(header, payload)
    }

    /// Convenience constructor for the legacy layout.
    pub fn legacy(opcode: crate::Opcode, flags: crate::Flags, priority: crate::Priority, kind: u8, checksum: Option<u32>, payload: impl Into<Bytes>) -> Result<Self> {
        let header = PacketHeader::Legacy(LegacyHeader { length: 0, kind, flags, priority, opcode, checksum });
        Self::new(header, payload)
    }
}
