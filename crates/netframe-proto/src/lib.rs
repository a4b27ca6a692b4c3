//! Wire format, codec and framing for the netframe packet protocol.
//!
//! This crate is sans-IO: it knows how to turn bytes into [`Packet`] values
//! and back, and how to apply the `PacketCodec` transforms (compression,
//! encryption, signing) to them. It does not open sockets — see
//! `netframe-server` for the transport and dispatch layer built on top of
//! these types.

pub mod codec;
pub mod errors;
pub mod flags;
pub mod header;
pub mod opcode;
pub mod packet;
pub mod priority;
pub mod xtea;

pub use codec::{CipherAlgo, CompressionAlgo, PacketCodec};
pub use errors::{ProtocolError, Result};
pub use flags::Flags;
pub use header::{HeaderLayout, LegacyHeader, ModernHeader, PacketHeader};
pub use opcode::{Opcode, Transport};
pub use packet::{MAX_PACKET_SIZE, Packet};
pub use priority::Priority;
