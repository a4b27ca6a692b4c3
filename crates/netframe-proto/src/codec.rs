//! `PacketCodec`: pure functions for the wire-format transforms in §4.1.
//!
//! Every operation takes a [`Packet`] by value and returns a new one —
//! packets are immutable values, not mutable references (§9). Buffers
//! rented from a pool are always returned on every exit path, including
//! error, because callers own the rental and these functions never hold
//! onto a rented buffer past their own return.

use aes_gcm::{
    Aes256Gcm, Nonce as AesNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, generic_array::GenericArray},
};
use chacha20poly1305::ChaCha20Poly1305;
use salsa20::{
    Salsa20,
    cipher::{KeyIvInit, StreamCipher},
};
use sha2::{Digest, Sha256};

use crate::{
    Flags, Packet,
    errors::{ProtocolError, Result},
    xtea,
};

/// Compression algorithm selected per dispatcher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgo {
    /// LZ4 block format.
    Lz4,
    /// Raw DEFLATE.
    Deflate,
    /// GZip (DEFLATE + header/trailer).
    Gzip,
    /// Brotli.
    Brotli,
}

/// Symmetric cipher selected per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgo {
    /// XTEA in CTR mode (integrity not authenticated).
    Xtea,
    /// AES-256 in GCM mode (authenticated).
    Aes256Gcm,
    /// ChaCha20-Poly1305 (authenticated).
    ChaCha20Poly1305,
    /// Salsa20 stream cipher (integrity not authenticated).
    Salsa20,
}

impl CipherAlgo {
    /// Required symmetric key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Xtea => xtea::KEY_LEN,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::Salsa20 => 32,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Xtea => "XTEA",
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
            Self::Salsa20 => "Salsa20",
        }
    }
}

/// Signature trailer length appended by [`PacketCodec::sign`].
pub const SIGNATURE_LEN: usize = 32;

/// Configuration-free, stateless transforms over [`Packet`] values.
///
/// `PacketCodec` carries no mutable state; it is a namespace for the pure
/// functions in §4.1. Construct one per connection/dispatcher config to pick
/// a default compression algorithm and threshold once.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    /// Algorithm used by [`Self::compress`] when no algorithm is specified.
    pub compression_algo: CompressionAlgo,
    /// Minimum payload length before [`Self::compress`] bothers compressing.
    pub compression_threshold: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self { compression_algo: CompressionAlgo::Lz4, compression_threshold: 256 }
    }
}

impl PacketCodec {
    /// Construct a codec with an explicit default algorithm and threshold.
    #[must_use]
    pub const fn new(compression_algo: CompressionAlgo, compression_threshold: usize) -> Self {
        Self { compression_algo, compression_threshold }
    }

    /// Serialize `packet` to a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// `InvalidPacket` if the payload does not fit within the 65535-byte
    /// wire limit once combined with the header.
    pub fn serialize(&self, packet: &Packet) -> Result<Vec<u8>> {
        packet.encode()
    }

    /// Serialize into a caller-provided buffer.
    ///
    /// Returns `(false, 0)` rather than erroring when `dest` is too small,
    /// matching §4.1's `TrySerialize` contract.
    #[must_use]
    pub fn try_serialize(&self, packet: &Packet, dest: &mut [u8]) -> (bool, usize) {
        packet.try_encode(dest)
    }

    /// Deserialize a packet from `bytes` under `layout`.
    ///
    /// # Errors
    ///
    /// See [`Packet::decode`].
    pub fn deserialize(&self, bytes: &[u8], layout: crate::HeaderLayout) -> Result<Packet> {
        Packet::decode(bytes, layout)
    }

    /// Compute the CRC32 of `packet`'s payload.
    #[must_use]
    pub fn checksum(packet: &Packet) -> u32 {
        crc32fast::hash(&packet.payload)
    }

    /// Verify a legacy-layout packet's embedded checksum against its payload.
    ///
    /// Returns `true` when the layout carries no checksum field at all — a
    /// deployment that never enables the checksum has nothing to verify.
    #[must_use]
    pub fn verify_checksum(packet: &Packet) -> bool {
        match &packet.header {
            crate::PacketHeader::Legacy(h) => match h.checksum {
                Some(expected) => expected == Self::checksum(packet),
                None => true,
            },
            crate::PacketHeader::Modern(_) => true,
        }
    }

    /// Compress `packet`'s payload if it meets `self.compression_threshold`,
    /// using `self.compression_algo`. No-op (returns `packet` unchanged) if
    /// below threshold or already compressed.
    ///
    /// # Errors
    ///
    /// `CompressionError` if the underlying codec fails.
    pub fn compress(&self, packet: Packet) -> Result<Packet> {
        if packet.header.flags().contains(Flags::COMPRESSED) || packet.payload.len() < self.compression_threshold {
            return Ok(packet);
        }
        let compressed = compress_with(self.compression_algo, &packet.payload)?;
        let header = packet.header.with_flags(packet.header.flags().set(Flags::COMPRESSED));
        Packet::new(header, compressed)
    }

    /// Inverse of [`Self::compress`].
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if `Compressed` is not set; `CompressionError` on
    /// a malformed compressed stream.
    pub fn decompress(&self, packet: Packet) -> Result<Packet> {
        if !packet.header.flags().contains(Flags::COMPRESSED) {
            return Err(ProtocolError::PreconditionFailed("Compressed flag not set".to_string()));
        }
        let decompressed = decompress_with(self.compression_algo, &packet.payload)?;
        let header = packet.header.with_flags(packet.header.flags().clear(Flags::COMPRESSED));
        Packet::new(header, decompressed)
    }

    /// Encrypt `packet`'s payload with `key` under `algo`.
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if already `Encrypted`; `InvalidKeyLength` if
    /// `key.len() != algo.key_len()`.
    pub fn encrypt(packet: Packet, key: &[u8], algo: CipherAlgo) -> Result<Packet> {
        if packet.header.flags().contains(Flags::ENCRYPTED) {
            return Err(ProtocolError::PreconditionFailed("Encrypted flag already set".to_string()));
        }
        if key.len() != algo.key_len() {
            return Err(ProtocolError::InvalidKeyLength {
                algo: algo.name(),
                expected: algo.key_len(),
                actual: key.len(),
            });
        }

        let ciphertext = encrypt_with(algo, key, &packet.payload)?;
        let header = packet.header.with_flags(packet.header.flags().set(Flags::ENCRYPTED));
        Packet::new(header, ciphertext)
    }

    /// Inverse of [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if `Encrypted` is not set; `DecryptError` on an
    /// authentication failure (AEAD algorithms) or malformed ciphertext.
    pub fn decrypt(packet: Packet, key: &[u8], algo: CipherAlgo) -> Result<Packet> {
        if !packet.header.flags().contains(Flags::ENCRYPTED) {
            return Err(ProtocolError::PreconditionFailed("Encrypted flag not set".to_string()));
        }
        if key.len() != algo.key_len() {
            return Err(ProtocolError::InvalidKeyLength {
                algo: algo.name(),
                expected: algo.key_len(),
                actual: key.len(),
            });
        }

        let plaintext = decrypt_with(algo, key, &packet.payload)?;
        let header = packet.header.with_flags(packet.header.flags().clear(Flags::ENCRYPTED));
        Packet::new(header, plaintext)
    }

    /// Sign `packet`: append a 32-byte SHA-256 digest over the header
    /// (stamped with the *final*, post-signing length) and payload, and set
    /// `Signed`.
    ///
    /// The digest is an unkeyed hash, providing integrity but not
    /// authentication — see the "HMAC vs raw SHA-256" decision in
    /// `DESIGN.md`. Callers that need authentication should combine this
    /// with [`Self::encrypt`] using an AEAD algorithm.
    ///
    /// # Errors
    ///
    /// `InvalidPacket` if the signed packet would exceed the wire size
    /// limit.
    pub fn sign(packet: Packet) -> Result<Packet> {
        let signed_len = packet.header.size() + packet.payload.len() + SIGNATURE_LEN;
        #[allow(clippy::cast_possible_truncation)]
        let header = packet.header.with_length(signed_len as u16).with_flags(packet.header.flags().set(Flags::SIGNED));

        let mut hasher = Sha256::new();
        hasher.update(header.to_bytes());
        hasher.update(&packet.payload);
        let digest = hasher.finalize();

        let mut payload = Vec::with_capacity(packet.payload.len() + SIGNATURE_LEN);
        payload.extend_from_slice(&packet.payload);
        payload.extend_from_slice(&digest);

        Packet::new(header, payload)
    }

    /// Verify a signed packet's trailing digest.
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if `Signed` is not set or the payload is shorter
    /// than the signature trailer.
    pub fn verify(packet: &Packet) -> Result<bool> {
        if !packet.header.flags().contains(Flags::SIGNED) {
            return Err(ProtocolError::PreconditionFailed("Signed flag not set".to_string()));
        }
        if packet.payload.len() < SIGNATURE_LEN {
            return Err(ProtocolError::SignatureError("payload shorter than signature".to_string()));
        }

        let split = packet.payload.len() - SIGNATURE_LEN;
        let (body, sig) = packet.payload.split_at(split);

        let mut hasher = Sha256::new();
        hasher.update(packet.header.to_bytes());
        hasher.update(body);
        let digest = hasher.finalize();

        Ok(digest.as_slice() == sig)
    }

    /// Remove the trailing signature and clear `Signed`.
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if `Signed` is not set.
    pub fn strip_signature(packet: Packet) -> Result<Packet> {
        if !packet.header.flags().contains(Flags::SIGNED) {
            return Err(ProtocolError::PreconditionFailed("Signed flag not set".to_string()));
        }
        if packet.payload.len() < SIGNATURE_LEN {
            return Err(ProtocolError::SignatureError("payload shorter than signature".to_string()));
        }
        let split = packet.payload.len() - SIGNATURE_LEN;
        let body = packet.payload.slice(..split);
        let header = packet.header.with_flags(packet.header.flags().clear(Flags::SIGNED));
        Packet::new(header, body)
    }
}

fn compress_with(algo: CompressionAlgo, data: &[u8]) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgo::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgo::Deflate => {
            use std::io::Write;
            let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            encoder.finish().map_err(|e| ProtocolError::CompressionError(e.to_string()))
        },
        CompressionAlgo::Gzip => {
            use std::io::Write;
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            encoder.finish().map_err(|e| ProtocolError::CompressionError(e.to_string()))
        },
        CompressionAlgo::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)
                .map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            Ok(out)
        },
    }
}

fn decompress_with(algo: CompressionAlgo, data: &[u8]) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgo::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| ProtocolError::CompressionError(e.to_string()))
        },
        CompressionAlgo::Deflate => {
            use std::io::Read;
            let mut decoder = flate2::read::DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            Ok(out)
        },
        CompressionAlgo::Gzip => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            Ok(out)
        },
        CompressionAlgo::Brotli => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut out)
                .map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
            Ok(out)
        },
    }
}

const AEAD_NONCE_LEN: usize = 12;

#[allow(clippy::expect_used)]
fn encrypt_with(algo: CipherAlgo, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match algo {
        CipherAlgo::Xtea => {
            let key_arr: [u8; xtea::KEY_LEN] = key.try_into().expect("key length checked by caller");
            let nonce: u64 = rand_nonce_u64();
            let mut out = Vec::with_capacity(8 + plaintext.len());
            out.extend_from_slice(&nonce.to_le_bytes());
            out.extend_from_slice(&xtea::xtea_ctr(plaintext, &key_arr, nonce));
            Ok(out)
        },
        CipherAlgo::Salsa20 => {
            let mut nonce = [0u8; 8];
            getrandom_fill(&mut nonce);
            let mut cipher = Salsa20::new(GenericArray::from_slice(key), GenericArray::from_slice(&nonce));
            let mut buf = plaintext.to_vec();
            cipher.apply_keystream(&mut buf);
            let mut out = Vec::with_capacity(8 + buf.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&buf);
            Ok(out)
        },
        CipherAlgo::Aes256Gcm => {
            let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| ProtocolError::DecryptError(e.to_string()))?;
            let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        },
        CipherAlgo::ChaCha20Poly1305 => {
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| ProtocolError::DecryptError(e.to_string()))?;
            let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        },
    }
}

#[allow(clippy::expect_used)]
fn decrypt_with(algo: CipherAlgo, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    match algo {
        CipherAlgo::Xtea => {
            if ciphertext.len() < 8 {
                return Err(ProtocolError::DecryptError("ciphertext shorter than nonce".to_string()));
            }
            let key_arr: [u8; xtea::KEY_LEN] = key.try_into().expect("key length checked by caller");
            let nonce = u64::from_le_bytes(ciphertext[..8].try_into().expect("8 bytes"));
            Ok(xtea::xtea_ctr(&ciphertext[8..], &key_arr, nonce))
        },
        CipherAlgo::Salsa20 => {
            if ciphertext.len() < 8 {
                return Err(ProtocolError::DecryptError("ciphertext shorter than nonce".to_string()));
            }
            let (nonce, body) = ciphertext.split_at(8);
            let mut cipher = Salsa20::new(GenericArray::from_slice(key), GenericArray::from_slice(nonce));
            let mut buf = body.to_vec();
            cipher.apply_keystream(&mut buf);
            Ok(buf)
        },
        CipherAlgo::Aes256Gcm => {
            if ciphertext.len() < AEAD_NONCE_LEN {
                return Err(ProtocolError::DecryptError("ciphertext shorter than nonce".to_string()));
            }
            let (nonce, body) = ciphertext.split_at(AEAD_NONCE_LEN);
            let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
            cipher
                .decrypt(AesNonce::from_slice(nonce), body)
                .map_err(|e| ProtocolError::DecryptError(e.to_string()))
        },
        CipherAlgo::ChaCha20Poly1305 => {
            use chacha20poly1305::{AeadCore as _, KeyInit as _};
            if ciphertext.len() < AEAD_NONCE_LEN {
                return Err(ProtocolError::DecryptError("ciphertext shorter than nonce".to_string()));
            }
            let (nonce, body) = ciphertext.split_at(AEAD_NONCE_LEN);
            let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), body)
                .map_err(|e| ProtocolError::DecryptError(e.to_string()))
        },
    }
}

fn getrandom_fill(buf: &mut [u8]) {
    use rand_core::RngCore as _;
    aes_gcm::aead::OsRng.fill_bytes(buf);
}

fn rand_nonce_u64() -> u64 {
    let mut buf = [0u8; 8];
    getrandom_fill(&mut buf);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Opcode, Priority, Transport};

    fn sample_packet(payload: Vec<u8>) -> Packet {
        Packet::modern(Opcode::new(1), Flags::empty(), Priority::Normal, Transport::Tcp, payload).unwrap()
    }

    #[test]
    fn compress_decompress_round_trip() {
        let codec = PacketCodec::new(CompressionAlgo::Lz4, 4);
        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let packet = sample_packet(payload.clone());
        let compressed = codec.compress(packet).unwrap();
        assert!(compressed.header.flags().contains(Flags::COMPRESSED));
        let decompressed = codec.decompress(compressed).unwrap();
        assert!(!decompressed.header.flags().contains(Flags::COMPRESSED));
        assert_eq!(decompressed.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn below_threshold_is_noop() {
        let codec = PacketCodec::new(CompressionAlgo::Lz4, 1024);
        let packet = sample_packet(vec![1, 2, 3]);
        let result = codec.compress(packet.clone()).unwrap();
        assert_eq!(result, packet);
    }

    #[test]
    fn decompress_without_flag_fails() {
        let codec = PacketCodec::default();
        let packet = sample_packet(vec![1, 2, 3]);
        assert!(matches!(codec.decompress(packet), Err(ProtocolError::PreconditionFailed(_))));
    }

    #[test]
    fn xtea_encrypt_decrypt_round_trip() {
        let key = [0x42u8; xtea::KEY_LEN];
        let packet = sample_packet(b"hello".to_vec());
        let encrypted = PacketCodec::encrypt(packet, &key, CipherAlgo::Xtea).unwrap();
        assert!(encrypted.header.flags().contains(Flags::ENCRYPTED));
        assert_ne!(encrypted.payload.as_ref(), b"hello");
        let decrypted = PacketCodec::decrypt(encrypted, &key, CipherAlgo::Xtea).unwrap();
        assert!(!decrypted.header.flags().contains(Flags::ENCRYPTED));
        assert_eq!(decrypted.payload.as_ref(), b"hello");
    }

    #[test]
    fn aes_gcm_encrypt_decrypt_round_trip() {
        let key = [0x11u8; 32];
        let packet = sample_packet(b"hello".to_vec());
        let encrypted = PacketCodec::encrypt(packet, &key, CipherAlgo::Aes256Gcm).unwrap();
        assert!(encrypted.header.flags().contains(Flags::ENCRYPTED));
        assert_ne!(encrypted.payload.as_ref(), b"hello");
        let decrypted = PacketCodec::decrypt(encrypted, &key, CipherAlgo::Aes256Gcm).unwrap();
        assert_eq!(decrypted.payload.as_ref(), b"hello");
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let packet = sample_packet(b"hello".to_vec());
        let result = PacketCodec::encrypt(packet, &[0u8; 4], CipherAlgo::Aes256Gcm);
        assert!(matches!(result, Err(ProtocolError::InvalidKeyLength { .. })));
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let packet = sample_packet(b"payload data".to_vec());
        let signed = PacketCodec::sign(packet).unwrap();
        assert!(signed.header.flags().contains(Flags::SIGNED));
        assert!(PacketCodec::verify(&signed).unwrap());
    }

    #[test]
    fn strip_signature_restores_original_payload() {
        let packet = sample_packet(b"payload data".to_vec());
        let original_payload = packet.payload.clone();
        let signed = PacketCodec::sign(packet).unwrap();
        let stripped = PacketCodec::strip_signature(signed).unwrap();
        assert!(!stripped.header.flags().contains(Flags::SIGNED));
        assert_eq!(stripped.payload, original_payload);
    }

    #[test]
    fn tampered_signed_payload_fails_verify() {
        let packet = sample_packet(b"payload data".to_vec());
        let signed = PacketCodec::sign(packet).unwrap();
        let mut tampered_bytes = signed.payload.to_vec();
        tampered_bytes[0] ^= 0xFF;
        let tampered = Packet::new(signed.header, tampered_bytes).unwrap();
        assert!(!PacketCodec::verify(&tampered).unwrap());
    }

    #[test]
    fn checksum_round_trip() {
        let packet = Packet::legacy(Opcode::new(1), Flags::empty(), Priority::Normal, 0, None, b"data".to_vec()).unwrap();
        let crc = PacketCodec::checksum(&packet);
        let stamped =
            Packet::legacy(Opcode::new(1), Flags::empty(), Priority::Normal, 0, Some(crc), b"data".to_vec()).unwrap();
        assert!(PacketCodec::verify_checksum(&stamped));
    }

    #[test]
    fn checksum_detects_corruption() {
        let packet = Packet::legacy(Opcode::new(1), Flags::empty(), Priority::Normal, 0, None, b"data".to_vec()).unwrap();
        let crc = PacketCodec::checksum(&packet);
        let corrupted =
            Packet::legacy(Opcode::new(1), Flags::empty(), Priority::Normal, 0, Some(crc), b"xata".to_vec()).unwrap();
        assert!(!PacketCodec::verify_checksum(&corrupted));
    }
}
