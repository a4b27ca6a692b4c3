//! Snowflake-style 64-bit unique ID generator.
//!
//! Bit layout, MSB first: `type(4) · machine(12) · timestamp(32, ms since a
//! configurable epoch) · sequence(16)`. Monotonic per generator instance
//! under a single mutex — the critical section captures the current
//! millisecond, bumps the sequence within that millisecond, and busy-yields
//! into the next millisecond on sequence overflow.

use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

const TYPE_BITS: u32 = 4;
const MACHINE_BITS: u32 = 12;
const TIMESTAMP_BITS: u32 = 32;
const SEQUENCE_BITS: u32 = 16;

const MAX_TYPE: u16 = (1 << TYPE_BITS) - 1;
const MAX_MACHINE: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u16 = u16::MAX;

const SEQUENCE_SHIFT: u32 = 0;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS;
const MACHINE_SHIFT: u32 = SEQUENCE_BITS + TIMESTAMP_BITS;
const TYPE_SHIFT: u32 = SEQUENCE_BITS + TIMESTAMP_BITS + MACHINE_BITS;

/// Errors raised while generating or parsing a [`UniqueId`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UniqueIdError {
    /// The system clock moved backwards relative to the generator's last
    /// observed timestamp.
    #[error("clock moved backwards: observed {observed_ms}ms, last seen {last_seen_ms}ms")]
    ClockBackwards {
        /// Millisecond timestamp just observed.
        observed_ms: i64,
        /// Millisecond timestamp previously recorded.
        last_seen_ms: i64,
    },

    /// `machine_id` exceeded the 12-bit field it is packed into.
    #[error("machine id {0} exceeds the 12-bit field (max {MAX_MACHINE})")]
    MachineIdOutOfRange(u16),

    /// A textual form (hex/base64/base36) did not decode to a valid id.
    #[error("malformed id text: {0}")]
    Malformed(String),
}

/// Generator configuration: the id type tag, this instance's machine id, and
/// the epoch timestamps are measured from.
#[derive(Debug, Clone, Copy)]
pub struct UniqueIdConfig {
    /// 4-bit type tag embedded in every id this generator produces.
    pub id_type: u16,
    /// 12-bit machine/shard identifier.
    pub machine_id: u16,
    /// Epoch (milliseconds since the Unix epoch) that timestamps are
    /// measured from. Must not be in the future.
    pub epoch_ms: i64,
}

impl UniqueIdConfig {
    /// Validate field widths and that the epoch isn't in the future.
    ///
    /// # Errors
    ///
    /// `MachineIdOutOfRange` if `machine_id > 4095`.
    pub fn validate(&self, now_ms: i64) -> Result<(), UniqueIdError> {
        if self.machine_id > MAX_MACHINE {
            return Err(UniqueIdError::MachineIdOutOfRange(self.machine_id));
        }
        if self.epoch_ms > now_ms {
            return Err(UniqueIdError::ClockBackwards { observed_ms: now_ms, last_seen_ms: self.epoch_ms });
        }
        Ok(())
    }
}

/// A decoded 64-bit id's constituent fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedId {
    /// 4-bit type tag.
    pub id_type: u16,
    /// 12-bit machine id.
    pub machine: u16,
    /// Milliseconds since the generator's configured epoch.
    pub timestamp_ms: u32,
    /// Intra-millisecond sequence number.
    pub sequence: u16,
}

/// Thread-safe Snowflake-style id generator.
pub struct UniqueIdGenerator {
    config: UniqueIdConfig,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_ms: i64,
    sequence: u16,
}

impl UniqueIdGenerator {
    /// Construct a generator.
    ///
    /// # Errors
    ///
    /// `MachineIdOutOfRange` if `config.machine_id > 4095`.
    pub fn new(config: UniqueIdConfig) -> Result<Self, UniqueIdError> {
        if config.machine_id > MAX_MACHINE {
            return Err(UniqueIdError::MachineIdOutOfRange(config.machine_id));
        }
        Ok(Self { config, state: Mutex::new(GeneratorState { last_ms: -1, sequence: 0 }) })
    }

    /// Generate the next id, blocking (spin) into the next millisecond if
    /// the 16-bit sequence space is exhausted within the current one.
    ///
    /// # Errors
    ///
    /// `ClockBackwards` if the system clock is observed to move backwards
    /// relative to the last generated id — this is never silently tolerated,
    /// since it would risk issuing a duplicate id.
    pub fn next_id(&self) -> Result<u64, UniqueIdError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        loop {
            let now_ms = now_ms_since(self.config.epoch_ms);

            if now_ms < state.last_ms {
                return Err(UniqueIdError::ClockBackwards { observed_ms: now_ms, last_seen_ms: state.last_ms });
            }

            if now_ms == state.last_ms {
                if state.sequence == MAX_SEQUENCE {
                    // Sequence space exhausted for this millisecond; spin into the next one.
                    std::hint::spin_loop();
                    continue;
                }
                state.sequence += 1;
            } else {
                state.last_ms = now_ms;
                state.sequence = 0;
            }

            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let timestamp = now_ms as u32;
            return Ok(encode(self.config.id_type, self.config.machine_id, timestamp, state.sequence));
        }
    }
}

fn now_ms_since(epoch_ms: i64) -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let wall_ms = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64);
    wall_ms - epoch_ms
}

const fn encode(id_type: u16, machine: u16, timestamp_ms: u32, sequence: u16) -> u64 {
    ((id_type as u64 & MAX_TYPE as u64) << TYPE_SHIFT)
        | ((machine as u64 & MAX_MACHINE as u64) << MACHINE_SHIFT)
        | ((timestamp_ms as u64) << TIMESTAMP_SHIFT)
        | (sequence as u64 << SEQUENCE_SHIFT)
}

/// Decode a raw id's constituent fields.
#[must_use]
pub const fn parse(id: u64) -> ParsedId {
    ParsedId {
        id_type: ((id >> TYPE_SHIFT) & MAX_TYPE as u64) as u16,
        machine: ((id >> MACHINE_SHIFT) & MAX_MACHINE as u64) as u16,
        timestamp_ms: ((id >> TIMESTAMP_SHIFT) & u32::MAX as u64) as u32,
        sequence: ((id >> SEQUENCE_SHIFT) & MAX_SEQUENCE as u64) as u16,
    }
}

/// Format as 16 uppercase hex characters.
#[must_use]
pub fn to_hex(id: u64) -> String {
    format!("{id:016X}")
}

/// Parse a 16-character hex string back into an id.
///
/// # Errors
///
/// `Malformed` if `text` is not exactly 16 valid hex characters.
pub fn from_hex(text: &str) -> Result<u64, UniqueIdError> {
    if text.len() != 16 {
        return Err(UniqueIdError::Malformed(format!("expected 16 hex chars, got {}", text.len())));
    }
    u64::from_str_radix(text, 16).map_err(|e| UniqueIdError::Malformed(e.to_string()))
}

/// Format as standard (padded) base64, 12 characters.
#[must_use]
pub fn to_base64(id: u64) -> String {
    BASE64.encode(id.to_be_bytes())
}

/// Parse a base64-encoded id back into a `u64`.
///
/// # Errors
///
/// `Malformed` if `text` does not decode to exactly 8 bytes of valid base64.
pub fn from_base64(text: &str) -> Result<u64, UniqueIdError> {
    let bytes = BASE64.decode(text).map_err(|e| UniqueIdError::Malformed(e.to_string()))?;
    let arr: [u8; 8] =
        bytes.try_into().map_err(|_| UniqueIdError::Malformed("expected 8 decoded bytes".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

const BASE36_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Format as base36, zero-padded to 7 characters (up to 13 for the full
/// 64-bit range).
#[must_use]
#[allow(clippy::expect_used)]
pub fn to_base36(id: u64) -> String {
    if id == 0 {
        return "0".repeat(7);
    }
    let mut digits = Vec::new();
    let mut n = id;
    while n > 0 {
        let digit = (n % 36) as usize;
        digits.push(BASE36_ALPHABET[digit]);
        n /= 36;
    }
    while digits.len() < 7 {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

/// Parse a base36 string back into an id.
///
/// # Errors
///
/// `Malformed` if `text` contains characters outside `0-9A-Z` (case
/// insensitive) or overflows `u64`.
pub fn from_base36(text: &str) -> Result<u64, UniqueIdError> {
    let mut value: u64 = 0;
    for ch in text.to_ascii_uppercase().bytes() {
        let digit = BASE36_ALPHABET
            .iter()
            .position(|&c| c == ch)
            .ok_or_else(|| UniqueIdError::Malformed(format!("invalid base36 char: {}", ch as char)))?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| UniqueIdError::Malformed("base36 value overflows u64".to_string()))?;
    }
    Ok(value)
}
