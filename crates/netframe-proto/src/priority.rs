//! Packet priority.
//!
//! Advisory only (see §4.3/§5): a dispatcher MAY service higher-priority
//! packets ahead of lower ones from the same connection, but MUST preserve
//! FIFO order within a priority class. Priority never crosses connections.

/// Packet priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Background traffic.
    Low = 0,
    /// Default priority.
    #[default]
    Normal = 1,
    /// Serviced ahead of `Normal`/`Low` when the dispatcher has a choice.
    High = 2,
    /// Serviced ahead of all other classes.
    Urgent = 3,
}

impl Priority {
    /// Construct from the raw wire byte. Unknown values fall back to `Normal`
    /// rather than failing packet decode over a non-critical field.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Self {
        match byte {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Urgent,
            _ => Self::Normal,
        }
    }

    /// Raw wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_values() {
        for p in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
            assert_eq!(Priority::from_u8(p.to_u8()), p);
        }
    }

    #[test]
    fn unknown_byte_falls_back_to_normal() {
        assert_eq!(Priority::from_u8(0xFF), Priority::Normal);
    }

    #[test]
    fn ordering_matches_urgency() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
