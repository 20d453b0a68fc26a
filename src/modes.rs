use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::error::TwampError;

/// Security mode of a control session (RFC 4656 Section 3.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Nothing is authenticated or encrypted.
    Unauthenticated,
    /// Control messages are encrypted and carry HMACs; test packets are sent in the clear.
    Authenticated,
    /// As authenticated, and test packets are encrypted too.
    Encrypted,
}

impl Mode {
    /// Strongest first.
    pub const PREFERENCE: [Mode; 3] = [Mode::Encrypted, Mode::Authenticated, Mode::Unauthenticated];

    /// Value of this mode in the Modes / Mode fields.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Mode::Unauthenticated => 1,
            Mode::Authenticated => 2,
            Mode::Encrypted => 4,
        }
    }

    /// Whether control messages need session keys.
    #[must_use]
    pub const fn is_keyed(self) -> bool {
        !matches!(self, Mode::Unauthenticated)
    }

    #[must_use]
    pub fn from_bit(bit: u32) -> Option<Self> {
        match bit {
            1 => Some(Mode::Unauthenticated),
            2 => Some(Mode::Authenticated),
            4 => Some(Mode::Encrypted),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ModesError {
    #[error("Invalid TWAMP mode '{0}' (expected u, a or e)")]
    InvalidMode(String),
}

impl FromStr for Mode {
    type Err = ModesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u" => Ok(Mode::Unauthenticated),
            "a" => Ok(Mode::Authenticated),
            "e" => Ok(Mode::Encrypted),
            _ => Err(ModesError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Mode::Unauthenticated => write!(f, "u"),
            Mode::Authenticated => write!(f, "a"),
            Mode::Encrypted => write!(f, "e"),
        }
    }
}

/// Bitmask from the Server Greeting `Modes` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ModeSet(pub u32);

impl ModeSet {
    /// Unauthenticated, authenticated and encrypted.
    pub const SECURITY_MASK: u32 = 0x07;
    /// RFC 5618 mixed security mode.
    pub const MIXED_SECURITY: u32 = 0x08;
    /// RFC 5938 individual session control.
    pub const INDIVIDUAL_SESSION_CONTROL: u32 = 0x10;
    /// RFC 6038 reflect octets.
    pub const REFLECT_OCTETS: u32 = 0x20;
    /// RFC 6038 symmetrical size.
    pub const SYMMETRICAL_SIZE: u32 = 0x40;
    /// RFC 7717 IKEv2-derived shared key.
    pub const IKEV2_DERIVED_KEY: u32 = 0x80;
    /// Every bit assigned so far; anything else is reserved.
    pub const KNOWN_MASK: u32 = 0xFF;

    #[must_use]
    pub fn from_modes(modes: &[Mode]) -> Self {
        ModeSet(modes.iter().fold(0, |acc, m| acc | m.bit()))
    }

    #[must_use]
    pub fn contains(self, mode: Mode) -> bool {
        self.0 & mode.bit() != 0
    }

    #[must_use]
    pub fn reserved_bits(self) -> u32 {
        self.0 & !Self::KNOWN_MASK
    }

    #[must_use]
    pub fn has_security_mode(self) -> bool {
        self.0 & Self::SECURITY_MASK != 0
    }
}

/// Picks the strongest mode present in both the server's and the client's set.
///
/// # Errors
/// `TwampError::NoCommonMode` when the sets share no security mode.
pub fn select_mode(server: ModeSet, client: ModeSet) -> Result<Mode, TwampError> {
    Mode::PREFERENCE
        .into_iter()
        .find(|m| server.contains(*m) && client.contains(*m))
        .ok_or(TwampError::NoCommonMode {
            server: server.0,
            client: client.0,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for (s, mode) in [
            ("u", Mode::Unauthenticated),
            ("a", Mode::Authenticated),
            ("e", Mode::Encrypted),
        ] {
            assert_eq!(s.parse::<Mode>().unwrap(), mode);
            assert_eq!(mode.to_string(), s);
        }
        assert!("x".parse::<Mode>().is_err());
        assert!("U".parse::<Mode>().is_err());
    }

    #[test]
    fn test_selects_authenticated_when_server_lacks_encrypted() {
        let server = ModeSet::from_modes(&[Mode::Unauthenticated, Mode::Authenticated]);
        let client = ModeSet::from_modes(&[
            Mode::Unauthenticated,
            Mode::Authenticated,
            Mode::Encrypted,
        ]);
        assert_eq!(select_mode(server, client).unwrap(), Mode::Authenticated);
    }

    #[test]
    fn test_prefers_encrypted() {
        let all = ModeSet(0x07);
        assert_eq!(select_mode(all, all).unwrap(), Mode::Encrypted);
    }

    #[test]
    fn test_extension_bits_do_not_count_as_common() {
        let server = ModeSet(Mode::Encrypted.bit() | ModeSet::REFLECT_OCTETS);
        let client = ModeSet(Mode::Unauthenticated.bit() | ModeSet::REFLECT_OCTETS);
        assert!(matches!(
            select_mode(server, client),
            Err(TwampError::NoCommonMode { .. })
        ));
    }

    #[test]
    fn test_disjoint_sets_fail() {
        let server = ModeSet::from_modes(&[Mode::Encrypted]);
        let client = ModeSet::from_modes(&[Mode::Unauthenticated, Mode::Authenticated]);
        assert!(matches!(
            select_mode(server, client),
            Err(TwampError::NoCommonMode { server: 4, client: 3 })
        ));
    }

    #[test]
    fn test_reserved_bits() {
        assert_eq!(ModeSet(0x7F).reserved_bits(), 0);
        assert_eq!(ModeSet(0x101).reserved_bits(), 0x100);
        assert!(!ModeSet(0x20).has_security_mode());
    }
}
