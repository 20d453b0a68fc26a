//! Error Estimate field of TWAMP-Test packets (RFC 4656 Section 4.1.2).
//!
//! Layout: S (1 bit) | Z (1 bit) | Scale (6 bits) | Multiplier (8 bits).
//!
//! - S: the sending host's clock is synchronized to UTC.
//! - Z: timestamp format (RFC 8186). This client always sends 0 (NTP format),
//!   but keeps whatever the reflector reports.
//! - Estimated error in seconds is `Multiplier * 2^(Scale - 32)`.

use serde::Serialize;
use thiserror::Error;

/// Decoded Error Estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorEstimate {
    /// S bit.
    pub synchronized: bool,
    /// Z bit; set by reflectors using PTP timestamps.
    pub z_flag: bool,
    /// Scale (0-63).
    pub scale: u8,
    /// Multiplier (0-255). RFC 4656 forbids zero in packets we send.
    pub multiplier: u8,
}

const S_BIT: u16 = 0x8000;
const Z_BIT: u16 = 0x4000;
const SCALE_MASK: u16 = 0x3F;
const MAX_SCALE: u8 = SCALE_MASK as u8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorEstimateError {
    #[error("Error estimate scale {0} is above {MAX_SCALE}")]
    ScaleOutOfRange(u8),

    #[error("Error estimate multiplier must not be zero")]
    ZeroMultiplier,
}

impl ErrorEstimate {
    /// Builds the estimate this client puts in its own packets (Z = 0).
    ///
    /// # Errors
    /// `ScaleOutOfRange` when `scale > 63`, `ZeroMultiplier` when `multiplier == 0`.
    pub fn new(synchronized: bool, scale: u8, multiplier: u8) -> Result<Self, ErrorEstimateError> {
        match (scale, multiplier) {
            (s, _) if s > MAX_SCALE => Err(ErrorEstimateError::ScaleOutOfRange(s)),
            (_, 0) => Err(ErrorEstimateError::ZeroMultiplier),
            _ => Ok(ErrorEstimate {
                synchronized,
                scale,
                multiplier,
                ..Default::default()
            }),
        }
    }

    /// S=0, Scale=0, Multiplier=1: the smallest legal estimate for a free-running clock.
    #[must_use]
    pub fn unsynchronized() -> Self {
        ErrorEstimate {
            multiplier: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn from_wire(value: u16) -> Self {
        let [high, low] = value.to_be_bytes();
        ErrorEstimate {
            synchronized: value & S_BIT != 0,
            z_flag: value & Z_BIT != 0,
            scale: high & MAX_SCALE,
            multiplier: low,
        }
    }

    #[must_use]
    pub fn to_wire(&self) -> u16 {
        let mut high = self.scale & MAX_SCALE;
        if self.synchronized {
            high |= (S_BIT >> 8) as u8;
        }
        if self.z_flag {
            high |= (Z_BIT >> 8) as u8;
        }
        u16::from_be_bytes([high, self.multiplier])
    }

    /// Estimated error in seconds.
    #[must_use]
    pub fn error_seconds(&self) -> f64 {
        f64::from(self.multiplier) * 2f64.powi(i32::from(self.scale) - 32)
    }
}

impl From<u16> for ErrorEstimate {
    fn from(value: u16) -> Self {
        ErrorEstimate::from_wire(value)
    }
}
