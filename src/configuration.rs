//! Command-line configuration and validation.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

pub use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::{
    control::{ControlOptions, DEFAULT_CONTROL_PORT},
    crypto::{CryptoError, SharedSecret},
    error_estimate::{ErrorEstimate, ErrorEstimateError},
    modes::{Mode, ModeSet},
    security::Credentials,
    test_session::TestOptions,
};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("At least one packet per session is required")]
    ZeroPackets,

    #[error("At least one test session is required")]
    ZeroSessions,

    #[error("Reflection timeout must be at least one second")]
    ZeroTimeout,

    #[error("At least one mode must be allowed")]
    NoModes,

    #[error("Modes {0} need a shared secret (--secret or --secret-file)")]
    KeyedModeWithoutSecret(String),

    #[error("Keyed modes need a KeyID (--key-id)")]
    MissingKeyId,

    #[error("KeyID is {0} bytes, the limit is 80")]
    KeyIdTooLong(usize),

    #[error("DSCP {0} is out of range 0-63")]
    InvalidDscp(u8),

    #[error("Invalid error estimate: {0}")]
    ErrorEstimate(#[from] ErrorEstimateError),

    #[error("Invalid shared secret: {0}")]
    Secret(#[from] CryptoError),
}

/// Output format of the client report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary and result rows.
    #[default]
    Text,
    /// One JSON document for machine consumption.
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(author = "Piotr Olszewski", version, about, long_about = None)]
pub struct Configuration {
    /// TWAMP server address
    #[arg(short, long)]
    pub remote_addr: IpAddr,
    /// TWAMP-Control port of the server
    #[arg(short = 'p', long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub remote_port: u16,
    /// Local address for the control connection and test sockets
    #[arg(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// Allowed modes, comma separated: u (unauthenticated), a (authenticated), e (encrypted)
    #[arg(short, long, value_delimiter = ',', default_value = "u,a,e")]
    pub modes: Vec<Mode>,
    /// KeyID sent to the server in keyed modes
    #[arg(short, long)]
    pub key_id: Option<String>,
    /// Shared secret as a hex string
    #[arg(long, conflicts_with = "secret_file")]
    pub secret: Option<String>,
    /// File holding the shared secret (hex or pass-phrase)
    #[arg(long)]
    pub secret_file: Option<PathBuf>,
    /// Number of test sessions to request
    #[arg(short = 'n', long, default_value_t = 1)]
    pub sessions: u32,
    /// Packets sent per test session
    #[arg(short = 'c', long, default_value_t = 100)]
    pub packets: u32,
    /// Interval between packets in milliseconds
    #[arg(short, long, default_value_t = 100)]
    pub interval: u64,
    /// Seconds to wait for a reflection before a packet counts as lost
    #[arg(short, long, default_value_t = 2)]
    pub timeout: u64,
    /// Milliseconds to wait for each control message
    #[arg(long, default_value_t = 5000)]
    pub control_deadline: u64,
    /// Milliseconds between requesting the sessions and their start
    #[arg(long, default_value_t = 2000)]
    pub start_delay: u64,
    /// DSCP value for test packets
    #[arg(long, default_value_t = 0)]
    pub dscp: u8,
    /// Local clock is synchronized to an external source
    #[arg(long)]
    pub clock_synchronized: bool,
    /// Error estimate scale (0-63)
    #[arg(long, default_value_t = 0)]
    pub error_scale: u8,
    /// Error estimate multiplier (1-255)
    #[arg(long, default_value_t = 1)]
    pub error_multiplier: u8,
    /// Report format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
}

impl Configuration {
    /// # Errors
    /// The first problem found in the arguments.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.packets == 0 {
            return Err(ConfigurationError::ZeroPackets);
        }
        if self.sessions == 0 {
            return Err(ConfigurationError::ZeroSessions);
        }
        if self.timeout == 0 {
            return Err(ConfigurationError::ZeroTimeout);
        }
        if self.modes.is_empty() {
            return Err(ConfigurationError::NoModes);
        }
        if self.dscp > 63 {
            return Err(ConfigurationError::InvalidDscp(self.dscp));
        }
        self.error_estimate()?;

        if let Some(key_id) = &self.key_id {
            if key_id.len() > 80 {
                return Err(ConfigurationError::KeyIdTooLong(key_id.len()));
            }
        }

        let has_secret = self.secret.is_some() || self.secret_file.is_some();
        let only_keyed = self.modes.iter().all(|m| m.is_keyed());
        if only_keyed && !has_secret {
            let list: Vec<String> = self.modes.iter().map(Mode::to_string).collect();
            return Err(ConfigurationError::KeyedModeWithoutSecret(list.join(",")));
        }
        if has_secret && self.key_id.is_none() {
            return Err(ConfigurationError::MissingKeyId);
        }
        Ok(())
    }

    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_addr, self.remote_port)
    }

    #[must_use]
    pub fn mode_set(&self) -> ModeSet {
        ModeSet::from_modes(&self.modes)
    }

    /// Loads the shared secret, if one was given.
    ///
    /// # Errors
    /// Unreadable or malformed secrets.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigurationError> {
        let secret = match (&self.secret, &self.secret_file) {
            (Some(hex), _) => SharedSecret::from_hex(hex)?,
            (None, Some(path)) => SharedSecret::from_file(path)?,
            (None, None) => return Ok(None),
        };
        let key_id = self.key_id.clone().ok_or(ConfigurationError::MissingKeyId)?;
        Ok(Some(Credentials::new(key_id, secret)?))
    }

    /// # Errors
    /// Scale or multiplier out of range.
    pub fn error_estimate(&self) -> Result<ErrorEstimate, ConfigurationError> {
        Ok(ErrorEstimate::new(
            self.clock_synchronized,
            self.error_scale,
            self.error_multiplier,
        )?)
    }

    /// # Errors
    /// See [`Configuration::credentials`].
    pub fn control_options(&self) -> Result<ControlOptions, ConfigurationError> {
        Ok(ControlOptions {
            modes: self.mode_set(),
            credentials: self.credentials()?,
            control_deadline: Duration::from_millis(self.control_deadline),
        })
    }

    /// # Errors
    /// See [`Configuration::error_estimate`].
    pub fn test_options(&self) -> Result<TestOptions, ConfigurationError> {
        Ok(TestOptions {
            interval: Duration::from_millis(self.interval),
            error_estimate: self.error_estimate()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Configuration {
        let mut argv = vec!["twamp-client", "--remote-addr", "192.0.2.10"];
        argv.extend_from_slice(args);
        Configuration::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let conf = parse(&[]);
        assert_eq!(conf.remote(), "192.0.2.10:862".parse().unwrap());
        assert_eq!(
            conf.modes,
            vec![Mode::Unauthenticated, Mode::Authenticated, Mode::Encrypted]
        );
        assert_eq!(conf.mode_set(), ModeSet(0x07));
        assert_eq!(conf.sessions, 1);
        assert_eq!(conf.packets, 100);
        assert_eq!(conf.output_format, OutputFormat::Text);
        assert!(conf.validate().is_ok());
        assert!(conf.credentials().unwrap().is_none());
    }

    #[test]
    fn test_mode_list_parsing() {
        let conf = parse(&["-m", "a,e", "--secret", "00ff", "-k", "bob"]);
        assert_eq!(conf.modes, vec![Mode::Authenticated, Mode::Encrypted]);
        assert!(conf.validate().is_ok());
        let creds = conf.credentials().unwrap().unwrap();
        assert_eq!(creds.key_id, "bob");

        let bad = Configuration::try_parse_from([
            "twamp-client",
            "--remote-addr",
            "192.0.2.10",
            "-m",
            "u,x",
        ]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_keyed_only_needs_secret() {
        let conf = parse(&["-m", "a"]);
        assert!(matches!(
            conf.validate(),
            Err(ConfigurationError::KeyedModeWithoutSecret(_))
        ));

        let conf = parse(&["-m", "e", "--secret", "00ff"]);
        assert!(matches!(conf.validate(), Err(ConfigurationError::MissingKeyId)));
    }

    #[test]
    fn test_range_checks() {
        assert!(matches!(
            parse(&["-c", "0"]).validate(),
            Err(ConfigurationError::ZeroPackets)
        ));
        assert!(matches!(
            parse(&["-n", "0"]).validate(),
            Err(ConfigurationError::ZeroSessions)
        ));
        assert!(matches!(
            parse(&["-t", "0"]).validate(),
            Err(ConfigurationError::ZeroTimeout)
        ));
        assert!(matches!(
            parse(&["--dscp", "64"]).validate(),
            Err(ConfigurationError::InvalidDscp(64))
        ));
        assert!(matches!(
            parse(&["--error-scale", "64"]).validate(),
            Err(ConfigurationError::ErrorEstimate(_))
        ));
        assert!(matches!(
            parse(&["--error-multiplier", "0"]).validate(),
            Err(ConfigurationError::ErrorEstimate(_))
        ));
        let long_id = "k".repeat(81);
        assert!(matches!(
            parse(&["-k", &long_id]).validate(),
            Err(ConfigurationError::KeyIdTooLong(81))
        ));
    }

    #[test]
    fn test_secret_sources_conflict() {
        let both = Configuration::try_parse_from([
            "twamp-client",
            "--remote-addr",
            "192.0.2.10",
            "--secret",
            "00",
            "--secret-file",
            "/tmp/x",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_options_are_derived() {
        let conf = parse(&["-i", "20", "--control-deadline", "750", "--clock-synchronized"]);
        let test = conf.test_options().unwrap();
        assert_eq!(test.interval, Duration::from_millis(20));
        assert!(test.error_estimate.synchronized);
        let control = conf.control_options().unwrap();
        assert_eq!(control.control_deadline, Duration::from_millis(750));
        assert_eq!(control.modes, ModeSet(0x07));
    }
}
