//! TWAMP client - Two-Way Active Measurement Protocol control and test client.
//!
//! This crate negotiates TWAMP-Control sessions (RFC 4656, RFC 5357) over TCP in
//! unauthenticated, authenticated or encrypted mode, exchanges TWAMP-Test probes
//! over UDP and collects per-packet delay rows. It also renders TCP throughput
//! results as an LMAP-style report table.
//!
//! # Usage
//!
//! ```bash
//! twamp-client --remote-addr 192.0.2.10 --packets 100 --interval 20
//! ```
//!
//! Keyed modes need a KeyID and shared secret:
//! ```bash
//! twamp-client -r 192.0.2.10 -m a,e -k client-1 --secret-file /etc/twamp/secret
//! ```

/// Client orchestration used by the binary.
pub mod client;
/// Command-line configuration and validation.
pub mod configuration;
/// Control session state machine.
pub mod control;
/// Key derivation, HMAC and AES-CBC primitives.
pub mod crypto;
/// Error types shared across the crate.
pub mod error;
/// Error estimate encoding/decoding for timestamps.
pub mod error_estimate;
/// TWAMP-Control message records.
pub mod messages;
/// Security modes and mode selection.
pub mod modes;
/// TWAMP-Test packet structures.
pub mod packets;
/// LMAP throughput report rendering.
pub mod report;
/// Per-connection security context.
pub mod security;
/// Test session packet exchange.
pub mod test_session;
/// NTP timestamps and clocks.
pub mod time;
/// Control and test transport seams.
pub mod transport;

mod wire;
