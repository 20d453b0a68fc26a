//! TWAMP-Control message records (RFC 4656 Section 3, RFC 5357 Section 3).
//!
//! Each message is a fixed-size record. Reserved regions are kept as named `mbz`
//! fields: they are zero in [`Default`] values, written verbatim on encode and
//! copied (not checked) on decode. Decoding only enforces the exact length;
//! semantic checks belong to the control session.
//!
//! Messages sent after the Server-Start end with a 16-byte HMAC. The codec
//! treats it as an ordinary field; see [`crate::security`] for how it is filled.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use serde::Serialize;

use crate::{
    error::{FrameError, TwampError},
    modes::ModeSet,
    time::Timestamp,
    wire::{WireReader, WireWriter},
};

/// Length of the trailing HMAC field.
pub const HMAC_SIZE: usize = 16;
/// Session identifier length.
pub const SID_SIZE: usize = 16;

pub const SERVER_GREETING_SIZE: usize = 64;
pub const SETUP_RESPONSE_SIZE: usize = 164;
pub const SERVER_START_SIZE: usize = 48;
pub const REQUEST_SESSION_SIZE: usize = 112;
pub const ACCEPT_SESSION_SIZE: usize = 48;
pub const START_SESSIONS_SIZE: usize = 32;
pub const START_ACK_SIZE: usize = 32;
pub const STOP_SESSIONS_SIZE: usize = 32;

/// Command number of Start-Sessions.
pub const CMD_START_SESSIONS: u8 = 2;
/// Command number of Stop-Sessions.
pub const CMD_STOP_SESSIONS: u8 = 3;
/// Command number of Request-TW-Session.
pub const CMD_REQUEST_TW_SESSION: u8 = 5;

/// Opaque 16-byte session identifier.
pub type SessionId = [u8; SID_SIZE];

/// Accept field values (RFC 4656 Section 3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AcceptCode {
    Ok,
    Failure,
    InternalError,
    NotSupported,
    PermanentResourceLimitation,
    TemporaryResourceLimitation,
    Other(u8),
}

impl AcceptCode {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == AcceptCode::Ok
    }
}

impl From<u8> for AcceptCode {
    fn from(value: u8) -> Self {
        match value {
            0 => AcceptCode::Ok,
            1 => AcceptCode::Failure,
            2 => AcceptCode::InternalError,
            3 => AcceptCode::NotSupported,
            4 => AcceptCode::PermanentResourceLimitation,
            5 => AcceptCode::TemporaryResourceLimitation,
            other => AcceptCode::Other(other),
        }
    }
}

impl From<AcceptCode> for u8 {
    fn from(code: AcceptCode) -> Self {
        match code {
            AcceptCode::Ok => 0,
            AcceptCode::Failure => 1,
            AcceptCode::InternalError => 2,
            AcceptCode::NotSupported => 3,
            AcceptCode::PermanentResourceLimitation => 4,
            AcceptCode::TemporaryResourceLimitation => 5,
            AcceptCode::Other(v) => v,
        }
    }
}

impl fmt::Display for AcceptCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcceptCode::Ok => write!(f, "OK (0)"),
            AcceptCode::Failure => write!(f, "failure, reason unspecified (1)"),
            AcceptCode::InternalError => write!(f, "internal error (2)"),
            AcceptCode::NotSupported => write!(f, "some aspect of request is not supported (3)"),
            AcceptCode::PermanentResourceLimitation => {
                write!(f, "cannot perform request due to permanent resource limitations (4)")
            }
            AcceptCode::TemporaryResourceLimitation => {
                write!(f, "cannot perform request due to temporary resource limitations (5)")
            }
            AcceptCode::Other(v) => write!(f, "unknown code ({})", v),
        }
    }
}

/// Common interface of all control messages.
pub trait ControlMessage: Sized {
    /// Message name used in logs and errors.
    const NAME: &'static str;
    /// Exact encoded length.
    const SIZE: usize;
    /// Offset of the trailing HMAC, for messages that carry one.
    const HMAC_OFFSET: Option<usize>;

    /// Serializes to exactly [`Self::SIZE`] bytes.
    fn encode(&self) -> Vec<u8>;

    /// Parses a buffer of exactly [`Self::SIZE`] bytes.
    ///
    /// # Errors
    /// `FrameError` for any other length.
    fn decode(buf: &[u8]) -> Result<Self, FrameError>;
}

macro_rules! control_message {
    ($ty:ident, $name:literal, $size:expr, $hmac:expr) => {
        impl ControlMessage for $ty {
            const NAME: &'static str = $name;
            const SIZE: usize = $size;
            const HMAC_OFFSET: Option<usize> = $hmac;

            fn encode(&self) -> Vec<u8> {
                self.to_bytes().to_vec()
            }

            fn decode(buf: &[u8]) -> Result<Self, FrameError> {
                Self::from_bytes(buf)
            }
        }
    };
}

/// Server Greeting, the first message on a control connection.
///
/// ```text
///  Unused (12) | Modes (4) | Challenge (16) | Salt (16) | Count (4) | MBZ (12)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerGreeting {
    pub unused: [u8; 12],
    pub modes: u32,
    pub challenge: [u8; 16],
    pub salt: [u8; 16],
    /// PBKDF2 iteration count.
    pub count: u32,
    pub mbz: [u8; 12],
}

impl ServerGreeting {
    pub fn to_bytes(&self) -> [u8; SERVER_GREETING_SIZE] {
        WireWriter::new()
            .bytes(&self.unused)
            .u32(self.modes)
            .bytes(&self.challenge)
            .bytes(&self.salt)
            .u32(self.count)
            .bytes(&self.mbz)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            unused: r.array(),
            modes: r.u32(),
            challenge: r.array(),
            salt: r.array(),
            count: r.u32(),
            mbz: r.array(),
        })
    }
}

control_message!(ServerGreeting, "Server-Greeting", SERVER_GREETING_SIZE, None);

/// Checks the greeting before anything is derived from it.
///
/// The Modes field must be non-zero (zero means the server refuses to talk),
/// must offer at least one security mode and must not set reserved bits.
///
/// # Errors
/// `TwampError::ProtocolViolation` describing the first problem found.
pub fn validate_server_greeting(greeting: &ServerGreeting) -> Result<ModeSet, TwampError> {
    let modes = ModeSet(greeting.modes);

    if modes.0 == 0 {
        return Err(TwampError::ProtocolViolation(
            "Server-Greeting offers no modes".to_string(),
        ));
    }
    if modes.reserved_bits() != 0 {
        return Err(TwampError::ProtocolViolation(format!(
            "Server-Greeting sets reserved mode bits {:#x}",
            modes.reserved_bits()
        )));
    }
    if !modes.has_security_mode() {
        return Err(TwampError::ProtocolViolation(format!(
            "Server-Greeting modes {:#x} contain no security mode",
            modes.0
        )));
    }
    Ok(modes)
}

/// Set-Up-Response, the client's answer to the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupResponse {
    pub mode: u32,
    /// UTF-8 key identifier, zero padded. MBZ when unauthenticated.
    pub key_id: [u8; 80],
    /// Encrypted challenge and session keys. MBZ when unauthenticated.
    pub token: [u8; 64],
    pub client_iv: [u8; 16],
}

impl Default for SetupResponse {
    fn default() -> Self {
        SetupResponse {
            mode: 0,
            key_id: [0u8; 80],
            token: [0u8; 64],
            client_iv: [0u8; 16],
        }
    }
}

impl SetupResponse {
    pub fn to_bytes(&self) -> [u8; SETUP_RESPONSE_SIZE] {
        WireWriter::new()
            .u32(self.mode)
            .bytes(&self.key_id)
            .bytes(&self.token)
            .bytes(&self.client_iv)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            mode: r.u32(),
            key_id: r.array(),
            token: r.array(),
            client_iv: r.array(),
        })
    }
}

control_message!(SetupResponse, "Set-Up-Response", SETUP_RESPONSE_SIZE, None);

/// Server-Start, the server's verdict on the Set-Up-Response.
///
/// The first two 16-byte blocks travel in the clear; in keyed modes the last
/// block (Start-Time and MBZ) is encrypted with the server IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStart {
    pub mbz1: [u8; 15],
    pub accept: u8,
    pub server_iv: [u8; 16],
    pub start_time: Timestamp,
    pub mbz2: [u8; 8],
}

impl ServerStart {
    /// Offset of the first encrypted byte in keyed modes.
    pub const CLEAR_PREFIX: usize = 32;

    pub fn accept_code(&self) -> AcceptCode {
        AcceptCode::from(self.accept)
    }

    pub fn to_bytes(&self) -> [u8; SERVER_START_SIZE] {
        WireWriter::new()
            .bytes(&self.mbz1)
            .u8(self.accept)
            .bytes(&self.server_iv)
            .timestamp(self.start_time)
            .bytes(&self.mbz2)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            mbz1: r.array(),
            accept: r.u8(),
            server_iv: r.array(),
            start_time: r.timestamp(),
            mbz2: r.array(),
        })
    }
}

control_message!(ServerStart, "Server-Start", SERVER_START_SIZE, None);

/// Request-TW-Session (RFC 5357 Section 3.5).
///
/// Addresses occupy 16 octets each; IPv4 addresses use the first 4 and leave
/// the remaining 12 zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSession {
    pub command: u8,
    /// 4 or 6.
    pub ipvn: u8,
    /// MBZ in TWAMP.
    pub conf_sender: u8,
    /// MBZ in TWAMP.
    pub conf_receiver: u8,
    /// Number of schedule slots, MBZ in TWAMP.
    pub slots: u32,
    pub packets: u32,
    pub sender_port: u16,
    pub receiver_port: u16,
    pub sender_address: [u8; 16],
    pub receiver_address: [u8; 16],
    pub sid: SessionId,
    pub padding_length: u32,
    pub start_time: Timestamp,
    /// Relative timeout in timestamp format.
    pub timeout: Timestamp,
    pub type_p: u32,
    pub mbz: [u8; 8],
    pub hmac: [u8; HMAC_SIZE],
}

impl Default for RequestSession {
    fn default() -> Self {
        RequestSession {
            command: CMD_REQUEST_TW_SESSION,
            ipvn: 4,
            conf_sender: 0,
            conf_receiver: 0,
            slots: 0,
            packets: 0,
            sender_port: 0,
            receiver_port: 0,
            sender_address: [0u8; 16],
            receiver_address: [0u8; 16],
            sid: [0u8; SID_SIZE],
            padding_length: 0,
            start_time: Timestamp::default(),
            timeout: Timestamp::default(),
            type_p: 0,
            mbz: [0u8; 8],
            hmac: [0u8; HMAC_SIZE],
        }
    }
}

/// Address family number and the 16-octet address field for `addr`.
#[must_use]
pub fn encode_address(addr: IpAddr) -> (u8, [u8; 16]) {
    let mut field = [0u8; 16];
    match addr {
        IpAddr::V4(v4) => {
            field[..4].copy_from_slice(&v4.octets());
            (4, field)
        }
        IpAddr::V6(v6) => (6, v6.octets()),
    }
}

/// Inverse of [`encode_address`]; `None` for an unknown IPVN.
#[must_use]
pub fn decode_address(ipvn: u8, field: &[u8; 16]) -> Option<IpAddr> {
    match ipvn {
        4 => Some(IpAddr::V4(Ipv4Addr::new(
            field[0], field[1], field[2], field[3],
        ))),
        6 => Some(IpAddr::V6(Ipv6Addr::from(*field))),
        _ => None,
    }
}

/// Type-P descriptor carrying a DSCP value (RFC 4656 Section 3.5, format 00).
#[must_use]
pub fn type_p_from_dscp(dscp: u8) -> u32 {
    (dscp & 0x3F) as u32
}

impl RequestSession {
    #[must_use]
    pub fn sender_ip(&self) -> Option<IpAddr> {
        decode_address(self.ipvn, &self.sender_address)
    }

    #[must_use]
    pub fn receiver_ip(&self) -> Option<IpAddr> {
        decode_address(self.ipvn, &self.receiver_address)
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_SESSION_SIZE] {
        WireWriter::new()
            .u8(self.command)
            .u8(self.ipvn)
            .u8(self.conf_sender)
            .u8(self.conf_receiver)
            .u32(self.slots)
            .u32(self.packets)
            .u16(self.sender_port)
            .u16(self.receiver_port)
            .bytes(&self.sender_address)
            .bytes(&self.receiver_address)
            .bytes(&self.sid)
            .u32(self.padding_length)
            .timestamp(self.start_time)
            .timestamp(self.timeout)
            .u32(self.type_p)
            .bytes(&self.mbz)
            .bytes(&self.hmac)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            command: r.u8(),
            ipvn: r.u8(),
            conf_sender: r.u8(),
            conf_receiver: r.u8(),
            slots: r.u32(),
            packets: r.u32(),
            sender_port: r.u16(),
            receiver_port: r.u16(),
            sender_address: r.array(),
            receiver_address: r.array(),
            sid: r.array(),
            padding_length: r.u32(),
            start_time: r.timestamp(),
            timeout: r.timestamp(),
            type_p: r.u32(),
            mbz: r.array(),
            hmac: r.array(),
        })
    }
}

control_message!(RequestSession, "Request-TW-Session", REQUEST_SESSION_SIZE, Some(96));

/// Accept-Session, the server's answer to one Request-TW-Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptSession {
    pub accept: u8,
    pub mbz1: u8,
    /// Reflector UDP port.
    pub port: u16,
    pub sid: SessionId,
    pub mbz2: [u8; 12],
    pub hmac: [u8; HMAC_SIZE],
}

impl AcceptSession {
    pub fn accept_code(&self) -> AcceptCode {
        AcceptCode::from(self.accept)
    }

    pub fn to_bytes(&self) -> [u8; ACCEPT_SESSION_SIZE] {
        WireWriter::new()
            .u8(self.accept)
            .u8(self.mbz1)
            .u16(self.port)
            .bytes(&self.sid)
            .bytes(&self.mbz2)
            .bytes(&self.hmac)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            accept: r.u8(),
            mbz1: r.u8(),
            port: r.u16(),
            sid: r.array(),
            mbz2: r.array(),
            hmac: r.array(),
        })
    }
}

control_message!(AcceptSession, "Accept-Session", ACCEPT_SESSION_SIZE, Some(32));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSessions {
    pub command: u8,
    pub mbz: [u8; 15],
    pub hmac: [u8; HMAC_SIZE],
}

impl Default for StartSessions {
    fn default() -> Self {
        StartSessions {
            command: CMD_START_SESSIONS,
            mbz: [0u8; 15],
            hmac: [0u8; HMAC_SIZE],
        }
    }
}

impl StartSessions {
    pub fn to_bytes(&self) -> [u8; START_SESSIONS_SIZE] {
        WireWriter::new()
            .u8(self.command)
            .bytes(&self.mbz)
            .bytes(&self.hmac)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            command: r.u8(),
            mbz: r.array(),
            hmac: r.array(),
        })
    }
}

control_message!(StartSessions, "Start-Sessions", START_SESSIONS_SIZE, Some(16));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartAck {
    pub accept: u8,
    pub mbz: [u8; 15],
    pub hmac: [u8; HMAC_SIZE],
}

impl StartAck {
    pub fn accept_code(&self) -> AcceptCode {
        AcceptCode::from(self.accept)
    }

    pub fn to_bytes(&self) -> [u8; START_ACK_SIZE] {
        WireWriter::new()
            .u8(self.accept)
            .bytes(&self.mbz)
            .bytes(&self.hmac)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            accept: r.u8(),
            mbz: r.array(),
            hmac: r.array(),
        })
    }
}

control_message!(StartAck, "Start-Ack", START_ACK_SIZE, Some(16));

/// Stop-Sessions; TWAMP uses it without per-session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSessions {
    pub command: u8,
    pub accept: u8,
    pub mbz1: [u8; 2],
    /// Number of sessions being stopped.
    pub sessions: u32,
    pub mbz2: [u8; 8],
    pub hmac: [u8; HMAC_SIZE],
}

impl StopSessions {
    #[must_use]
    pub fn new(sessions: u32) -> Self {
        StopSessions {
            command: CMD_STOP_SESSIONS,
            accept: 0,
            mbz1: [0u8; 2],
            sessions,
            mbz2: [0u8; 8],
            hmac: [0u8; HMAC_SIZE],
        }
    }

    pub fn to_bytes(&self) -> [u8; STOP_SESSIONS_SIZE] {
        WireWriter::new()
            .u8(self.command)
            .u8(self.accept)
            .bytes(&self.mbz1)
            .u32(self.sessions)
            .bytes(&self.mbz2)
            .bytes(&self.hmac)
            .finish()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check(Self::NAME, Self::SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            command: r.u8(),
            accept: r.u8(),
            mbz1: r.array(),
            sessions: r.u32(),
            mbz2: r.array(),
            hmac: r.array(),
        })
    }
}

control_message!(StopSessions, "Stop-Sessions", STOP_SESSIONS_SIZE, Some(16));

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_roundtrip<M: ControlMessage + PartialEq + fmt::Debug>(msg: M) {
        let bytes = msg.encode();
        assert_eq!(bytes.len(), M::SIZE, "{} encoded length", M::NAME);
        assert_eq!(M::decode(&bytes).unwrap(), msg, "{} roundtrip", M::NAME);
    }

    fn assert_exact_framing<M: ControlMessage + fmt::Debug>() {
        let big = vec![0u8; M::SIZE + 1];
        for len in [0, 1, M::SIZE - 1, M::SIZE + 1] {
            let err = M::decode(&big[..len]).unwrap_err();
            assert_eq!(err.expected, M::SIZE);
            assert_eq!(err.actual, len);
        }
        assert!(M::decode(&big[..M::SIZE]).is_ok());
    }

    #[test]
    fn test_sizes_match_wire_layout() {
        assert_eq!(ServerGreeting::default().to_bytes().len(), 64);
        assert_eq!(SetupResponse::default().to_bytes().len(), 164);
        assert_eq!(ServerStart::default().to_bytes().len(), 48);
        assert_eq!(RequestSession::default().to_bytes().len(), 112);
        assert_eq!(AcceptSession::default().to_bytes().len(), 48);
        assert_eq!(StartSessions::default().to_bytes().len(), 32);
        assert_eq!(StartAck::default().to_bytes().len(), 32);
        assert_eq!(StopSessions::new(1).to_bytes().len(), 32);
    }

    #[test]
    fn test_every_kind_rejects_wrong_length() {
        assert_exact_framing::<ServerGreeting>();
        assert_exact_framing::<SetupResponse>();
        assert_exact_framing::<ServerStart>();
        assert_exact_framing::<RequestSession>();
        assert_exact_framing::<AcceptSession>();
        assert_exact_framing::<StartSessions>();
        assert_exact_framing::<StartAck>();
        assert_exact_framing::<StopSessions>();
    }

    #[test]
    fn test_every_kind_roundtrips_all_zero_and_all_max() {
        for fill in [0x00u8, 0xFF] {
            let bytes = vec![fill; 164];
            assert_roundtrip(ServerGreeting::decode(&bytes[..64]).unwrap());
            assert_roundtrip(SetupResponse::decode(&bytes[..164]).unwrap());
            assert_roundtrip(ServerStart::decode(&bytes[..48]).unwrap());
            assert_roundtrip(RequestSession::decode(&bytes[..112]).unwrap());
            assert_roundtrip(AcceptSession::decode(&bytes[..48]).unwrap());
            assert_roundtrip(StartSessions::decode(&bytes[..32]).unwrap());
            assert_roundtrip(StartAck::decode(&bytes[..32]).unwrap());
            assert_roundtrip(StopSessions::decode(&bytes[..32]).unwrap());

            // decode keeps reserved bytes as they were
            let greeting = ServerGreeting::decode(&bytes[..64]).unwrap();
            assert_eq!(greeting.mbz, [fill; 12]);
            assert_eq!(greeting.encode(), bytes[..64].to_vec());
        }
    }

    #[test]
    fn test_server_greeting_layout() {
        let greeting = ServerGreeting {
            modes: 0x0000_0007,
            challenge: [0x11; 16],
            salt: [0x22; 16],
            count: 1024,
            ..Default::default()
        };
        let b = greeting.to_bytes();
        assert_eq!(&b[..12], &[0u8; 12]);
        assert_eq!(&b[12..16], &[0, 0, 0, 7]);
        assert_eq!(&b[16..32], &[0x11; 16]);
        assert_eq!(&b[32..48], &[0x22; 16]);
        assert_eq!(&b[48..52], &1024u32.to_be_bytes());
        assert_eq!(&b[52..64], &[0u8; 12]);
    }

    #[test]
    fn test_server_start_layout() {
        let start = ServerStart {
            accept: 3,
            server_iv: [0xA5; 16],
            start_time: Timestamp(0x0102_0304_0506_0708),
            ..Default::default()
        };
        let b = start.to_bytes();
        assert_eq!(b[15], 3);
        assert_eq!(&b[16..32], &[0xA5; 16]);
        assert_eq!(&b[32..40], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(start.accept_code(), AcceptCode::NotSupported);
    }

    #[test]
    fn test_request_session_layout() {
        let (ipvn, sender) = encode_address("192.0.2.1".parse().unwrap());
        let (_, receiver) = encode_address("198.51.100.7".parse().unwrap());
        let req = RequestSession {
            ipvn,
            packets: 100,
            sender_port: 40000,
            receiver_port: 862,
            sender_address: sender,
            receiver_address: receiver,
            sid: [0x5A; 16],
            padding_length: 114,
            start_time: Timestamp::new(1, 2),
            timeout: Timestamp::new(3, 0),
            type_p: type_p_from_dscp(46),
            hmac: [0xEE; 16],
            ..Default::default()
        };
        let b = req.to_bytes();
        assert_eq!(b[0], CMD_REQUEST_TW_SESSION);
        assert_eq!(b[1], 4);
        assert_eq!(&b[8..12], &100u32.to_be_bytes());
        assert_eq!(&b[12..14], &40000u16.to_be_bytes());
        assert_eq!(&b[14..16], &862u16.to_be_bytes());
        assert_eq!(&b[16..20], &[192, 0, 2, 1]);
        assert_eq!(&b[20..32], &[0u8; 12]);
        assert_eq!(&b[32..36], &[198, 51, 100, 7]);
        assert_eq!(&b[48..64], &[0x5A; 16]);
        assert_eq!(&b[64..68], &114u32.to_be_bytes());
        assert_eq!(&b[76..80], &3u32.to_be_bytes());
        assert_eq!(&b[84..88], &46u32.to_be_bytes());
        assert_eq!(&b[96..112], &[0xEE; 16]);

        assert_eq!(req.sender_ip(), Some("192.0.2.1".parse().unwrap()));
        assert_eq!(req.receiver_ip(), Some("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_addresses_fill_the_field() {
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        let (ipvn, field) = encode_address(addr);
        assert_eq!(ipvn, 6);
        assert_eq!(decode_address(ipvn, &field), Some(addr));
        assert_eq!(decode_address(5, &field), None);
    }

    #[test]
    fn test_accept_session_layout() {
        let accept = AcceptSession {
            accept: 0,
            port: 20001,
            sid: [7; 16],
            hmac: [9; 16],
            ..Default::default()
        };
        let b = accept.to_bytes();
        assert_eq!(&b[2..4], &20001u16.to_be_bytes());
        assert_eq!(&b[4..20], &[7; 16]);
        assert_eq!(&b[20..32], &[0; 12]);
        assert_eq!(&b[32..48], &[9; 16]);
        assert!(accept.accept_code().is_ok());
    }

    #[test]
    fn test_stop_sessions_layout() {
        let b = StopSessions::new(3).to_bytes();
        assert_eq!(b[0], CMD_STOP_SESSIONS);
        assert_eq!(b[1], 0);
        assert_eq!(&b[4..8], &3u32.to_be_bytes());
        assert_eq!(&b[8..32], &[0u8; 24]);
    }

    #[test]
    fn test_start_sessions_command() {
        assert_eq!(StartSessions::default().to_bytes()[0], CMD_START_SESSIONS);
    }

    #[test]
    fn test_accept_codes() {
        for v in 0..=255u8 {
            assert_eq!(u8::from(AcceptCode::from(v)), v);
        }
        assert_eq!(AcceptCode::from(5), AcceptCode::TemporaryResourceLimitation);
        assert_eq!(AcceptCode::from(200), AcceptCode::Other(200));
    }

    #[test]
    fn test_greeting_validation() {
        let ok = ServerGreeting {
            modes: 0x03,
            ..Default::default()
        };
        assert_eq!(validate_server_greeting(&ok).unwrap(), ModeSet(0x03));

        for modes in [0x0, 0x100, 0x20] {
            let bad = ServerGreeting {
                modes,
                ..Default::default()
            };
            assert!(matches!(
                validate_server_greeting(&bad),
                Err(TwampError::ProtocolViolation(_))
            ));
        }
    }
}
