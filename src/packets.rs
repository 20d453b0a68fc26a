//! TWAMP-Test packet structures (RFC 5357 Section 4.1.2, RFC 6038 symmetric size).
//!
//! Both directions use a fixed 128-byte packet. The sender layout matches the
//! reflected layout in size, so the reflector can answer in place; padding
//! absorbs the difference. In encrypted mode the whole 128 bytes go through
//! the cipher (see [`crate::security::TestCipher`]).

use crate::{
    error::FrameError,
    modes::Mode,
    time::Timestamp,
    wire::{WireReader, WireWriter},
};

/// Size of every test packet on the wire.
pub const TEST_PACKET_SIZE: usize = 128;

/// Base sender packet sizes from RFC 5357; `PaddingLength` is counted on top of these.
const UNAUTH_BASE_SIZE: usize = 14;
const KEYED_BASE_SIZE: usize = 48;

/// Padding length to request so the reflector answers with 128-byte packets.
#[must_use]
pub fn padding_length(mode: Mode) -> u32 {
    let base = match mode {
        Mode::Unauthenticated => UNAUTH_BASE_SIZE,
        Mode::Authenticated | Mode::Encrypted => KEYED_BASE_SIZE,
    };
    (TEST_PACKET_SIZE - base) as u32
}

/// Test packet sent by the Session-Sender.
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Sequence Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Timestamp                            |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Error Estimate         |                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+        MBZ (27 octets)        |
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Padding alignment (3)                       |  Cookie (24)   |
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Padding (60 octets)                      |
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The MBZ region lines up with the reflected packet's fields so that a
/// symmetric-size reflector (RFC 6038) can overwrite it. Some servers pair
/// control and test sessions through the cookie at offset 44.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TestPacket {
    pub sequence_number: u32,
    pub timestamp: Timestamp,
    pub error_estimate: u16,
    pub mbz: [u8; 27],
    pub padding_align: [u8; 3],
    pub cookie: [u8; 24],
    pub padding: [u8; 60],
}

impl Default for TestPacket {
    fn default() -> Self {
        TestPacket {
            sequence_number: 0,
            timestamp: Timestamp::default(),
            error_estimate: 0,
            mbz: [0u8; 27],
            padding_align: [0u8; 3],
            cookie: [0u8; 24],
            padding: [0u8; 60],
        }
    }
}

impl TestPacket {
    pub fn to_bytes(&self) -> [u8; TEST_PACKET_SIZE] {
        WireWriter::new()
            .u32(self.sequence_number)
            .timestamp(self.timestamp)
            .u16(self.error_estimate)
            .bytes(&self.mbz)
            .bytes(&self.padding_align)
            .bytes(&self.cookie)
            .bytes(&self.padding)
            .finish()
    }

    /// Deserializes a packet from big-endian wire format.
    ///
    /// # Errors
    /// Returns `FrameError` unless the buffer is exactly 128 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check("TestPacket", TEST_PACKET_SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            sequence_number: r.u32(),
            timestamp: r.timestamp(),
            error_estimate: r.u16(),
            mbz: r.array(),
            padding_align: r.array(),
            cookie: r.array(),
            padding: r.array(),
        })
    }
}

/// Test packet returned by the Session-Reflector.
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Sequence Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Timestamp                            |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Error Estimate         |           MBZ                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Receive Timestamp                       |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Sender Sequence Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Sender Timestamp                         |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Sender Error Estimate    |           MBZ                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Sender TTL   |            Padding (87 octets)                |
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReflectedTestPacket {
    /// Reflector's own sequence number.
    pub sequence_number: u32,
    /// When the reflector sent this packet.
    pub timestamp: Timestamp,
    pub error_estimate: u16,
    pub mbz1: [u8; 2],
    /// When the reflector received the sender's packet.
    pub receive_timestamp: Timestamp,
    pub sess_sender_seq_number: u32,
    pub sess_sender_timestamp: Timestamp,
    pub sess_sender_err_estimate: u16,
    pub mbz2: [u8; 2],
    /// TTL / hop limit of the sender's packet as seen by the reflector.
    pub sess_sender_ttl: u8,
    pub padding: [u8; 87],
}

impl Default for ReflectedTestPacket {
    fn default() -> Self {
        ReflectedTestPacket {
            sequence_number: 0,
            timestamp: Timestamp::default(),
            error_estimate: 0,
            mbz1: [0u8; 2],
            receive_timestamp: Timestamp::default(),
            sess_sender_seq_number: 0,
            sess_sender_timestamp: Timestamp::default(),
            sess_sender_err_estimate: 0,
            mbz2: [0u8; 2],
            sess_sender_ttl: 0,
            padding: [0u8; 87],
        }
    }
}

impl ReflectedTestPacket {
    /// Answer a reflector would build for `packet` (used by test reflectors).
    #[must_use]
    pub fn reflect(
        packet: &TestPacket,
        sequence_number: u32,
        receive_timestamp: Timestamp,
        send_timestamp: Timestamp,
        ttl: u8,
    ) -> Self {
        ReflectedTestPacket {
            sequence_number,
            timestamp: send_timestamp,
            error_estimate: packet.error_estimate,
            receive_timestamp,
            sess_sender_seq_number: packet.sequence_number,
            sess_sender_timestamp: packet.timestamp,
            sess_sender_err_estimate: packet.error_estimate,
            sess_sender_ttl: ttl,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; TEST_PACKET_SIZE] {
        WireWriter::new()
            .u32(self.sequence_number)
            .timestamp(self.timestamp)
            .u16(self.error_estimate)
            .bytes(&self.mbz1)
            .timestamp(self.receive_timestamp)
            .u32(self.sess_sender_seq_number)
            .timestamp(self.sess_sender_timestamp)
            .u16(self.sess_sender_err_estimate)
            .bytes(&self.mbz2)
            .u8(self.sess_sender_ttl)
            .bytes(&self.padding)
            .finish()
    }

    /// Deserializes a packet from big-endian wire format.
    ///
    /// # Errors
    /// Returns `FrameError` unless the buffer is exactly 128 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        FrameError::check("ReflectedTestPacket", TEST_PACKET_SIZE, buf)?;
        let mut r = WireReader::new(buf);
        Ok(Self {
            sequence_number: r.u32(),
            timestamp: r.timestamp(),
            error_estimate: r.u16(),
            mbz1: r.array(),
            receive_timestamp: r.timestamp(),
            sess_sender_seq_number: r.u32(),
            sess_sender_timestamp: r.timestamp(),
            sess_sender_err_estimate: r.u16(),
            mbz2: r.array(),
            sess_sender_ttl: r.u8(),
            padding: r.array(),
        })
    }
}
