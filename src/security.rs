//! Security context of a control session.
//!
//! The mode is chosen once, right after the Server Greeting, and from then on
//! the control session only talks to [`SecurityContext`]; it never branches on
//! the mode itself. After negotiation the context is read-only. The running CBC
//! state of the control connection lives in [`ControlChains`], owned by the
//! control session, so the context can be shared with test sessions.
//!
//! Keyed modes (RFC 4656 Section 3.1):
//! - `K = PBKDF2-HMAC-SHA1(secret, Salt, Count)`, 16 bytes.
//! - Token = AES-CBC(K, IV = 0) over Challenge ‖ AES session key ‖ HMAC session key.
//! - Control messages after Set-Up-Response are AES-CBC encrypted with the
//!   session key; the client→server stream starts at the ClientIV, the
//!   server→client stream at the ServerIV.
//! - Messages with an HMAC field carry HMAC-SHA1/128 of the preceding bytes.

use std::fmt;

use log::debug;

use crate::{
    crypto::{derive_key, CbcChain, CryptoError, HmacKey, SharedSecret, AES_BLOCK_SIZE},
    error::TwampError,
    messages::{ServerGreeting, ServerStart, SessionId, SetupResponse, HMAC_SIZE},
    modes::{select_mode, Mode, ModeSet},
    packets::TEST_PACKET_SIZE,
};

/// Lowest iteration count RFC 4656 allows.
pub const MIN_COUNT: u32 = 1024;
/// Highest iteration count this client will spend time on.
pub const MAX_COUNT: u32 = 1 << 24;

const KEY_ID_SIZE: usize = 80;

/// KeyID and shared secret used for keyed modes.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub key_id: String,
    pub secret: SharedSecret,
}

impl Credentials {
    /// # Errors
    /// `CryptoError::KeyIdTooLong` when the identifier does not fit in 80 bytes.
    pub fn new(key_id: impl Into<String>, secret: SharedSecret) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        if key_id.len() > KEY_ID_SIZE {
            return Err(CryptoError::KeyIdTooLong(key_id.len()));
        }
        Ok(Credentials { key_id, secret })
    }

    fn key_id_field(&self) -> [u8; KEY_ID_SIZE] {
        let mut field = [0u8; KEY_ID_SIZE];
        let bytes = self.key_id.as_bytes();
        field[..bytes.len()].copy_from_slice(bytes);
        field
    }
}

/// Session keys and IV the client generates for one control connection.
#[derive(Clone)]
pub struct KeyMaterial {
    pub aes_key: [u8; 16],
    pub hmac_key: [u8; 32],
    pub client_iv: [u8; 16],
}

impl KeyMaterial {
    /// Fresh random keys and IV.
    #[must_use]
    pub fn generate() -> Self {
        KeyMaterial {
            aes_key: rand::random(),
            hmac_key: rand::random(),
            client_iv: rand::random(),
        }
    }

    /// Recovers the challenge and session keys from a Token, as the server does.
    ///
    /// # Errors
    /// Only fails on internal block alignment problems.
    pub fn open_token(
        secret: &SharedSecret,
        salt: &[u8; 16],
        count: u32,
        token: &[u8; 64],
    ) -> Result<([u8; 16], [u8; 16], [u8; 32]), CryptoError> {
        let key = derive_key(secret, salt, count);
        let mut plain = *token;
        CbcChain::new(key, [0u8; 16]).decrypt(&mut plain)?;

        let mut challenge = [0u8; 16];
        let mut aes_key = [0u8; 16];
        let mut hmac_key = [0u8; 32];
        challenge.copy_from_slice(&plain[..16]);
        aes_key.copy_from_slice(&plain[16..32]);
        hmac_key.copy_from_slice(&plain[32..64]);
        Ok((challenge, aes_key, hmac_key))
    }

    fn seal_token(
        &self,
        secret: &SharedSecret,
        greeting: &ServerGreeting,
    ) -> Result<[u8; 64], CryptoError> {
        let key = derive_key(secret, &greeting.salt, greeting.count);
        let mut token = [0u8; 64];
        token[..16].copy_from_slice(&greeting.challenge);
        token[16..32].copy_from_slice(&self.aes_key);
        token[32..64].copy_from_slice(&self.hmac_key);
        CbcChain::new(key, [0u8; 16]).encrypt(&mut token)?;
        Ok(token)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Keys of an authenticated or encrypted control session.
pub struct KeyedContext {
    mode: Mode,
    aes_key: [u8; 16],
    hmac: HmacKey,
    client_iv: [u8; 16],
}

/// Mode-specific protection of control messages and test packets.
pub enum SecurityContext {
    Unauthenticated,
    Keyed(KeyedContext),
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecurityContext({:?})", self.mode())
    }
}

/// Running CBC state of a control connection, one chain per direction.
///
/// Both chains are absent in unauthenticated mode; the inbound chain appears
/// once the Server-Start has revealed the server IV.
#[derive(Debug, Default)]
pub struct ControlChains {
    outbound: Option<CbcChain>,
    inbound: Option<CbcChain>,
}

impl SecurityContext {
    /// Selects the mode and prepares the Set-Up-Response for `greeting`.
    ///
    /// Keyed modes are only considered when `credentials` are present.
    ///
    /// # Errors
    /// `NoCommonMode` when nothing usable is shared, `ProtocolViolation` when
    /// the greeting's Count is outside `MIN_COUNT..=MAX_COUNT` for a keyed mode.
    pub fn negotiate(
        greeting: &ServerGreeting,
        client_modes: ModeSet,
        credentials: Option<&Credentials>,
        material: KeyMaterial,
    ) -> Result<(SecurityContext, SetupResponse), TwampError> {
        let usable = match credentials {
            Some(_) => client_modes,
            None => ModeSet(client_modes.0 & Mode::Unauthenticated.bit()),
        };
        let mode = select_mode(ModeSet(greeting.modes), usable)?;

        let credentials = match (mode.is_keyed(), credentials) {
            (true, Some(c)) => c,
            _ => {
                let response = SetupResponse {
                    mode: mode.bit(),
                    ..Default::default()
                };
                return Ok((SecurityContext::Unauthenticated, response));
            }
        };

        if !(MIN_COUNT..=MAX_COUNT).contains(&greeting.count) {
            return Err(TwampError::ProtocolViolation(format!(
                "Server-Greeting Count {} outside {}..={}",
                greeting.count, MIN_COUNT, MAX_COUNT
            )));
        }

        debug!(
            "Deriving session key for mode {} (KeyID '{}', Count {})",
            mode, credentials.key_id, greeting.count
        );
        let token = material.seal_token(&credentials.secret, greeting)?;
        let response = SetupResponse {
            mode: mode.bit(),
            key_id: credentials.key_id_field(),
            token,
            client_iv: material.client_iv,
        };
        let context = SecurityContext::Keyed(KeyedContext {
            mode,
            aes_key: material.aes_key,
            hmac: HmacKey::new(material.hmac_key.to_vec())?,
            client_iv: material.client_iv,
        });
        Ok((context, response))
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            SecurityContext::Unauthenticated => Mode::Unauthenticated,
            SecurityContext::Keyed(k) => k.mode,
        }
    }

    /// Fresh chain state for a new control connection.
    #[must_use]
    pub fn control_chains(&self) -> ControlChains {
        match self {
            SecurityContext::Unauthenticated => ControlChains::default(),
            SecurityContext::Keyed(k) => ControlChains {
                outbound: Some(CbcChain::new(k.aes_key, k.client_iv)),
                inbound: None,
            },
        }
    }

    /// Returns `body` followed by its 16-byte HMAC (zeros when unauthenticated).
    #[must_use]
    pub fn hmac_append(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + HMAC_SIZE);
        out.extend_from_slice(body);
        match self {
            SecurityContext::Unauthenticated => out.extend_from_slice(&[0u8; HMAC_SIZE]),
            SecurityContext::Keyed(k) => out.extend_from_slice(&k.hmac.compute(body)),
        }
        out
    }

    /// Checks the trailing 16-byte HMAC against the bytes before it.
    #[must_use]
    pub fn hmac_verify(&self, message: &[u8]) -> bool {
        match self {
            SecurityContext::Unauthenticated => true,
            SecurityContext::Keyed(k) => {
                if message.len() < HMAC_SIZE {
                    return false;
                }
                let (body, digest) = message.split_at(message.len() - HMAC_SIZE);
                k.hmac.verify(body, digest)
            }
        }
    }

    /// Encrypts an outbound control message in place.
    ///
    /// # Errors
    /// `Crypto` if `buf` is not block aligned.
    pub fn encrypt_control(
        &self,
        chains: &mut ControlChains,
        buf: &mut [u8],
    ) -> Result<(), TwampError> {
        if let Some(chain) = chains.outbound.as_mut() {
            chain.encrypt(buf)?;
        }
        Ok(())
    }

    /// Decrypts an inbound control message in place.
    ///
    /// # Errors
    /// `Crypto` if `buf` is not block aligned, `ProtocolViolation` if the server
    /// IV has not been seen yet in a keyed mode.
    pub fn decrypt_control(
        &self,
        chains: &mut ControlChains,
        buf: &mut [u8],
    ) -> Result<(), TwampError> {
        match (self, chains.inbound.as_mut()) {
            (SecurityContext::Unauthenticated, _) => Ok(()),
            (SecurityContext::Keyed(_), Some(chain)) => Ok(chain.decrypt(buf)?),
            (SecurityContext::Keyed(_), None) => Err(TwampError::ProtocolViolation(
                "encrypted message received before Server-Start".to_string(),
            )),
        }
    }

    /// Fills the HMAC of an encoded message and encrypts it for sending.
    ///
    /// # Errors
    /// `Crypto` on misaligned input.
    pub fn seal(&self, chains: &mut ControlChains, message: &[u8]) -> Result<Vec<u8>, TwampError> {
        let body = &message[..message.len().saturating_sub(HMAC_SIZE)];
        let mut out = self.hmac_append(body);
        self.encrypt_control(chains, &mut out)?;
        Ok(out)
    }

    /// Decrypts a received message and checks its HMAC.
    ///
    /// # Errors
    /// `AuthenticationFailed(name)` when the HMAC does not match.
    pub fn open(
        &self,
        chains: &mut ControlChains,
        name: &'static str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TwampError> {
        let mut plain = bytes.to_vec();
        self.decrypt_control(chains, &mut plain)?;
        if !self.hmac_verify(&plain) {
            return Err(TwampError::AuthenticationFailed(name));
        }
        Ok(plain)
    }

    /// Decodes the Server-Start, decrypting its last block in keyed modes.
    ///
    /// The inbound chain is started from the server IV only when the server
    /// accepted; a rejecting server may not have sent a usable IV.
    ///
    /// # Errors
    /// `Frame` for a wrong-length buffer.
    pub fn open_server_start(
        &self,
        chains: &mut ControlChains,
        bytes: &[u8],
    ) -> Result<ServerStart, TwampError> {
        let clear = ServerStart::from_bytes(bytes)?;
        let SecurityContext::Keyed(k) = self else {
            return Ok(clear);
        };
        if !clear.accept_code().is_ok() {
            return Ok(clear);
        }

        let mut inbound = CbcChain::new(k.aes_key, clear.server_iv);
        let mut plain = bytes.to_vec();
        inbound.decrypt(&mut plain[ServerStart::CLEAR_PREFIX..])?;
        chains.inbound = Some(inbound);
        Ok(ServerStart::from_bytes(&plain)?)
    }

    /// Packet cipher for the test session identified by `sid`.
    #[must_use]
    pub fn test_cipher(&self, sid: &SessionId) -> TestCipher {
        match self {
            SecurityContext::Keyed(k) if k.mode == Mode::Encrypted => TestCipher::Encrypted {
                key: crate::crypto::ecb_encrypt_block(&k.aes_key, sid),
            },
            _ => TestCipher::Clear,
        }
    }
}

/// Per-session test packet protection.
///
/// In encrypted mode the key is the SID encrypted with the AES session key, and
/// every 128-byte packet is CBC-processed on its own starting from a zero IV.
/// Otherwise packets pass through unchanged.
#[derive(Clone)]
pub enum TestCipher {
    Clear,
    Encrypted { key: [u8; 16] },
}

impl fmt::Debug for TestCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TestCipher::Clear => write!(f, "TestCipher::Clear"),
            TestCipher::Encrypted { .. } => write!(f, "TestCipher::Encrypted"),
        }
    }
}

// CBC over a test packet never sees a partial block.
const _: () = assert!(TEST_PACKET_SIZE % AES_BLOCK_SIZE == 0);

impl TestCipher {
    pub fn encrypt(&self, packet: &mut [u8; TEST_PACKET_SIZE]) {
        if let TestCipher::Encrypted { key } = self {
            let aligned = CbcChain::new(*key, [0u8; AES_BLOCK_SIZE]).encrypt(packet);
            debug_assert!(aligned.is_ok());
        }
    }

    pub fn decrypt(&self, packet: &mut [u8; TEST_PACKET_SIZE]) {
        if let TestCipher::Encrypted { key } = self {
            let aligned = CbcChain::new(*key, [0u8; AES_BLOCK_SIZE]).decrypt(packet);
            debug_assert!(aligned.is_ok());
        }
    }
}
