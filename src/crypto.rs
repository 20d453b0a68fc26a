//! Cryptographic primitives for authenticated and encrypted TWAMP modes.
//!
//! RFC 4656 Section 6 fixes the algorithms: PBKDF2 over HMAC-SHA1 turns the
//! shared secret into the Token key, control messages and test packets use
//! AES-128 in CBC mode, and HMAC-SHA1 truncated to 128 bits protects control
//! messages.

use std::{fmt, fs, path::Path};

use aes::{
    cipher::{
        block_padding::NoPadding, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit,
        KeyIvInit,
    },
    Aes128,
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block and key size.
pub const AES_BLOCK_SIZE: usize = 16;

/// Minimum key length in bytes for HMAC operations.
pub const MIN_KEY_LENGTH: usize = 16;

/// HMAC output length (truncated to 16 bytes per RFC 4656).
pub const HMAC_OUTPUT_LENGTH: usize = 16;

/// Errors that can occur while loading or using key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key is too short.
    #[error("Key length {0} is less than minimum required {MIN_KEY_LENGTH} bytes")]
    KeyTooShort(usize),

    /// The shared secret is empty.
    #[error("Shared secret must not be empty")]
    EmptySecret,

    /// Invalid hexadecimal string.
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    /// Failed to read key from file.
    #[error("Failed to read key file: {0}")]
    FileReadError(String),

    /// CBC input is not a whole number of blocks.
    #[error("Data length {0} is not a multiple of the AES block size")]
    NotBlockAligned(usize),

    /// KeyID does not fit the 80-byte field.
    #[error("KeyID of {0} bytes exceeds 80 bytes")]
    KeyIdTooLong(usize),
}

/// Shared secret (pass-phrase) associated with a KeyID.
///
/// The bytes are never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// # Errors
    /// `CryptoError::EmptySecret` for an empty secret.
    pub fn new(secret: Vec<u8>) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        Ok(Self(secret))
    }

    /// Decodes a hex-encoded secret.
    ///
    /// # Errors
    /// `InvalidHex` if the string is not valid hex, `EmptySecret` if it is empty.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let secret = hex::decode(hex_str).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::new(secret)
    }

    /// Reads a secret from a file.
    ///
    /// Content that is valid hex (after trimming) is decoded; anything else is
    /// taken as a pass-phrase with surrounding whitespace removed.
    ///
    /// # Errors
    /// `FileReadError` if the file cannot be read, `EmptySecret` for an empty file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let raw = fs::read(path).map_err(|e| CryptoError::FileReadError(e.to_string()))?;

        if let Ok(text) = std::str::from_utf8(&raw) {
            let trimmed = text.trim();
            if let Ok(secret) = Self::from_hex(trimmed) {
                return Ok(secret);
            }
            return Self::new(trimmed.as_bytes().to_vec());
        }

        Self::new(raw)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedSecret(<redacted>)")
    }
}

/// Derives the 16-byte Token key from the shared secret (RFC 4656 Section 3.1).
#[must_use]
pub fn derive_key(secret: &SharedSecret, salt: &[u8; 16], count: u32) -> [u8; AES_BLOCK_SIZE] {
    let mut key = [0u8; AES_BLOCK_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha1>(secret.as_bytes(), salt, count, &mut key);
    key
}

/// Key for HMAC-SHA1 truncated to [`HMAC_OUTPUT_LENGTH`] bytes.
#[derive(Clone)]
pub struct HmacKey(Vec<u8>);

impl HmacKey {
    /// # Errors
    /// `CryptoError::KeyTooShort` for keys under [`MIN_KEY_LENGTH`] bytes.
    pub fn new(key: Vec<u8>) -> Result<Self, CryptoError> {
        if key.len() < MIN_KEY_LENGTH {
            return Err(CryptoError::KeyTooShort(key.len()));
        }
        Ok(HmacKey(key))
    }

    fn mac(&self, data: &[u8]) -> HmacSha1 {
        let mut mac =
            <HmacSha1 as Mac>::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(data);
        mac
    }

    #[must_use]
    pub fn compute(&self, data: &[u8]) -> [u8; HMAC_OUTPUT_LENGTH] {
        let full = self.mac(data).finalize().into_bytes();
        let mut truncated = [0u8; HMAC_OUTPUT_LENGTH];
        truncated.copy_from_slice(&full[..HMAC_OUTPUT_LENGTH]);
        truncated
    }

    /// Constant-time check of a full-length truncated HMAC.
    #[must_use]
    pub fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        expected.len() == HMAC_OUTPUT_LENGTH
            && self.mac(data).verify_truncated_left(expected).is_ok()
    }
}

impl fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HmacKey(<{} bytes>)", self.0.len())
    }
}

/// One direction of an AES-128-CBC stream whose IV carries over between calls.
///
/// After each call the IV is the last ciphertext block processed, so a series
/// of messages is encrypted as if it were one long CBC stream.
#[derive(Clone)]
pub struct CbcChain {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl CbcChain {
    #[must_use]
    pub fn new(key: [u8; AES_BLOCK_SIZE], iv: [u8; AES_BLOCK_SIZE]) -> Self {
        CbcChain { key, iv }
    }

    /// IV the next call will start from.
    #[must_use]
    pub fn iv(&self) -> [u8; AES_BLOCK_SIZE] {
        self.iv
    }

    /// Encrypts `data` in place.
    ///
    /// # Errors
    /// `NotBlockAligned` unless the length is a multiple of 16.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        let len = check_aligned(data)?;
        if len == 0 {
            return Ok(());
        }
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|_| CryptoError::NotBlockAligned(len))?;
        self.iv.copy_from_slice(&data[len - AES_BLOCK_SIZE..]);
        Ok(())
    }

    /// Decrypts `data` in place.
    ///
    /// # Errors
    /// `NotBlockAligned` unless the length is a multiple of 16.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        let len = check_aligned(data)?;
        if len == 0 {
            return Ok(());
        }
        let mut next_iv = [0u8; AES_BLOCK_SIZE];
        next_iv.copy_from_slice(&data[len - AES_BLOCK_SIZE..]);
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::NotBlockAligned(len))?;
        self.iv = next_iv;
        Ok(())
    }
}

impl fmt::Debug for CbcChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CbcChain").finish_non_exhaustive()
    }
}

fn check_aligned(data: &[u8]) -> Result<usize, CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(data.len()));
    }
    Ok(data.len())
}

/// Encrypts a single block with AES-128 in ECB mode.
#[must_use]
pub fn ecb_encrypt_block(
    key: &[u8; AES_BLOCK_SIZE],
    block: &[u8; AES_BLOCK_SIZE],
) -> [u8; AES_BLOCK_SIZE] {
    let cipher = Aes128::new(key.into());
    let mut out = (*block).into();
    cipher.encrypt_block(&mut out);
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha1_rfc2202_case_2() {
        // RFC 2202 case 2 has a 4-byte key, below MIN_KEY_LENGTH
        let mut mac = <HmacSha1 as Mac>::new_from_slice(b"Jefe").unwrap();
        mac.update(b"what do ya want for nothing?");
        let full = mac.finalize().into_bytes();
        assert_eq!(
            hex::encode(full),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );

        let key = HmacKey::new(vec![0x0b; 20]).unwrap();
        assert_eq!(
            hex::encode(key.compute(b"Hi There")),
            "b617318655057264e28bc0b6fb378c8e"
        );
    }

    #[test]
    fn test_verify_wrong_key_or_data() {
        let hmac_key = HmacKey::new(vec![0xab; 32]).unwrap();
        let other = HmacKey::new(vec![0xcd; 32]).unwrap();

        let digest = hmac_key.compute(b"Request-TW-Session");
        assert!(hmac_key.verify(b"Request-TW-Session", &digest));
        assert!(!other.verify(b"Request-TW-Session", &digest));
        assert!(!hmac_key.verify(b"Request-TW-Sessioo", &digest));
        assert!(!hmac_key.verify(b"Request-TW-Session", &digest[..15]));
    }

    #[test]
    fn test_key_minimum_length() {
        assert!(matches!(
            HmacKey::new(vec![0u8; 15]),
            Err(CryptoError::KeyTooShort(15))
        ));
        assert!(HmacKey::new(vec![0u8; 16]).is_ok());
    }

    #[test]
    fn test_secret_from_hex() {
        let secret = SharedSecret::from_hex("0123456789ABCDEF").unwrap();
        assert_eq!(secret.len(), 8);
        assert!(matches!(
            SharedSecret::from_hex("not_valid_hex!"),
            Err(CryptoError::InvalidHex(_))
        ));
        assert!(matches!(
            SharedSecret::from_hex(""),
            Err(CryptoError::EmptySecret)
        ));
    }

    #[test]
    fn test_secret_from_file() {
        let dir = std::env::temp_dir();
        let hex_path = dir.join(format!("twamp-secret-hex-{}", std::process::id()));
        let text_path = dir.join(format!("twamp-secret-text-{}", std::process::id()));
        fs::write(&hex_path, "00112233\n").unwrap();
        fs::write(&text_path, "  correct horse\n").unwrap();

        assert_eq!(
            SharedSecret::from_file(&hex_path).unwrap().as_bytes(),
            &[0x00, 0x11, 0x22, 0x33]
        );
        assert_eq!(
            SharedSecret::from_file(&text_path).unwrap().as_bytes(),
            b"correct horse"
        );
        assert!(matches!(
            SharedSecret::from_file(&dir.join("twamp-no-such-secret")),
            Err(CryptoError::FileReadError(_))
        ));

        fs::remove_file(hex_path).unwrap();
        fs::remove_file(text_path).unwrap();
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SharedSecret::new(b"hunter2".to_vec()).unwrap();
        assert_eq!(format!("{:?}", secret), "SharedSecret(<redacted>)");
    }

    #[test]
    fn test_pbkdf2_rfc6070_vector() {
        let secret = SharedSecret::new(b"password".to_vec()).unwrap();
        let mut salt = [0u8; 16];
        salt[..4].copy_from_slice(b"salt");

        // RFC 6070 vector 2
        let mut out = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(b"password", b"salt", 2, &mut out);
        assert_eq!(
            hex::encode(out),
            "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"
        );

        let k1 = derive_key(&secret, &salt, 1024);
        let k2 = derive_key(&secret, &salt, 1024);
        let k3 = derive_key(&secret, &salt, 2048);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_aes_ecb_fips197_vector() {
        let key: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plain: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(ecb_encrypt_block(&key, &plain)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_cbc_chain_roundtrip_across_calls() {
        let key = [0x42; 16];
        let iv = [0x24; 16];
        let mut enc = CbcChain::new(key, iv);
        let mut dec = CbcChain::new(key, iv);

        let mut first = [1u8; 32];
        let mut second = [2u8; 48];
        enc.encrypt(&mut first).unwrap();
        enc.encrypt(&mut second).unwrap();
        assert_eq!(enc.iv(), second[32..48]);

        dec.decrypt(&mut first).unwrap();
        dec.decrypt(&mut second).unwrap();
        assert_eq!(first, [1u8; 32]);
        assert_eq!(second, [2u8; 48]);
        assert_eq!(dec.iv(), enc.iv());
    }

    #[test]
    fn test_cbc_chain_is_one_stream() {
        let key = [7u8; 16];
        let iv = [9u8; 16];

        let mut whole = [5u8; 64];
        CbcChain::new(key, iv).encrypt(&mut whole).unwrap();

        let mut chain = CbcChain::new(key, iv);
        let mut a = [5u8; 32];
        let mut b = [5u8; 32];
        chain.encrypt(&mut a).unwrap();
        chain.encrypt(&mut b).unwrap();
        assert_eq!(&whole[..32], &a);
        assert_eq!(&whole[32..], &b);
    }

    #[test]
    fn test_cbc_rejects_partial_blocks() {
        let mut chain = CbcChain::new([0; 16], [0; 16]);
        assert!(matches!(
            chain.encrypt(&mut [0u8; 17]),
            Err(CryptoError::NotBlockAligned(17))
        ));
        assert!(chain.decrypt(&mut [0u8; 15]).is_err());
        assert!(chain.encrypt(&mut []).is_ok());
    }
}
