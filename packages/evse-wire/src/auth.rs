//! Command authentication for charge-control downlinks.
//!
//! A truncated HMAC-SHA-256 tag is appended to the plaintext payload; the
//! device verifies it before executing any charge-control command, so a
//! compromised cloud account cannot drive the contactor. Truncation to
//! 8 bytes is fixed — a longer tag would push the delay-window command past
//! the 19-byte MTU.
//!
//! Key provisioning: 32 bytes, hex-encoded in the `CMD_AUTH_KEY` environment
//! variable on the cloud side, compiled into the firmware on the device side.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const CMD_AUTH_TAG_SIZE: usize = 8;
pub const CMD_AUTH_KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthKeyError {
    #[error("key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("key must be {CMD_AUTH_KEY_SIZE} bytes, got {0}")]
    WrongLength(usize),
}

/// The 32-byte pre-shared command-auth key.
#[derive(Clone)]
pub struct CommandAuthKey([u8; CMD_AUTH_KEY_SIZE]);

impl CommandAuthKey {
    pub fn new(key: [u8; CMD_AUTH_KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Parse from the hex encoding used in the environment.
    pub fn from_hex(hex_key: &str) -> Result<Self, AuthKeyError> {
        let bytes = hex::decode(hex_key.trim())?;
        let len = bytes.len();
        let key: [u8; CMD_AUTH_KEY_SIZE] =
            bytes.try_into().map_err(|_| AuthKeyError::WrongLength(len))?;
        Ok(Self(key))
    }

    /// Compute the 8-byte tag for a payload.
    pub fn sign(&self, payload: &[u8]) -> [u8; CMD_AUTH_TAG_SIZE] {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; CMD_AUTH_TAG_SIZE];
        tag.copy_from_slice(&digest[..CMD_AUTH_TAG_SIZE]);
        tag
    }

    /// Append the tag to a payload.
    pub fn append_tag(&self, mut payload: Vec<u8>) -> Vec<u8> {
        let tag = self.sign(&payload);
        payload.extend_from_slice(&tag);
        payload
    }

    /// Verify a tagged payload (used by the simulator and tests; the real
    /// verifier lives in firmware).
    pub fn verify(&self, tagged: &[u8]) -> bool {
        if tagged.len() <= CMD_AUTH_TAG_SIZE {
            return false;
        }
        let (payload, tag) = tagged.split_at(tagged.len() - CMD_AUTH_TAG_SIZE);
        self.sign(payload) == *tag
    }
}

impl std::fmt::Debug for CommandAuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "CommandAuthKey(..)")
    }
}
