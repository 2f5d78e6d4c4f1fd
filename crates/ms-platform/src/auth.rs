//! Private-key authentication
//!
//! The platform's challenge login expects an Ethereum `personal_sign`
//! signature from the address derived from the key.

use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};

use crate::{PlatformError, Result};

pub struct EthereumSigner {
    key: SigningKey,
    address: String,
}

impl EthereumSigner {
    /// Parse a 32-byte hex private key, with or without `0x` prefix.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let hex_key = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(hex_key).map_err(|e| PlatformError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(PlatformError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key = SigningKey::from_slice(&bytes).map_err(|e| PlatformError::InvalidKey(e.to_string()))?;
        let address = address_of(&key);

        Ok(Self { key, address })
    }

    /// Lowercase `0x`-prefixed address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign `message` the way `eth_sign`/`personal_sign` does and return the
    /// 65-byte `r || s || v` signature as `0x` hex.
    pub fn personal_sign(&self, message: &str) -> Result<String> {
        let digest = personal_message_hash(message.as_bytes());
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| PlatformError::Auth(format!("signing failed: {}", e)))?;

        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.push(recovery_id.to_byte() + 27);

        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

pub(crate) fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    keccak256(&prefixed)
}

fn address_of(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    // Drop the 0x04 SEC1 tag before hashing
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}
