//! Byte/string conversions, secure randomness and constant-time comparison.
//!
//! Random bytes come exclusively from `ring::rand::SystemRandom`, the same
//! source the cipher uses for nonces.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;

use crate::error::{E2eeError, Result};

/// Encode bytes as standard, padded base64.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64.
pub fn from_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|_| E2eeError::Encoding("invalid base64"))
}

/// Encode bytes as unpadded base64url, the form WebAuthn uses for
/// credential identifiers.
pub fn to_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url. Both padded and unpadded input are accepted.
pub fn from_base64url(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    let engine = if text.ends_with('=') { &URL_SAFE } else { &URL_SAFE_NO_PAD };
    engine
        .decode(text)
        .map_err(|_| E2eeError::Encoding("invalid base64url"))
}

/// Decode UTF-8 bytes into an owned string.
pub fn bytes_to_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| E2eeError::Encoding("invalid utf-8"))
}

/// Fill a fixed-size array from the system CSPRNG.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| E2eeError::EncryptionFailed)?;
    Ok(buf)
}

/// Return `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| E2eeError::EncryptionFailed)?;
    Ok(buf)
}

/// Compare two byte strings without early exit on the first difference.
///
/// Slices of different length compare unequal; only the length is leaked.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Serde adapters for byte fields stored as text.
pub(crate) mod serde_b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        super::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod serde_b64url {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::to_base64url(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        super::from_base64url(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64url_accepts_padded_and_unpadded() {
        let bytes = [0xfbu8, 0xff, 0x01, 0x02];
        let unpadded = to_base64url(&bytes);
        assert!(!unpadded.contains('='));
        assert_eq!(from_base64url(&unpadded).unwrap(), bytes);
        assert_eq!(from_base64url("-_8BAg==").unwrap(), bytes);
    }

    #[test]
    fn test_invalid_base64_is_encoding_error() {
        assert!(matches!(from_base64("not base64!"), Err(E2eeError::Encoding(_))));
    }

    #[test]
    fn test_random_bytes_differ() {
        let a = random_bytes(32).unwrap();
        let b = random_bytes(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
    }
}
