//! Encrypting feature data under a derived key.
//!
//! Every value a feature persists leaves here as an [`EncryptedPayload`]:
//! a fresh 12-byte IV, the AES-256-GCM output with its tag, and a format
//! version. Features store its JSON text form and hand it back unchanged.
//! Strings, serde objects and per-field batches all funnel into the same
//! `seal`/`open` pair; batches run their fields concurrently and fail as a
//! whole.
//!
//! Callers never supply an IV. Each seal draws its own from the system
//! CSPRNG, so two payloads never share one under a key.

use futures::future::try_join_all;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::error::Unspecified;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::{self, serde_b64};
use crate::error::{DecryptFailure, E2eeError, Result};
use crate::keys::DerivedKey;

const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// GCM IV length.
pub const NONCE_LEN: usize = 12;

/// Master and unit keys are both AES-256 keys.
pub const KEY_LEN: usize = 32;

/// Format version written into every payload.
pub const PAYLOAD_VERSION: u32 = 1;

/// An encrypted value as persisted in the backing data store.
///
/// Self-describing: it carries its own IV and format version. The text form
/// produced by [`EncryptedPayload::to_text`] is what features store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "serde_b64")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_b64")]
    pub ciphertext: Vec<u8>,
    pub version: u32,
}

impl EncryptedPayload {
    /// Serialize to the opaque text form stored by features.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| E2eeError::EncryptionFailed)
    }

    /// Parse the text form produced by [`to_text`](Self::to_text).
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|_| E2eeError::Encoding("invalid payload text"))
    }
}

// ---------------------------------------------------------------------------
// Raw AEAD
// ---------------------------------------------------------------------------

fn aead_key(key: &DerivedKey) -> std::result::Result<LessSafeKey, Unspecified> {
    let unbound = UnboundKey::new(ALGORITHM, key.as_bytes())?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under a freshly generated nonce.
///
/// Returns the nonce and `ciphertext || tag`.
pub(crate) fn seal(
    key: &DerivedKey,
    aad: &[u8],
    plaintext: &[u8],
) -> std::result::Result<([u8; NONCE_LEN], Vec<u8>), Unspecified> {
    let key = aead_key(key)?;
    let iv = encoding::random_array::<NONCE_LEN>().map_err(|_| Unspecified)?;

    let mut in_out = Vec::with_capacity(plaintext.len() + ALGORITHM.tag_len());
    in_out.extend_from_slice(plaintext);

    // `seal_in_place_append_tag` encrypts in place and appends the GCM tag.
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::from(aad), &mut in_out)?;
    Ok((iv, in_out))
}

/// Open `ciphertext || tag` with the given nonce.
///
/// If the key is wrong or anything was tampered with, the GCM check fails
/// and no partial plaintext is returned.
pub(crate) fn open(
    key: &DerivedKey,
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, Unspecified> {
    let nonce = Nonce::try_assume_unique_for_key(iv)?;
    let key = aead_key(key)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key.open_in_place(nonce, Aad::from(aad), &mut in_out)?;
    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Strings and objects
// ---------------------------------------------------------------------------

/// Encrypt a string with AES-256-GCM under a fresh random nonce.
pub async fn encrypt(plaintext: &str, key: &DerivedKey) -> Result<EncryptedPayload> {
    let (iv, ciphertext) =
        seal(key, &[], plaintext.as_bytes()).map_err(|_| E2eeError::EncryptionFailed)?;
    Ok(EncryptedPayload {
        iv: iv.to_vec(),
        ciphertext,
        version: PAYLOAD_VERSION,
    })
}

/// Decrypt a payload produced by [`encrypt`].
///
/// A wrong key, tampered data, an unknown version or a malformed IV all
/// produce the same `DecryptionFailed(Authentication)`.
pub async fn decrypt(payload: &EncryptedPayload, key: &DerivedKey) -> Result<String> {
    let bytes = open_payload(payload, key)?;
    String::from_utf8(bytes).map_err(|_| E2eeError::DecryptionFailed(DecryptFailure::InvalidData))
}

fn open_payload(payload: &EncryptedPayload, key: &DerivedKey) -> Result<Vec<u8>> {
    let rejected = E2eeError::DecryptionFailed(DecryptFailure::Authentication);
    if payload.version != PAYLOAD_VERSION || payload.iv.len() != NONCE_LEN {
        return Err(rejected);
    }
    open(key, &[], &payload.iv, &payload.ciphertext).map_err(|_| rejected)
}

/// Serialize `value` to JSON and encrypt it.
pub async fn encrypt_object<T: Serialize + ?Sized>(
    value: &T,
    key: &DerivedKey,
) -> Result<EncryptedPayload> {
    let json = serde_json::to_string(value).map_err(|_| E2eeError::EncryptionFailed)?;
    encrypt(&json, key).await
}

/// Decrypt a payload and deserialize it as `T`.
///
/// Fails with `DecryptionFailed(InvalidData)` when the payload authenticates
/// but does not hold valid JSON for `T`.
pub async fn decrypt_object<T: DeserializeOwned>(
    payload: &EncryptedPayload,
    key: &DerivedKey,
) -> Result<T> {
    let bytes = open_payload(payload, key)?;
    serde_json::from_slice(&bytes)
        .map_err(|_| E2eeError::DecryptionFailed(DecryptFailure::InvalidData))
}

// ---------------------------------------------------------------------------
// Field-level batch
// ---------------------------------------------------------------------------

/// Encrypt the named string/object fields of a record.
///
/// Each selected field is replaced by the text form of its payload. The
/// field's JSON value is encrypted, so strings and objects come back with
/// their original type. Fields that are absent, not listed, or hold other
/// JSON types (numbers, booleans, arrays, null) are left untouched. The
/// selected fields are encrypted concurrently.
pub async fn encrypt_fields(
    record: &Map<String, Value>,
    fields: &[&str],
    key: &DerivedKey,
) -> Result<Map<String, Value>> {
    let jobs = fields.iter().filter_map(|&name| match record.get(name) {
        Some(value @ (Value::String(_) | Value::Object(_))) => Some(async move {
            let text = encrypt_object(value, key).await?.to_text()?;
            Ok::<_, E2eeError>((name, Value::String(text)))
        }),
        _ => None,
    });

    let sealed = try_join_all(jobs).await?;
    let mut out = record.clone();
    for (name, value) in sealed {
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

/// Reverse [`encrypt_fields`] for the same field list.
///
/// Listed fields that are not strings are left untouched. A listed string
/// that is not a payload fails with an encoding error.
pub async fn decrypt_fields(
    record: &Map<String, Value>,
    fields: &[&str],
    key: &DerivedKey,
) -> Result<Map<String, Value>> {
    let jobs = fields.iter().filter_map(|&name| match record.get(name) {
        Some(Value::String(text)) => Some(async move {
            let payload = EncryptedPayload::from_text(text)?;
            let value: Value = decrypt_object(&payload, key).await?;
            Ok::<_, E2eeError>((name, value))
        }),
        _ => None,
    });

    let opened = try_join_all(jobs).await?;
    let mut out = record.clone();
    for (name, value) in opened {
        out.insert(name.to_string(), value);
    }
    Ok(out)
}
