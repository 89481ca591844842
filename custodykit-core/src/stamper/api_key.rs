//! API-key stamping: P-256 ECDSA over the request payload.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CustodyKitError;

use super::{Stamp, Stamper};

/// Header name carrying an API-key stamp.
pub const API_KEY_STAMP_HEADER: &str = "X-Stamp";

/// Signature scheme identifier the custody API expects for P-256 API keys.
pub const API_KEY_SIGNATURE_SCHEME: &str = "SIGNATURE_SCHEME_CUSTODY_P256";

/// Serialized stamp header body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StampBody {
    public_key: String,
    signature: String,
    scheme: String,
}

/// A P-256 API key pair.
///
/// The private scalar never leaves this type except through
/// [`Self::private_key_hex`], which returns a zeroized buffer.
pub struct ApiKeyPair {
    signing_key: SigningKey,
    public_key_hex: String,
}

impl ApiKeyPair {
    /// Generates a fresh key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Reconstructs a key pair from a hex-encoded private scalar.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if the input is not a valid
    /// P-256 private key.
    pub fn from_private_key_hex(private_key_hex: &str) -> Result<Self, CustodyKitError> {
        let bytes = Zeroizing::new(hex::decode(private_key_hex).map_err(|e| {
            CustodyKitError::configuration(format!("invalid private key hex: {e}"))
        })?);
        Self::from_private_key_bytes(&bytes)
    }

    /// Reconstructs a key pair from a raw private scalar.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if the input is not a valid
    /// P-256 private key.
    pub fn from_private_key_bytes(private_key: &[u8]) -> Result<Self, CustodyKitError> {
        let signing_key = SigningKey::from_slice(private_key).map_err(|e| {
            CustodyKitError::configuration(format!("invalid P-256 private key: {e}"))
        })?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key_hex = hex::encode(
            signing_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        );
        Self {
            signing_key,
            public_key_hex,
        }
    }

    /// The compressed public key, hex-encoded. This is the identity the
    /// custody API resolves stamps against.
    #[must_use]
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// The private scalar, hex-encoded, for persistence in a platform store.
    #[must_use]
    pub fn private_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Produces the stamp header value for `payload`: ECDSA over the
    /// payload's SHA-256 digest, serialized as base64url JSON.
    #[must_use]
    pub fn stamp_value_for_payload(&self, payload: &str) -> String {
        let signature: Signature = self.signing_key.sign(payload.as_bytes());
        self.encode_body(&signature)
    }

    /// Produces the stamp header value for an already-computed SHA-256
    /// digest. Used by the relay frame, which receives the digest rather than
    /// the payload.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::MalformedPayload`] if the digest cannot be
    /// signed.
    pub fn stamp_value_for_digest(&self, digest: &[u8; 32]) -> Result<String, CustodyKitError> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| CustodyKitError::malformed(format!("digest cannot be signed: {e}")))?;
        Ok(self.encode_body(&signature))
    }

    fn encode_body(&self, signature: &Signature) -> String {
        let body = StampBody {
            public_key: self.public_key_hex.clone(),
            signature: hex::encode(signature.to_der().as_bytes()),
            scheme: API_KEY_SIGNATURE_SCHEME.to_string(),
        };
        let json = serde_json::to_string(&body).expect("stamp body serialization is infallible");
        URL_SAFE_NO_PAD.encode(json)
    }
}

impl std::fmt::Debug for ApiKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyPair")
            .field("public_key", &self.public_key_hex)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// [`Stamper`] backed by an in-memory API key pair.
#[derive(Debug)]
pub struct ApiKeyStamper {
    keys: ApiKeyPair,
}

impl ApiKeyStamper {
    /// Wraps an API key pair as a stamper.
    #[must_use]
    pub const fn new(keys: ApiKeyPair) -> Self {
        Self { keys }
    }

    /// The public identity of this stamper.
    #[must_use]
    pub fn public_key_hex(&self) -> &str {
        self.keys.public_key_hex()
    }
}

#[async_trait]
impl Stamper for ApiKeyStamper {
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        Ok(Stamp {
            header_name: API_KEY_STAMP_HEADER.to_string(),
            header_value: self.keys.stamp_value_for_payload(payload),
        })
    }
}

fn decode_body(stamp_value: &str) -> Result<(VerifyingKey, Signature), CustodyKitError> {
    let json = URL_SAFE_NO_PAD
        .decode(stamp_value)
        .map_err(|e| CustodyKitError::malformed(format!("stamp is not valid base64url: {e}")))?;
    let body: StampBody = serde_json::from_slice(&json)?;

    if body.scheme != API_KEY_SIGNATURE_SCHEME {
        return Err(CustodyKitError::malformed(format!(
            "unsupported signature scheme '{}'",
            body.scheme
        )));
    }

    let public_key = hex::decode(&body.public_key)
        .ok()
        .and_then(|bytes| VerifyingKey::from_sec1_bytes(&bytes).ok())
        .ok_or_else(|| CustodyKitError::malformed("stamp carries an invalid public key"))?;
    let signature = hex::decode(&body.signature)
        .ok()
        .and_then(|bytes| Signature::from_der(&bytes).ok())
        .ok_or_else(|| CustodyKitError::malformed("stamp carries an invalid signature"))?;

    Ok((public_key, signature))
}

/// Verifies a payload stamp against the public key embedded in it.
///
/// # Errors
/// Returns [`CustodyKitError::MalformedPayload`] if the stamp does not
/// decode, or if the signature does not verify.
pub fn verify_payload_stamp(stamp_value: &str, payload: &[u8]) -> Result<(), CustodyKitError> {
    let (public_key, signature) = decode_body(stamp_value)?;
    public_key
        .verify(payload, &signature)
        .map_err(|_| CustodyKitError::malformed("stamp signature does not verify"))
}

/// Verifies a digest stamp (as produced by a relay frame) against the public
/// key embedded in it.
///
/// # Errors
/// Returns [`CustodyKitError::MalformedPayload`] if the stamp does not
/// decode, or if the signature does not verify.
pub fn verify_digest_stamp(stamp_value: &str, digest: &[u8; 32]) -> Result<(), CustodyKitError> {
    let (public_key, signature) = decode_body(stamp_value)?;
    public_key
        .verify_prehash(digest, &signature)
        .map_err(|_| CustodyKitError::malformed("stamp signature does not verify"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[tokio::test]
    async fn test_stamp_verifies_against_declared_public_key() {
        let stamper = ApiKeyStamper::new(ApiKeyPair::generate());
        let payload = r#"{"type":"SIGN_RAW_PAYLOAD","organizationId":"org-1"}"#;

        let stamp = stamper.stamp(payload).await.unwrap();
        assert_eq!(stamp.header_name, API_KEY_STAMP_HEADER);
        verify_payload_stamp(&stamp.header_value, payload.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_stamp_does_not_verify_other_payloads() {
        let stamper = ApiKeyStamper::new(ApiKeyPair::generate());
        let stamp = stamper.stamp("payload a").await.unwrap();

        let result = verify_payload_stamp(&stamp.header_value, b"payload b");
        assert!(matches!(
            result,
            Err(CustodyKitError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_stamp_body_shape() {
        let keys = ApiKeyPair::generate();
        let value = keys.stamp_value_for_payload("hello");

        let json = URL_SAFE_NO_PAD.decode(value).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(body["publicKey"], keys.public_key_hex());
        assert_eq!(body["scheme"], API_KEY_SIGNATURE_SCHEME);
        assert!(body["signature"].as_str().is_some());
    }

    #[test]
    fn test_digest_stamp_roundtrip() {
        let keys = ApiKeyPair::generate();
        let digest: [u8; 32] = Sha256::digest(b"payload").into();

        let value = keys.stamp_value_for_digest(&digest).unwrap();
        verify_digest_stamp(&value, &digest).unwrap();

        let other: [u8; 32] = Sha256::digest(b"other").into();
        assert!(verify_digest_stamp(&value, &other).is_err());
    }

    #[test]
    fn test_private_key_hex_roundtrip() {
        let keys = ApiKeyPair::generate();
        let restored = ApiKeyPair::from_private_key_hex(&keys.private_key_hex()).unwrap();
        assert_eq!(restored.public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn test_rejects_invalid_key_material() {
        assert!(ApiKeyPair::from_private_key_hex("zz").is_err());
        assert!(ApiKeyPair::from_private_key_bytes(&[0u8; 32]).is_err());
        assert!(ApiKeyPair::from_private_key_bytes(&[1u8; 7]).is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let keys = ApiKeyPair::generate();
        let debug = format!("{keys:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(keys.private_key_hex().as_str()));
    }
}
