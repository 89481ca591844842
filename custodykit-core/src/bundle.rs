//! Credential bundle transport encryption.
//!
//! A credential bundle carries private key material (a raw private key, a
//! seed mnemonic, or an API key) to a single recipient, identified by an
//! ephemeral P-256 public key. The envelope is hybrid: an ephemeral ECDH
//! agreement keyed through HKDF-SHA256 into XChaCha20-Poly1305, with the
//! recipient's public key bound into the associated data so a bundle cannot
//! be re-targeted.
//!
//! Wire format (base64url, no padding):
//!
//! ```text
//! version: u8 (currently 1)
//! ephemeral_public_key: [u8; 33] (compressed SEC1 point)
//! nonce: [u8; 24]
//! ciphertext: [u8] (includes the 16-byte auth tag)
//! ```
//!
//! [`open`] is a pure function of the bundle and the recipient private key.
//! It never logs or persists the plaintext; callers get it back zeroized on
//! drop.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ecdh::EphemeralSecret, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CustodyKitError;

/// Current bundle envelope version.
pub const BUNDLE_VERSION: u8 = 1;

/// Domain separation label for the HKDF expand step.
const KDF_INFO: &[u8] = b"custodykit:credential-bundle:v1";

const POINT_SIZE: usize = 33;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// An encrypted credential bundle, addressed to a single recipient public
/// key. Opaque: the only operations are transport and [`open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle(String);

impl CredentialBundle {
    /// Wraps an encoded bundle received from the server or a peer.
    #[must_use]
    pub const fn new(encoded: String) -> Self {
        Self(encoded)
    }

    /// The encoded bundle, as carried in API responses and relay messages.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CredentialBundle {
    fn from(encoded: String) -> Self {
        Self(encoded)
    }
}

impl std::fmt::Display for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses a hex-encoded compressed P-256 public key, as announced by a relay
/// frame or a local stamper, into a bundle recipient.
///
/// # Errors
/// Returns [`CustodyKitError::Configuration`] if the input is not a valid
/// compressed point.
pub fn recipient_from_hex(public_key_hex: &str) -> Result<PublicKey, CustodyKitError> {
    let bytes = hex::decode(public_key_hex).map_err(|e| {
        CustodyKitError::configuration(format!("invalid recipient public key hex: {e}"))
    })?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|e| {
        CustodyKitError::configuration(format!("invalid recipient public key: {e}"))
    })
}

/// Encrypts `plaintext` to `recipient`.
///
/// # Errors
/// Returns [`CustodyKitError::Encryption`] if the AEAD fails.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<CredentialBundle, CustodyKitError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);
    let recipient_point = recipient.to_encoded_point(true);

    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(
        shared.raw_secret_bytes(),
        ephemeral_point.as_bytes(),
        recipient_point.as_bytes(),
    )?;

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice()).expect("key length is always 32");
    let nonce_bytes = generate_nonce()?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: plaintext,
                aad: recipient_point.as_bytes(),
            },
        )
        .map_err(|_| CustodyKitError::encryption("XChaCha20-Poly1305 encryption failed"))?;

    let mut envelope = Vec::with_capacity(1 + POINT_SIZE + NONCE_SIZE + ciphertext.len());
    envelope.push(BUNDLE_VERSION);
    envelope.extend_from_slice(ephemeral_point.as_bytes());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);

    Ok(CredentialBundle(URL_SAFE_NO_PAD.encode(envelope)))
}

/// Decrypts `bundle` with the recipient's private key.
///
/// # Errors
/// Returns [`CustodyKitError::Decryption`] for any malformed envelope, wrong
/// key, or tampered ciphertext. Failure modes are not distinguished beyond
/// the context string; a bundle either opens or it does not.
pub fn open(
    bundle: &CredentialBundle,
    recipient: &SecretKey,
) -> Result<Zeroizing<Vec<u8>>, CustodyKitError> {
    let envelope = URL_SAFE_NO_PAD
        .decode(bundle.as_str())
        .map_err(|_| CustodyKitError::decryption("bundle is not valid base64url"))?;

    if envelope.len() < 1 + POINT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CustodyKitError::decryption("bundle envelope too short"));
    }
    if envelope[0] != BUNDLE_VERSION {
        return Err(CustodyKitError::decryption(format!(
            "unsupported bundle version {}",
            envelope[0]
        )));
    }

    let ephemeral_bytes = &envelope[1..=POINT_SIZE];
    let nonce_bytes = &envelope[1 + POINT_SIZE..1 + POINT_SIZE + NONCE_SIZE];
    let ciphertext = &envelope[1 + POINT_SIZE + NONCE_SIZE..];

    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| CustodyKitError::decryption("bundle carries an invalid ephemeral key"))?;
    let recipient_point = recipient.public_key().to_encoded_point(true);

    let shared = p256::ecdh::diffie_hellman(recipient.to_nonzero_scalar(), ephemeral.as_affine());
    let key = derive_key(
        shared.raw_secret_bytes(),
        ephemeral_bytes,
        recipient_point.as_bytes(),
    )?;

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice()).expect("key length is always 32");
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad: recipient_point.as_bytes(),
            },
        )
        .map_err(|_| CustodyKitError::decryption("XChaCha20-Poly1305 decryption failed"))?;

    Ok(Zeroizing::new(plaintext))
}

/// Derives the AEAD key: HKDF-SHA256 with the two public points as salt and
/// the raw shared secret as input keying material.
fn derive_key(
    shared_secret: &[u8],
    ephemeral_point: &[u8],
    recipient_point: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CustodyKitError> {
    let mut salt = Vec::with_capacity(ephemeral_point.len() + recipient_point.len());
    salt.extend_from_slice(ephemeral_point);
    salt.extend_from_slice(recipient_point);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(KDF_INFO, &mut *key)
        .map_err(|_| CustodyKitError::encryption("HKDF expand failed"))?;
    Ok(key)
}

fn generate_nonce() -> Result<[u8; NONCE_SIZE], CustodyKitError> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| CustodyKitError::encryption(format!("getrandom failed: {e}")))?;
    Ok(nonce)
}
