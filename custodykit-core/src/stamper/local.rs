//! Local-persistent stamping: a device key pair plus an injected credential.
//!
//! The device key pair is the recipient address for credential bundles. Its
//! public half is persisted so the custody API (or another device) can seal
//! an API key to it; the private half stays in the platform store's protected
//! scope. The stamper only becomes able to stamp once a bundle has been
//! injected and decrypted.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::bundle::{self, CredentialBundle};
use crate::error::CustodyKitError;
use crate::storage::KeyValueStore;

use super::{ApiKeyPair, Stamp, Stamper, API_KEY_STAMP_HEADER};

/// Storage key for the device private key.
pub const DEVICE_KEY_STORAGE_KEY: &str = "custodykit_device_key";
/// Storage key for the device public key.
pub const DEVICE_PUBLIC_KEY_STORAGE_KEY: &str = "custodykit_device_key_public";

/// [`Stamper`] backed by a device-local key pair and an injected credential.
///
/// Call order: [`Self::init`] resolves the device key pair, the returned
/// public key is used to request a credential bundle, and
/// [`Self::inject_credential_bundle`] decrypts it. [`Stamper::stamp`] calls
/// made before injection fail with [`CustodyKitError::NotInitialized`].
pub struct LocalStamper {
    store: Arc<dyn KeyValueStore>,
    device_key: Mutex<Option<SecretKey>>,
    api_key: Mutex<Option<ApiKeyPair>>,
}

impl LocalStamper {
    /// Creates a stamper over the platform store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            device_key: Mutex::new(None),
            api_key: Mutex::new(None),
        }
    }

    /// Generates (or reuses) the device key pair and persists it. Returns the
    /// hex-encoded public key, the address credential bundles must be sealed
    /// to.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the platform store fails, or
    /// [`CustodyKitError::Configuration`] if the persisted key is corrupt.
    pub async fn init(&self) -> Result<String, CustodyKitError> {
        let device_key = match self.store.get(DEVICE_KEY_STORAGE_KEY).await? {
            Some(private_hex) => {
                let bytes = Zeroizing::new(hex::decode(&private_hex).map_err(|e| {
                    CustodyKitError::configuration(format!("persisted device key is corrupt: {e}"))
                })?);
                SecretKey::from_slice(&bytes).map_err(|e| {
                    CustodyKitError::configuration(format!("persisted device key is invalid: {e}"))
                })?
            }
            None => {
                let key = SecretKey::random(&mut OsRng);
                let private_hex = Zeroizing::new(hex::encode(key.to_bytes()));
                self.store
                    .put(DEVICE_KEY_STORAGE_KEY, &private_hex)
                    .await?;
                key
            }
        };

        let public_hex = hex::encode(device_key.public_key().to_encoded_point(true).as_bytes());
        self.store
            .put(DEVICE_PUBLIC_KEY_STORAGE_KEY, &public_hex)
            .await?;

        *self.device_key.lock().expect("local stamper mutex poisoned") = Some(device_key);
        Ok(public_hex)
    }

    /// The device public key, once [`Self::init`] has completed.
    #[must_use]
    pub fn public_key_hex(&self) -> Option<String> {
        self.device_key
            .lock()
            .expect("local stamper mutex poisoned")
            .as_ref()
            .map(|key| hex::encode(key.public_key().to_encoded_point(true).as_bytes()))
    }

    /// Decrypts a credential bundle sealed to the device key and activates
    /// the API key it carries. Replaces any previously injected key.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::NotInitialized`] before [`Self::init`],
    /// or [`CustodyKitError::Decryption`] if the bundle does not open or does
    /// not contain a valid P-256 private key.
    pub fn inject_credential_bundle(
        &self,
        credential_bundle: &CredentialBundle,
    ) -> Result<(), CustodyKitError> {
        let device_key = {
            let guard = self.device_key.lock().expect("local stamper mutex poisoned");
            guard
                .as_ref()
                .ok_or_else(|| {
                    CustodyKitError::not_initialized("local stamper: init() has not run")
                })?
                .clone()
        };

        let plaintext = bundle::open(credential_bundle, &device_key)?;
        let keys = ApiKeyPair::from_private_key_bytes(&plaintext).map_err(|_| {
            CustodyKitError::decryption("bundle did not contain a valid P-256 private key")
        })?;

        *self.api_key.lock().expect("local stamper mutex poisoned") = Some(keys);
        Ok(())
    }
}

#[async_trait]
impl Stamper for LocalStamper {
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        let keys = self.api_key.lock().expect("local stamper mutex poisoned");
        let keys = keys.as_ref().ok_or_else(|| {
            CustodyKitError::not_initialized("local stamper: no credential bundle injected")
        })?;
        Ok(Stamp {
            header_name: API_KEY_STAMP_HEADER.to_string(),
            header_value: keys.stamp_value_for_payload(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{recipient_from_hex, seal};
    use crate::stamper::verify_payload_stamp;
    use crate::storage::MemoryKeyValueStore;

    #[tokio::test]
    async fn test_stamp_requires_injection() {
        let stamper = LocalStamper::new(Arc::new(MemoryKeyValueStore::new()));
        stamper.init().await.unwrap();
        assert!(matches!(
            stamper.stamp("payload").await,
            Err(CustodyKitError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_inject_requires_init() {
        let stamper = LocalStamper::new(Arc::new(MemoryKeyValueStore::new()));
        let bundle = CredentialBundle::new("irrelevant".to_string());
        assert!(matches!(
            stamper.inject_credential_bundle(&bundle),
            Err(CustodyKitError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_inject_then_stamp() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let stamper = LocalStamper::new(store.clone());
        let device_public = stamper.init().await.unwrap();

        // Public half is persisted for the server to seal bundles to.
        assert_eq!(
            store.get(DEVICE_PUBLIC_KEY_STORAGE_KEY).await.unwrap(),
            Some(device_public.clone())
        );

        let api_key = ApiKeyPair::generate();
        let recipient = recipient_from_hex(&device_public).unwrap();
        let raw = hex::decode(api_key.private_key_hex().as_str()).unwrap();
        let bundle = seal(&raw, &recipient).unwrap();

        stamper.inject_credential_bundle(&bundle).unwrap();
        let stamp = stamper.stamp("payload").await.unwrap();
        verify_payload_stamp(&stamp.header_value, b"payload").unwrap();
    }

    #[tokio::test]
    async fn test_inject_wrong_recipient_fails() {
        let stamper = LocalStamper::new(Arc::new(MemoryKeyValueStore::new()));
        stamper.init().await.unwrap();

        let other = SecretKey::random(&mut OsRng);
        let api_key = ApiKeyPair::generate();
        let raw = hex::decode(api_key.private_key_hex().as_str()).unwrap();
        let bundle = seal(&raw, &other.public_key()).unwrap();

        assert!(matches!(
            stamper.inject_credential_bundle(&bundle),
            Err(CustodyKitError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_device_key_is_reused_across_instances() {
        let store = Arc::new(MemoryKeyValueStore::new());

        let first = LocalStamper::new(store.clone());
        let public_a = first.init().await.unwrap();

        let second = LocalStamper::new(store);
        let public_b = second.init().await.unwrap();
        assert_eq!(public_a, public_b);
    }
}
