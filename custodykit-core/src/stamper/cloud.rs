//! Cloud-storage-backed API-key stamping.
//!
//! Used by mini-app embeddings (e.g. Telegram) where the only durable state
//! is a platform key-value store scoped to the running app. The stamper
//! lazily resolves an API key pair from that store, generating and persisting
//! a fresh one on first use; stamping itself is plain API-key stamping.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroize;

use crate::error::CustodyKitError;
use crate::storage::KeyValueStore;

use super::{ApiKeyPair, Stamp, Stamper, API_KEY_STAMP_HEADER};

/// Default storage key the API key pair is persisted under.
pub const DEFAULT_CLOUD_STORAGE_KEY: &str = "custodykit_api_key";

/// Persisted key pair record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    public_key: String,
    private_key: String,
}

/// [`Stamper`] whose API key pair lives in a platform key-value store.
///
/// [`Self::init`] must complete before the first [`Stamper::stamp`] call;
/// earlier calls fail with [`CustodyKitError::NotInitialized`].
pub struct CloudStamper {
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
    keys: Mutex<Option<ApiKeyPair>>,
}

impl CloudStamper {
    /// Creates a stamper over `store` using the default storage key.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_storage_key(store, DEFAULT_CLOUD_STORAGE_KEY)
    }

    /// Creates a stamper persisting its key pair under a custom storage key.
    #[must_use]
    pub fn with_storage_key<S: Into<String>>(store: Arc<dyn KeyValueStore>, key: S) -> Self {
        Self {
            store,
            storage_key: key.into(),
            keys: Mutex::new(None),
        }
    }

    /// Resolves the API key pair: reuses the persisted one when present,
    /// otherwise generates and persists a fresh pair. Returns the public key.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the platform store fails, or
    /// [`CustodyKitError::Configuration`]/[`CustodyKitError::Serialization`]
    /// if the persisted record is corrupt.
    pub async fn init(&self) -> Result<String, CustodyKitError> {
        let keys = match self.store.get(&self.storage_key).await? {
            Some(raw) => {
                let mut stored: StoredKeyPair = serde_json::from_str(&raw)?;
                let keys = ApiKeyPair::from_private_key_hex(&stored.private_key);
                stored.private_key.zeroize();
                let keys = keys?;
                if stored.public_key != keys.public_key_hex() {
                    return Err(CustodyKitError::storage(
                        "persisted key pair is inconsistent",
                    ));
                }
                keys
            }
            None => {
                let keys = ApiKeyPair::generate();
                let record = serde_json::to_string(&StoredKeyPair {
                    public_key: keys.public_key_hex().to_string(),
                    private_key: keys.private_key_hex().to_string(),
                })?;
                self.store.put(&self.storage_key, &record).await?;
                info!(public_key = keys.public_key_hex(), "generated cloud api key");
                keys
            }
        };

        let public_key = keys.public_key_hex().to_string();
        *self.keys.lock().expect("cloud stamper mutex poisoned") = Some(keys);
        Ok(public_key)
    }

    /// The resolved public key, once [`Self::init`] has completed.
    #[must_use]
    pub fn public_key_hex(&self) -> Option<String> {
        self.keys
            .lock()
            .expect("cloud stamper mutex poisoned")
            .as_ref()
            .map(|keys| keys.public_key_hex().to_string())
    }
}

#[async_trait]
impl Stamper for CloudStamper {
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        let keys = self.keys.lock().expect("cloud stamper mutex poisoned");
        let keys = keys
            .as_ref()
            .ok_or_else(|| CustodyKitError::not_initialized("cloud stamper: init() has not run"))?;
        Ok(Stamp {
            header_name: API_KEY_STAMP_HEADER.to_string(),
            header_value: keys.stamp_value_for_payload(payload),
        })
    }
}
