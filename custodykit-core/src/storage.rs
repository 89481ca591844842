//! Platform storage capability.
//!
//! Stamper backends and the session store persist small key-value pairs
//! (public keys, API key pairs, sessions) through this trait. Each platform
//! supplies its own implementation: a Telegram mini-app binds its cloud
//! storage, a browser binds local storage, native hosts bind whatever secure
//! store they have. [`MemoryKeyValueStore`] backs native defaults and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CustodyKitError;

/// Persistent string key-value storage provided by the platform.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the platform store is
    /// unreachable. A missing key is `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<String>, CustodyKitError>;

    /// Stores `value` under `key`, overwriting any previous value.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the write fails.
    async fn put(&self, key: &str, value: &str) -> Result<(), CustodyKitError>;

    /// Removes the value stored under `key`. Removing a missing key is a
    /// no-op.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the removal fails.
    async fn delete(&self, key: &str) -> Result<(), CustodyKitError>;
}

/// In-memory [`KeyValueStore`].
///
/// Values do not survive the process; use a platform-backed store wherever
/// persistence matters.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CustodyKitError> {
        let values = self.values.lock().expect("kv store mutex poisoned");
        Ok(values.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CustodyKitError> {
        let mut values = self.values.lock().expect("kv store mutex poisoned");
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CustodyKitError> {
        let mut values = self.values.lock().expect("kv store mutex poisoned");
        values.remove(key);
        Ok(())
    }
}
