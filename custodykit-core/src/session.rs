//! Authenticated sessions.
//!
//! A session is created after a successful authentication against the
//! custody API, mutated only by refreshes that extend its expiry, and
//! destroyed by an explicit logout or by its scheduled expiry firing.
//! [`SessionStore`] owns the persisted records and the expiry timers; there
//! is exactly one store per embedding, torn down with it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::CustodyKitError;
use crate::scheduler::{schedule_at, Clock, ExpiryMap};
use crate::storage::KeyValueStore;

/// Storage key prefix for persisted sessions.
const SESSION_KEY_PREFIX: &str = "custodykit_session";

/// Expiry inputs below this are epoch seconds; at or above, epoch
/// milliseconds. (Epoch seconds will not reach 10^12 for another 29,000
/// years; epoch milliseconds passed 10^12 in 2001.)
const MS_THRESHOLD: u64 = 1_000_000_000_000;

/// An authenticated session with the custody API.
#[derive(Clone)]
pub struct Session {
    /// Organization the session is scoped to.
    pub organization_id: String,
    /// Authenticated user.
    pub user_id: String,
    /// Expiry, milliseconds since the Unix epoch.
    pub expiry_ms: u64,
    token: Zeroizing<String>,
}

impl Session {
    /// Creates a session. `expiry` may be epoch seconds or milliseconds;
    /// it is normalized to milliseconds.
    pub fn new<O: Into<String>, U: Into<String>, T: Into<String>>(
        organization_id: O,
        user_id: U,
        expiry: u64,
        token: T,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            expiry_ms: normalize_expiry(expiry),
            token: Zeroizing::new(token.into()),
        }
    }

    /// The bearer token (or credential bundle) backing this session.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the session has expired as of `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry_ms
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("organization_id", &self.organization_id)
            .field("user_id", &self.user_id)
            .field("expiry_ms", &self.expiry_ms)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Normalizes an epoch-seconds-or-milliseconds expiry to milliseconds.
const fn normalize_expiry(expiry: u64) -> u64 {
    if expiry < MS_THRESHOLD {
        expiry.saturating_mul(1000)
    } else {
        expiry
    }
}

/// Persisted session record.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    organization_id: String,
    user_id: String,
    expiry_ms: u64,
    token: String,
}

impl From<&Session> for PersistedSession {
    fn from(session: &Session) -> Self {
        Self {
            organization_id: session.organization_id.clone(),
            user_id: session.user_id.clone(),
            expiry_ms: session.expiry_ms,
            token: session.token().to_string(),
        }
    }
}

impl From<PersistedSession> for Session {
    fn from(record: PersistedSession) -> Self {
        Self {
            organization_id: record.organization_id,
            user_id: record.user_id,
            expiry_ms: record.expiry_ms,
            token: Zeroizing::new(record.token),
        }
    }
}

/// Owns active sessions, their persistence, and their expiry timers.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Session>>,
    expiries: ExpiryMap,
}

impl SessionStore {
    /// Creates a store over the platform key-value store and clock.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            sessions: Mutex::new(HashMap::new()),
            expiries: ExpiryMap::new(),
        })
    }

    /// Registers a freshly authenticated session: persists it and schedules
    /// its expiry. Replaces (and re-times) any session with the same scope.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if persistence fails; nothing is
    /// scheduled in that case.
    pub async fn create(self: &Arc<Self>, session: Session) -> Result<(), CustodyKitError> {
        let key = session_key(&session.organization_id, &session.user_id);
        let record = serde_json::to_string(&PersistedSession::from(&session))?;
        self.store.put(&key, &record).await?;

        info!(
            organization_id = %session.organization_id,
            user_id = %session.user_id,
            expiry_ms = session.expiry_ms,
            "session created"
        );
        let expiry_ms = session.expiry_ms;
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .insert(key.clone(), session);
        // Insert before scheduling: a past-dated expiry fires as soon as the
        // runtime polls it, and must find the session to evict.
        self.schedule_expiry(&key, expiry_ms);
        Ok(())
    }

    /// Extends a session's expiry, re-persisting and re-timing it. The only
    /// mutation a session undergoes after creation.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::NotInitialized`] if no such session
    /// exists, or [`CustodyKitError::Storage`] if persistence fails.
    pub async fn refresh(
        self: &Arc<Self>,
        organization_id: &str,
        user_id: &str,
        new_expiry: u64,
    ) -> Result<(), CustodyKitError> {
        let key = session_key(organization_id, user_id);
        let mut session = self
            .get(organization_id, user_id)
            .ok_or_else(|| CustodyKitError::not_initialized("no session for this scope"))?;
        session.expiry_ms = normalize_expiry(new_expiry);

        let record = serde_json::to_string(&PersistedSession::from(&session))?;
        self.store.put(&key, &record).await?;

        debug!(%key, expiry_ms = session.expiry_ms, "session refreshed");
        let expiry_ms = session.expiry_ms;
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .insert(key.clone(), session);
        self.schedule_expiry(&key, expiry_ms);
        Ok(())
    }

    /// Restores a persisted session into memory (e.g. after a restart),
    /// rescheduling its expiry. Records that expired while the process was
    /// down are discarded.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the platform store fails, or
    /// [`CustodyKitError::Serialization`] if the record is corrupt.
    pub async fn resume(
        self: &Arc<Self>,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<Session>, CustodyKitError> {
        let key = session_key(organization_id, user_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record: PersistedSession = serde_json::from_str(&raw)?;
        let session = Session::from(record);

        if session.is_expired(self.clock.now_ms()) {
            debug!(%key, "discarding expired persisted session");
            self.store.delete(&key).await?;
            return Ok(None);
        }

        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .insert(key.clone(), session.clone());
        self.schedule_expiry(&key, session.expiry_ms);
        Ok(Some(session))
    }

    /// Destroys a session: cancels its expiry and removes it from memory and
    /// persistence.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Storage`] if the persisted record cannot
    /// be removed (the in-memory session is gone regardless).
    pub async fn logout(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<(), CustodyKitError> {
        let key = session_key(organization_id, user_id);
        self.expiries.clear(&key);
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .remove(&key);
        self.store.delete(&key).await?;
        info!(%key, "session destroyed");
        Ok(())
    }

    /// The active session for this scope, if any.
    #[must_use]
    pub fn get(&self, organization_id: &str, user_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .get(&session_key(organization_id, user_id))
            .cloned()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .len()
    }

    /// Whether no sessions are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels all expiry timers. Call on teardown.
    pub fn shutdown(&self) {
        self.expiries.clear_all();
    }

    fn schedule_expiry(self: &Arc<Self>, key: &str, expiry_ms: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let expired_key = key.to_string();
        let handle = schedule_at(Arc::clone(&self.clock), expiry_ms, move || {
            if let Some(store) = weak.upgrade() {
                store.evict(&expired_key);
            }
        });
        self.expiries.put(key, handle);
    }

    /// Removes an expired session. The persisted record is deleted from a
    /// spawned task; the expiry callback itself is synchronous.
    fn evict(self: &Arc<Self>, key: &str) {
        info!(%key, "session expired");
        self.sessions
            .lock()
            .expect("session store mutex poisoned")
            .remove(key);
        self.expiries.clear(key);

        let store = Arc::clone(&self.store);
        let key = key.to_string();
        tokio::spawn(async move {
            let _ = store.delete(&key).await;
        });
    }
}

fn session_key(organization_id: &str, user_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}:{organization_id}:{user_id}")
}
