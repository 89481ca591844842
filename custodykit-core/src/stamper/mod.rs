//! Request authentication ("stamping").
//!
//! Every request to the custody API carries one additional header produced by
//! a [`Stamper`]. Backends differ in where the signing identity lives (an
//! in-memory API key, a platform authenticator, cloud storage, or a device
//! key waiting for an injected credential bundle), but all of them sit behind
//! the single [`Stamper::stamp`] method so callers never branch on backend
//! type.

use async_trait::async_trait;

use crate::error::CustodyKitError;

mod api_key;
pub use api_key::*;

mod passkey;
pub use passkey::*;

mod cloud;
pub use cloud::*;

mod local;
pub use local::*;

/// An authentication header for one outgoing request.
///
/// Produced per request and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Header name, backend-specific (e.g. `X-Stamp`).
    pub header_name: String,
    /// Header value: the serialized signature or assertion.
    pub header_value: String,
}

/// A pluggable signing backend.
///
/// Exactly one signing identity is active per instance. Implementations have
/// no side effects beyond their own backend I/O (a platform prompt, a cloud
/// storage read, an in-memory signature).
#[async_trait]
pub trait Stamper: Send + Sync {
    /// Produces a [`Stamp`] over `payload`.
    ///
    /// # Errors
    /// * [`CustodyKitError::NotInitialized`] when called before the backend's
    ///   initialization or credential injection completed.
    /// * [`CustodyKitError::BackendUnavailable`] when a required platform
    ///   capability is missing.
    /// * [`CustodyKitError::UserCancelled`] when an interactive backend's
    ///   prompt was dismissed.
    /// * [`CustodyKitError::MalformedPayload`] when the payload cannot be
    ///   processed.
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError>;
}
