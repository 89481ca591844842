//! Passkey stamping: WebAuthn platform assertions over a payload digest.
//!
//! The actual prompt is platform work (WebAuthn in a browser, ASAuthorization
//! on iOS, CredMan on Android) and is injected through
//! [`PasskeyAuthenticator`], keeping the stamping logic testable without a
//! real authenticator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::CustodyKitError;

use super::{Stamp, Stamper};

/// Header name carrying a passkey stamp.
pub const PASSKEY_STAMP_HEADER: &str = "X-Stamp-Webauthn";

/// Default assertion prompt timeout.
pub const DEFAULT_PASSKEY_TIMEOUT_MS: u32 = 60_000;

/// User-verification policy requested from the authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    /// Verification must happen or the assertion fails.
    Required,
    /// Verification is requested but not mandatory.
    Preferred,
    /// Verification should be skipped when possible.
    Discouraged,
}

/// Configuration for the passkey backend.
#[derive(Debug, Clone)]
pub struct PasskeyConfig {
    /// Relying-party id assertions are bound to.
    pub rp_id: String,
    /// Prompt timeout in milliseconds.
    pub timeout_ms: u32,
    /// Credential ids the prompt is restricted to; empty means any.
    pub allowed_credential_ids: Vec<String>,
    /// User-verification policy.
    pub user_verification: UserVerification,
}

impl PasskeyConfig {
    /// Creates a config for `rp_id` with default timeout, an open credential
    /// allow-list, and `Preferred` user verification.
    pub fn new<S: Into<String>>(rp_id: S) -> Self {
        Self {
            rp_id: rp_id.into(),
            timeout_ms: DEFAULT_PASSKEY_TIMEOUT_MS,
            allowed_credential_ids: Vec::new(),
            user_verification: UserVerification::Preferred,
        }
    }
}

/// A platform assertion, already encoded the way the custody API expects
/// (base64url fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyAssertion {
    /// Authenticator data returned by the platform.
    pub authenticator_data: String,
    /// Client data JSON covering the challenge.
    pub client_data_json: String,
    /// Id of the credential that produced the assertion.
    pub credential_id: String,
    /// Assertion signature.
    pub signature: String,
}

/// Ways a platform assertion prompt can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PasskeyPromptError {
    /// No platform authenticator is available in this environment.
    #[error("no platform authenticator available")]
    Unavailable,
    /// The user dismissed the prompt.
    #[error("user cancelled the assertion prompt")]
    Cancelled,
}

/// Platform capability: prompt for an assertion bound to a challenge.
#[async_trait]
pub trait PasskeyAuthenticator: Send + Sync {
    /// Requests an assertion over `challenge` under the policy in `config`.
    ///
    /// # Errors
    /// Returns [`PasskeyPromptError`] when no authenticator exists or the
    /// user cancels. Implementations must fail rather than return an empty
    /// assertion.
    async fn get_assertion(
        &self,
        challenge: [u8; 32],
        config: &PasskeyConfig,
    ) -> Result<PasskeyAssertion, PasskeyPromptError>;
}

/// [`Stamper`] backed by a platform passkey.
pub struct PasskeyStamper {
    config: PasskeyConfig,
    authenticator: Arc<dyn PasskeyAuthenticator>,
}

impl PasskeyStamper {
    /// Creates a passkey stamper.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if the relying-party id is
    /// empty.
    pub fn new(
        config: PasskeyConfig,
        authenticator: Arc<dyn PasskeyAuthenticator>,
    ) -> Result<Self, CustodyKitError> {
        if config.rp_id.is_empty() {
            return Err(CustodyKitError::configuration(
                "passkey relying-party id must not be empty",
            ));
        }
        Ok(Self {
            config,
            authenticator,
        })
    }
}

#[async_trait]
impl Stamper for PasskeyStamper {
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        let challenge: [u8; 32] = Sha256::digest(payload.as_bytes()).into();

        let assertion = self
            .authenticator
            .get_assertion(challenge, &self.config)
            .await
            .map_err(|e| match e {
                PasskeyPromptError::Unavailable => {
                    CustodyKitError::unavailable("no platform authenticator available")
                }
                PasskeyPromptError::Cancelled => CustodyKitError::UserCancelled,
            })?;

        Ok(Stamp {
            header_name: PASSKEY_STAMP_HEADER.to_string(),
            header_value: serde_json::to_string(&assertion)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted authenticator: records the challenge it was handed and
    /// returns a fixed outcome.
    struct ScriptedAuthenticator {
        outcome: Result<PasskeyAssertion, PasskeyPromptError>,
        seen_challenge: std::sync::Mutex<Option<[u8; 32]>>,
    }

    impl ScriptedAuthenticator {
        fn returning(outcome: Result<PasskeyAssertion, PasskeyPromptError>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen_challenge: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl PasskeyAuthenticator for ScriptedAuthenticator {
        async fn get_assertion(
            &self,
            challenge: [u8; 32],
            _config: &PasskeyConfig,
        ) -> Result<PasskeyAssertion, PasskeyPromptError> {
            *self.seen_challenge.lock().unwrap() = Some(challenge);
            self.outcome.clone()
        }
    }

    fn assertion() -> PasskeyAssertion {
        PasskeyAssertion {
            authenticator_data: "YXV0aC1kYXRh".to_string(),
            client_data_json: "Y2xpZW50LWRhdGE".to_string(),
            credential_id: "cred-1".to_string(),
            signature: "c2ln".to_string(),
        }
    }

    #[tokio::test]
    async fn test_challenge_is_payload_digest() {
        let authenticator = ScriptedAuthenticator::returning(Ok(assertion()));
        let stamper =
            PasskeyStamper::new(PasskeyConfig::new("custodykit.dev"), authenticator.clone())
                .unwrap();

        let stamp = stamper.stamp("payload").await.unwrap();
        assert_eq!(stamp.header_name, PASSKEY_STAMP_HEADER);

        let expected: [u8; 32] = Sha256::digest(b"payload").into();
        assert_eq!(*authenticator.seen_challenge.lock().unwrap(), Some(expected));

        let body: serde_json::Value = serde_json::from_str(&stamp.header_value).unwrap();
        assert_eq!(body["credentialId"], "cred-1");
        assert_eq!(body["clientDataJson"], "Y2xpZW50LWRhdGE");
    }

    #[tokio::test]
    async fn test_cancellation_is_not_unavailability() {
        let cancelled = ScriptedAuthenticator::returning(Err(PasskeyPromptError::Cancelled));
        let stamper =
            PasskeyStamper::new(PasskeyConfig::new("custodykit.dev"), cancelled).unwrap();
        assert!(matches!(
            stamper.stamp("payload").await,
            Err(CustodyKitError::UserCancelled)
        ));

        let unavailable = ScriptedAuthenticator::returning(Err(PasskeyPromptError::Unavailable));
        let stamper =
            PasskeyStamper::new(PasskeyConfig::new("custodykit.dev"), unavailable).unwrap();
        assert!(matches!(
            stamper.stamp("payload").await,
            Err(CustodyKitError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_empty_rp_id_is_rejected() {
        let authenticator = ScriptedAuthenticator::returning(Ok(assertion()));
        let result = PasskeyStamper::new(PasskeyConfig::new(""), authenticator);
        assert!(matches!(result, Err(CustodyKitError::Configuration { .. })));
    }
}
