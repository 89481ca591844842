use thiserror::Error;

use crate::activity::ActivityStatus;

/// Error outputs from `CustodykitCore`.
#[derive(Debug, Error)]
pub enum CustodyKitError {
    /// A backend was used before its initialization completed (call order
    /// violation, e.g. stamping before a key pair was resolved or injected).
    #[error("not_initialized: {context}")]
    NotInitialized {
        /// What was missing when the call was made.
        context: String,
    },
    /// A platform capability the backend depends on is missing (no platform
    /// authenticator, cloud storage unreachable, relay frame not mounted).
    #[error("backend_unavailable: {context}")]
    BackendUnavailable {
        /// The capability that was unavailable.
        context: String,
    },
    /// The user dismissed an interactive prompt. Distinct from
    /// [`Self::BackendUnavailable`]: the capability exists but was declined.
    #[error("user_cancelled")]
    UserCancelled,
    /// The payload handed to a signing backend cannot be processed.
    #[error("malformed_payload: {reason}")]
    MalformedPayload {
        /// Why the payload was rejected.
        reason: String,
    },
    /// Invalid configuration detected at construction time. Never deferred:
    /// a misconfigured component refuses to build rather than degrade.
    #[error("configuration: {reason}")]
    Configuration {
        /// What was wrong with the configuration.
        reason: String,
    },
    /// A relay request of the same message type is already awaiting its
    /// response. The relay protocol correlates responses by type only, so a
    /// second in-flight request of the same type would cross-resolve.
    #[error("request_in_flight: {message_type}")]
    RequestInFlight {
        /// The wire `type` of the rejected request.
        message_type: String,
    },
    /// The relay frame reported an error or went away mid-request.
    #[error("relay_frame: {message}")]
    Frame {
        /// Error reported by (or on behalf of) the frame.
        message: String,
    },
    /// The operation needs additional approvals before it can execute. Not a
    /// terminal failure: callers resume by polling the carried activity id.
    #[error("consensus_needed: activity {activity_id} is {status}")]
    ConsensusNeeded {
        /// Id of the activity awaiting approvals.
        activity_id: String,
        /// Status the server reported.
        status: ActivityStatus,
    },
    /// The activity reached a terminal failure state, or the server attached
    /// an error message to it.
    #[error("activity_failed: activity {activity_id} is {status}: {message}")]
    ActivityFailed {
        /// Id of the failed activity.
        activity_id: String,
        /// Terminal (or error-carrying) status observed.
        status: ActivityStatus,
        /// Server-provided failure message, if any.
        message: String,
    },
    /// No terminal state was observed before the polling deadline.
    #[error("polling_timeout: activity {activity_id} not terminal after {waited_ms} ms")]
    PollingTimeout {
        /// Id of the activity that was being polled.
        activity_id: String,
        /// How long the poller waited.
        waited_ms: u64,
    },
    /// Sealing a credential bundle failed.
    #[error("encryption_failed: {context}")]
    Encryption {
        /// What was being sealed.
        context: String,
    },
    /// Opening a credential bundle failed: wrong recipient key, tampered
    /// ciphertext, or a malformed envelope.
    #[error("decryption_failed: {context}")]
    Decryption {
        /// What was being opened.
        context: String,
    },
    /// Persistent key-value storage failed.
    #[error("storage_error: {context}")]
    Storage {
        /// The operation that failed.
        context: String,
    },
    /// Unexpected error serializing or deserializing information.
    #[error("serialization_error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Network failure with request context.
    #[error("network_error: {url} (status {status:?}): {error}")]
    Network {
        /// URL of the failed request.
        url: String,
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Description of the failure.
        error: String,
    },
    /// HTTP request failure.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// An internal invariant was violated.
    #[error("internal: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl CustodyKitError {
    /// Creates a [`Self::NotInitialized`] error.
    pub fn not_initialized<S: Into<String>>(context: S) -> Self {
        Self::NotInitialized {
            context: context.into(),
        }
    }

    /// Creates a [`Self::BackendUnavailable`] error.
    pub fn unavailable<S: Into<String>>(context: S) -> Self {
        Self::BackendUnavailable {
            context: context.into(),
        }
    }

    /// Creates a [`Self::MalformedPayload`] error.
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Creates a [`Self::Configuration`] error.
    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Creates a [`Self::Frame`] error.
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Creates a [`Self::Encryption`] error.
    pub fn encryption<S: Into<String>>(context: S) -> Self {
        Self::Encryption {
            context: context.into(),
        }
    }

    /// Creates a [`Self::Decryption`] error.
    pub fn decryption<S: Into<String>>(context: S) -> Self {
        Self::Decryption {
            context: context.into(),
        }
    }

    /// Creates a [`Self::Storage`] error.
    pub fn storage<S: Into<String>>(context: S) -> Self {
        Self::Storage {
            context: context.into(),
        }
    }

    /// Creates a [`Self::Internal`] error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CustodyKitError::ConsensusNeeded {
            activity_id: "act-1".to_string(),
            status: ActivityStatus::ConsensusNeeded,
        };
        assert_eq!(
            format!("{err}"),
            "consensus_needed: activity act-1 is CONSENSUS_NEEDED"
        );

        let err = CustodyKitError::not_initialized("no key pair resolved");
        assert!(format!("{err}").contains("no key pair resolved"));

        let err = CustodyKitError::UserCancelled;
        assert_eq!(format!("{err}"), "user_cancelled");
    }
}
