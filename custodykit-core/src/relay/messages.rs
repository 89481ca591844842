//! Wire protocol between the parent context and the relay frame.
//!
//! Messages are JSON objects tagged by a SCREAMING_SNAKE `type` field, the
//! shape a postMessage transport carries verbatim. Responses correlate to
//! requests by type only (there is no request id), which is why the parent
//! enforces at most one in-flight request per type (see
//! [`RelayFrame`](super::RelayFrame)).

use serde::{Deserialize, Serialize};
use strum::Display;

/// Address-format-dependent encoding for injected private keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyFormat {
    /// Raw scalar, hex-encoded.
    Hexadecimal,
    /// PKCS#8 PEM document.
    Pkcs8,
}

/// A message on the parent ⇄ frame channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameMessage {
    /// frame → parent: announces the frame's fresh public key (hex). This is
    /// the address credential bundles must be sealed to.
    #[serde(rename = "PUBLIC_KEY_READY", rename_all = "camelCase")]
    PublicKeyReady {
        /// Hex-encoded compressed P-256 public key.
        value: String,
    },
    /// parent → frame: inject an encrypted recovery bundle (an API key).
    #[serde(rename = "INJECT_RECOVERY_BUNDLE", rename_all = "camelCase")]
    InjectRecoveryBundle {
        /// The encoded credential bundle.
        value: String,
    },
    /// frame → parent: acknowledges a recovery bundle injection.
    #[serde(rename = "BUNDLE_INJECTED", rename_all = "camelCase")]
    BundleInjected {
        /// Whether the bundle decrypted and activated.
        value: bool,
    },
    /// parent → frame: inject an encrypted private-key bundle.
    #[serde(rename = "INJECT_KEY_BUNDLE", rename_all = "camelCase")]
    InjectKeyBundle {
        /// The encoded credential bundle.
        value: String,
        /// Organization the key belongs to.
        organization_id: String,
        /// Encoding the frame should keep the key in.
        key_format: KeyFormat,
    },
    /// frame → parent: acknowledges a private-key bundle injection.
    #[serde(rename = "KEY_BUNDLE_INJECTED", rename_all = "camelCase")]
    KeyBundleInjected {
        /// Whether the bundle decrypted and activated.
        value: bool,
    },
    /// parent → frame: inject an encrypted wallet (seed) bundle.
    #[serde(rename = "INJECT_WALLET_BUNDLE", rename_all = "camelCase")]
    InjectWalletBundle {
        /// The encoded credential bundle.
        value: String,
        /// Organization the wallet belongs to.
        organization_id: String,
    },
    /// frame → parent: acknowledges a wallet bundle injection.
    #[serde(rename = "WALLET_BUNDLE_INJECTED", rename_all = "camelCase")]
    WalletBundleInjected {
        /// Whether the bundle decrypted and activated.
        value: bool,
    },
    /// parent → frame: request a stamp over a payload digest.
    #[serde(rename = "STAMP_REQUEST", rename_all = "camelCase")]
    StampRequest {
        /// Hex-encoded SHA-256 digest of the payload.
        value: String,
    },
    /// frame → parent: the produced stamp header value.
    #[serde(rename = "STAMP", rename_all = "camelCase")]
    Stamp {
        /// The stamp header value.
        value: String,
    },
    /// frame → parent: the frame could not serve a request.
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        /// Description of the failure.
        value: String,
    },
}

/// Message type discriminant, used to key the pending-request registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)] // mirrors FrameMessage variant for variant
pub enum MessageKind {
    PublicKeyReady,
    InjectRecoveryBundle,
    BundleInjected,
    InjectKeyBundle,
    KeyBundleInjected,
    InjectWalletBundle,
    WalletBundleInjected,
    StampRequest,
    Stamp,
    Error,
}

impl FrameMessage {
    /// The discriminant of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::PublicKeyReady { .. } => MessageKind::PublicKeyReady,
            Self::InjectRecoveryBundle { .. } => MessageKind::InjectRecoveryBundle,
            Self::BundleInjected { .. } => MessageKind::BundleInjected,
            Self::InjectKeyBundle { .. } => MessageKind::InjectKeyBundle,
            Self::KeyBundleInjected { .. } => MessageKind::KeyBundleInjected,
            Self::InjectWalletBundle { .. } => MessageKind::InjectWalletBundle,
            Self::WalletBundleInjected { .. } => MessageKind::WalletBundleInjected,
            Self::StampRequest { .. } => MessageKind::StampRequest,
            Self::Stamp { .. } => MessageKind::Stamp,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}
