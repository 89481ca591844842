//! Cross-context credential relay.
//!
//! A [`RelayFrame`] lets the application use sensitive key material without
//! ever holding it: the material travels as an encrypted
//! [`CredentialBundle`] into an isolated context (the "frame"), is decrypted
//! there, and thereafter the frame stamps requests on the application's
//! behalf. The application only ever sees the frame's public key, injection
//! acknowledgements, and stamp values.
//!
//! The protocol correlates responses to requests by message type alone;
//! there is no request id on the wire. [`RelayFrame`] therefore enforces at
//! most one in-flight request per message type: a second concurrent request
//! of the same type fails with [`CustodyKitError::RequestInFlight`] instead
//! of racing the first one for its response.
//!
//! Lifecycle: construct (anchors validated, nothing mounted) → [`init`]
//! (frame mounted, resolves on `PUBLIC_KEY_READY`) → inject / stamp →
//! [`clear`] (frame unmounted). `clear` does not revoke the resolved public
//! key held by this object; a cleared frame must not be reused.
//!
//! [`init`]: RelayFrame::init
//! [`clear`]: RelayFrame::clear

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;
use url::Url;

use crate::bundle::CredentialBundle;
use crate::error::CustodyKitError;
use crate::stamper::{Stamp, Stamper, API_KEY_STAMP_HEADER};

mod enclave;
pub use enclave::Enclave;

mod host;
pub use host::{FrameHost, InboundMessage, MemoryFrameHost};

mod messages;
pub use messages::{FrameMessage, KeyFormat, MessageKind};

/// Default element id for the mounted frame.
pub const DEFAULT_FRAME_ELEMENT_ID: &str = "custodykit-relay-frame";

/// Where and how the relay frame is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrameConfig {
    /// URL the isolated context is loaded from. Its origin is the only
    /// origin inbound messages are accepted from.
    pub url: String,
    /// Id of the container element the frame is appended to.
    pub container_id: String,
    /// Id given to the frame element itself.
    pub element_id: String,
}

impl RelayFrameConfig {
    /// Creates a config.
    pub fn new<U: Into<String>, C: Into<String>, E: Into<String>>(
        url: U,
        container_id: C,
        element_id: E,
    ) -> Self {
        Self {
            url: url.into(),
            container_id: container_id.into(),
            element_id: element_id.into(),
        }
    }
}

/// Resolves the origin of a frame URL (scheme://host[:port]).
pub(crate) fn resolve_origin(url: &str) -> Result<String, CustodyKitError> {
    let parsed = Url::parse(url)
        .map_err(|e| CustodyKitError::configuration(format!("invalid frame url '{url}': {e}")))?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(CustodyKitError::configuration(format!(
            "frame url '{url}' has an opaque origin"
        )));
    }
    Ok(origin.ascii_serialization())
}

type PendingSlot = oneshot::Sender<Result<FrameMessage, String>>;

/// Per-instance registry of requests awaiting their (type-correlated)
/// response.
#[derive(Default)]
struct PendingRegistry {
    slots: Mutex<HashMap<MessageKind, PendingSlot>>,
}

impl PendingRegistry {
    fn register(
        &self,
        kind: MessageKind,
    ) -> Result<oneshot::Receiver<Result<FrameMessage, String>>, CustodyKitError> {
        let mut slots = self.slots.lock().expect("pending registry mutex poisoned");
        if slots.contains_key(&kind) {
            return Err(CustodyKitError::RequestInFlight {
                message_type: kind.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(kind, tx);
        Ok(rx)
    }

    fn remove(&self, kind: MessageKind) {
        self.slots
            .lock()
            .expect("pending registry mutex poisoned")
            .remove(&kind);
    }

    fn resolve(&self, message: FrameMessage) {
        let slot = self
            .slots
            .lock()
            .expect("pending registry mutex poisoned")
            .remove(&message.kind());
        match slot {
            Some(tx) => {
                let _ = tx.send(Ok(message));
            }
            None => trace!(kind = %message.kind(), "dropping unsolicited frame message"),
        }
    }

    fn fail_all(&self, reason: &str) {
        let slots: Vec<_> = {
            let mut slots = self.slots.lock().expect("pending registry mutex poisoned");
            slots.drain().collect()
        };
        for (_, tx) in slots {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

/// Parent-side handle to an isolated credential-custody context.
pub struct RelayFrame {
    config: RelayFrameConfig,
    origin: String,
    host: Arc<dyn FrameHost>,
    pending: Arc<PendingRegistry>,
    public_key: Mutex<Option<String>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayFrame")
            .field("config", &self.config)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl RelayFrame {
    /// Validates the config against the host without mounting anything.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if the frame URL has no
    /// usable origin, the container is missing, an element with the same id
    /// already exists, or the host cannot create isolated frames at all.
    pub fn new(
        config: RelayFrameConfig,
        host: Arc<dyn FrameHost>,
    ) -> Result<Self, CustodyKitError> {
        let origin = resolve_origin(&config.url)?;
        host.validate_mount(&config)?;
        Ok(Self {
            config,
            origin,
            host,
            pending: Arc::new(PendingRegistry::default()),
            public_key: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    /// Mounts the frame and waits for it to announce its public key, the
    /// address future credential bundles must be sealed to. Returns that key,
    /// hex-encoded.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if called twice or if
    /// mounting fails, and [`CustodyKitError::Frame`] if the frame goes away
    /// before announcing its key.
    pub async fn init(&self) -> Result<String, CustodyKitError> {
        {
            let mut dispatcher = self.dispatcher.lock().expect("relay frame mutex poisoned");
            if dispatcher.is_some() {
                return Err(CustodyKitError::configuration(
                    "init() has already been called on this relay frame",
                ));
            }
            let rx = self.host.subscribe();
            *dispatcher = Some(tokio::spawn(dispatch(
                rx,
                self.origin.clone(),
                Arc::clone(&self.pending),
            )));
        }

        let wait = self.pending.register(MessageKind::PublicKeyReady)?;
        if let Err(e) = self.host.insert_frame(&self.config) {
            self.pending.remove(MessageKind::PublicKeyReady);
            return Err(e);
        }

        match await_slot(wait).await? {
            FrameMessage::PublicKeyReady { value } => {
                *self.public_key.lock().expect("relay frame mutex poisoned") = Some(value.clone());
                Ok(value)
            }
            other => Err(CustodyKitError::internal(format!(
                "pending registry resolved PUBLIC_KEY_READY with {}",
                other.kind()
            ))),
        }
    }

    /// The frame's public key, once [`Self::init`] has resolved. Not revoked
    /// by [`Self::clear`].
    #[must_use]
    pub fn public_key(&self) -> Option<String> {
        self.public_key
            .lock()
            .expect("relay frame mutex poisoned")
            .clone()
    }

    /// Injects an encrypted recovery bundle (an API key sealed to the
    /// frame's public key). On success the frame can stamp requests.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Decryption`] if the frame rejects the
    /// bundle, plus the usual frame/transport errors.
    pub async fn inject_recovery_bundle(
        &self,
        bundle: &CredentialBundle,
    ) -> Result<(), CustodyKitError> {
        self.ensure_ready()?;
        let response = self
            .request(
                FrameMessage::InjectRecoveryBundle {
                    value: bundle.as_str().to_string(),
                },
                MessageKind::BundleInjected,
            )
            .await?;
        ack(&response)
    }

    /// Injects an encrypted private-key bundle for an export/import flow,
    /// with the encoding the frame should keep the key in.
    ///
    /// # Errors
    /// Same contract as [`Self::inject_recovery_bundle`].
    pub async fn inject_key_bundle(
        &self,
        organization_id: &str,
        bundle: &CredentialBundle,
        key_format: KeyFormat,
    ) -> Result<(), CustodyKitError> {
        self.ensure_ready()?;
        let response = self
            .request(
                FrameMessage::InjectKeyBundle {
                    value: bundle.as_str().to_string(),
                    organization_id: organization_id.to_string(),
                    key_format,
                },
                MessageKind::KeyBundleInjected,
            )
            .await?;
        ack(&response)
    }

    /// Injects an encrypted wallet (seed) bundle for an export/import flow.
    ///
    /// # Errors
    /// Same contract as [`Self::inject_recovery_bundle`].
    pub async fn inject_wallet_bundle(
        &self,
        organization_id: &str,
        bundle: &CredentialBundle,
    ) -> Result<(), CustodyKitError> {
        self.ensure_ready()?;
        let response = self
            .request(
                FrameMessage::InjectWalletBundle {
                    value: bundle.as_str().to_string(),
                    organization_id: organization_id.to_string(),
                },
                MessageKind::WalletBundleInjected,
            )
            .await?;
        ack(&response)
    }

    /// Unmounts the frame and fails any pending requests.
    ///
    /// The resolved public key is deliberately left in place; callers must
    /// not keep using a cleared instance.
    pub fn clear(&self) {
        self.host.remove_frame(&self.config);
        self.pending.fail_all("relay frame cleared");
        if let Some(handle) = self
            .dispatcher
            .lock()
            .expect("relay frame mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }

    fn ensure_ready(&self) -> Result<(), CustodyKitError> {
        if self
            .public_key
            .lock()
            .expect("relay frame mutex poisoned")
            .is_none()
        {
            return Err(CustodyKitError::not_initialized(
                "relay frame: init() has not completed",
            ));
        }
        Ok(())
    }

    async fn request(
        &self,
        message: FrameMessage,
        expect: MessageKind,
    ) -> Result<FrameMessage, CustodyKitError> {
        let wait = self.pending.register(expect)?;
        if let Err(e) = self.host.post_message(&message) {
            self.pending.remove(expect);
            return Err(e);
        }
        await_slot(wait).await
    }

    async fn stamp_payload(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        self.ensure_ready()?;
        let digest = hex::encode(Sha256::digest(payload.as_bytes()));
        let response = self
            .request(
                FrameMessage::StampRequest { value: digest },
                MessageKind::Stamp,
            )
            .await?;
        match response {
            FrameMessage::Stamp { value } => Ok(Stamp {
                header_name: API_KEY_STAMP_HEADER.to_string(),
                header_value: value,
            }),
            other => Err(CustodyKitError::internal(format!(
                "pending registry resolved STAMP with {}",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Stamper for RelayFrame {
    async fn stamp(&self, payload: &str) -> Result<Stamp, CustodyKitError> {
        self.stamp_payload(payload).await
    }
}

impl Drop for RelayFrame {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}

fn ack(message: &FrameMessage) -> Result<(), CustodyKitError> {
    match message {
        FrameMessage::BundleInjected { value }
        | FrameMessage::KeyBundleInjected { value }
        | FrameMessage::WalletBundleInjected { value } => {
            if *value {
                Ok(())
            } else {
                Err(CustodyKitError::decryption(
                    "frame rejected the credential bundle",
                ))
            }
        }
        other => Err(CustodyKitError::internal(format!(
            "unexpected injection acknowledgement {}",
            other.kind()
        ))),
    }
}

async fn await_slot(
    rx: oneshot::Receiver<Result<FrameMessage, String>>,
) -> Result<FrameMessage, CustodyKitError> {
    match rx.await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(reason)) => Err(CustodyKitError::frame(reason)),
        Err(_) => Err(CustodyKitError::frame("relay frame channel closed")),
    }
}

/// Routes inbound messages to pending requests, dropping anything from a
/// foreign origin. Shared-channel noise is expected, so mismatches are
/// silently ignored rather than surfaced.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    origin: String,
    pending: Arc<PendingRegistry>,
) {
    while let Some(inbound) = rx.recv().await {
        if inbound.origin != origin {
            trace!(origin = %inbound.origin, "ignoring message from foreign origin");
            continue;
        }
        match inbound.message {
            FrameMessage::Error { value } => pending.fail_all(&value),
            message => pending.resolve(message),
        }
    }
    pending.fail_all("relay frame channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{recipient_from_hex, seal};
    use crate::stamper::{verify_digest_stamp, ApiKeyPair};

    const FRAME_URL: &str = "https://relay.custodykit.dev/recovery";

    fn config() -> RelayFrameConfig {
        RelayFrameConfig::new(FRAME_URL, "kit-container", DEFAULT_FRAME_ELEMENT_ID)
    }

    fn host() -> Arc<MemoryFrameHost> {
        Arc::new(MemoryFrameHost::with_container("kit-container"))
    }

    #[test]
    fn test_missing_container_fails_before_any_mutation() {
        let host = Arc::new(MemoryFrameHost::new());
        let err = RelayFrame::new(config(), host.clone()).unwrap_err();
        assert!(matches!(err, CustodyKitError::Configuration { .. }));
        assert!(!host.contains_element(DEFAULT_FRAME_ELEMENT_ID));
    }

    #[test]
    fn test_duplicate_element_id_fails_and_does_not_replace() {
        let host = host();
        host.register_element(DEFAULT_FRAME_ELEMENT_ID);
        let err = RelayFrame::new(config(), host.clone()).unwrap_err();
        assert!(matches!(err, CustodyKitError::Configuration { .. }));
        assert!(host.contains_element(DEFAULT_FRAME_ELEMENT_ID));
    }

    #[test]
    fn test_opaque_frame_url_is_rejected() {
        let bad = RelayFrameConfig::new("data:text/html,hi", "kit-container", "el");
        let err = RelayFrame::new(bad, host()).unwrap_err();
        assert!(matches!(err, CustodyKitError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_init_resolves_frame_public_key() {
        let host = host();
        let frame = RelayFrame::new(config(), host.clone()).unwrap();
        assert_eq!(frame.public_key(), None);

        let public_key = frame.init().await.unwrap();
        assert_eq!(Some(public_key.clone()), host.enclave_public_key());
        assert_eq!(frame.public_key(), Some(public_key));
    }

    #[tokio::test]
    async fn test_init_twice_is_rejected() {
        let frame = RelayFrame::new(config(), host()).unwrap();
        frame.init().await.unwrap();
        assert!(matches!(
            frame.init().await,
            Err(CustodyKitError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_stamp_before_init_is_rejected() {
        let frame = RelayFrame::new(config(), host()).unwrap();
        assert!(matches!(
            frame.stamp_payload("payload").await,
            Err(CustodyKitError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_inject_and_stamp_roundtrip() {
        let frame = RelayFrame::new(config(), host()).unwrap();
        let frame_key = frame.init().await.unwrap();

        let api_key = ApiKeyPair::generate();
        let raw = hex::decode(api_key.private_key_hex().as_str()).unwrap();
        let bundle = seal(&raw, &recipient_from_hex(&frame_key).unwrap()).unwrap();
        frame.inject_recovery_bundle(&bundle).await.unwrap();

        let payload = r#"{"type":"SIGN_RAW_PAYLOAD"}"#;
        let stamp = frame.stamp_payload(payload).await.unwrap();
        assert_eq!(stamp.header_name, API_KEY_STAMP_HEADER);
        let digest: [u8; 32] = Sha256::digest(payload.as_bytes()).into();
        verify_digest_stamp(&stamp.header_value, &digest).unwrap();
    }

    #[tokio::test]
    async fn test_rejected_bundle_surfaces_as_decryption_error() {
        let frame = RelayFrame::new(config(), host()).unwrap();
        frame.init().await.unwrap();

        // Sealed to the wrong recipient: the frame cannot open it.
        let other = ApiKeyPair::generate();
        let stray_recipient = recipient_from_hex(other.public_key_hex()).unwrap();
        let bundle = seal(b"\x01\x02", &stray_recipient).unwrap();

        assert!(matches!(
            frame.inject_recovery_bundle(&bundle).await,
            Err(CustodyKitError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_origin_messages_are_ignored() {
        let host = host();
        let frame = RelayFrame::new(config(), host.clone()).unwrap();
        let real_key = frame.init().await.unwrap();

        // A hostile script posts a PUBLIC_KEY_READY with its own key and an
        // unsolicited stamp. Neither may affect the frame.
        host.push_inbound(
            "https://evil.example",
            FrameMessage::PublicKeyReady {
                value: "02deadbeef".to_string(),
            },
        );
        host.push_inbound(
            "https://evil.example",
            FrameMessage::Stamp {
                value: "forged".to_string(),
            },
        );
        tokio::task::yield_now().await;

        assert_eq!(frame.public_key(), Some(real_key.clone()));

        // The frame still works: inject and stamp as usual.
        let api_key = ApiKeyPair::generate();
        let raw = hex::decode(api_key.private_key_hex().as_str()).unwrap();
        let bundle = seal(&raw, &recipient_from_hex(&real_key).unwrap()).unwrap();
        frame.inject_recovery_bundle(&bundle).await.unwrap();
        let stamp = frame.stamp_payload("payload").await.unwrap();
        assert_ne!(stamp.header_value, "forged");
    }

    #[tokio::test]
    async fn test_cleared_frame_fails_closed() {
        let host = host();
        let frame = RelayFrame::new(config(), host.clone()).unwrap();
        let public_key = frame.init().await.unwrap();

        frame.clear();
        assert!(!host.contains_element(DEFAULT_FRAME_ELEMENT_ID));
        // The resolved key is not revoked by clear().
        assert_eq!(frame.public_key(), Some(public_key));
        // But the frame is gone, so requests fail.
        assert!(matches!(
            frame.stamp_payload("payload").await,
            Err(CustodyKitError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_wallet_and_key_bundle_injection() {
        let frame = RelayFrame::new(config(), host()).unwrap();
        let frame_key = frame.init().await.unwrap();
        let recipient = recipient_from_hex(&frame_key).unwrap();

        let seed_bundle = seal(b"gym hazard anchor verb hair ladder", &recipient).unwrap();
        frame
            .inject_wallet_bundle("org-1", &seed_bundle)
            .await
            .unwrap();

        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let key_bundle = seal(&key.to_bytes(), &recipient).unwrap();
        frame
            .inject_key_bundle("org-1", &key_bundle, KeyFormat::Hexadecimal)
            .await
            .unwrap();
    }
}
