//! Frame hosting capability.
//!
//! The relay frame's core logic is platform-agnostic: it validates anchors,
//! tracks pending requests, and filters message origins. Where the isolated
//! context actually lives (a sandboxed iframe, a separate process, or an
//! in-process enclave) is the host's business, abstracted behind
//! [`FrameHost`]. [`MemoryFrameHost`] is the in-process implementation used
//! on native targets and in tests: it mounts an [`Enclave`] and routes
//! messages over channels.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::CustodyKitError;

use super::enclave::Enclave;
use super::messages::FrameMessage;
use super::{resolve_origin, RelayFrameConfig};

/// One inbound message, tagged with the origin it arrived from.
///
/// The message channel is shared: browser extensions, dev tooling, and other
/// scripts post to the same channel, so receivers must check `origin` before
/// trusting `message`.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Origin of the sender, e.g. `https://relay.custodykit.dev`.
    pub origin: String,
    /// The message payload.
    pub message: FrameMessage,
}

/// Platform capability: mount an isolated frame and exchange messages with
/// it.
pub trait FrameHost: Send + Sync {
    /// Checks that a frame with this config could be mounted right now:
    /// the container exists, the element id is free, and the environment
    /// supports isolated frames at all.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] otherwise. Must not mutate
    /// anything.
    fn validate_mount(&self, config: &RelayFrameConfig) -> Result<(), CustodyKitError>;

    /// Mounts the frame element. The frame announces its public key on the
    /// subscribed channel once it has generated its key pair.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] under the same conditions
    /// as [`Self::validate_mount`].
    fn insert_frame(&self, config: &RelayFrameConfig) -> Result<(), CustodyKitError>;

    /// Removes the frame element. Removing an unmounted frame is a no-op.
    fn remove_frame(&self, config: &RelayFrameConfig);

    /// Posts a message to the frame.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::BackendUnavailable`] if no frame is
    /// mounted.
    fn post_message(&self, message: &FrameMessage) -> Result<(), CustodyKitError>;

    /// Subscribes to messages flowing from the frame (and anyone else on the
    /// shared channel) to the parent. A new subscription replaces the
    /// previous one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage>;
}

struct MountedFrame {
    element_id: String,
    origin: String,
    enclave: Enclave,
}

/// In-process [`FrameHost`]: the "frame" is an [`Enclave`] living in this
/// process, and the shared message channel is a tokio channel.
///
/// The simulated document starts empty; register containers (and, for
/// conflict scenarios, stray elements) before mounting.
pub struct MemoryFrameHost {
    containers: Mutex<HashSet<String>>,
    elements: Mutex<HashSet<String>>,
    mounted: Mutex<Option<MountedFrame>>,
    parent_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

impl MemoryFrameHost {
    /// Creates a host with an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashSet::new()),
            elements: Mutex::new(HashSet::new()),
            mounted: Mutex::new(None),
            parent_tx: Mutex::new(None),
        }
    }

    /// Creates a host with one container pre-registered.
    #[must_use]
    pub fn with_container(container_id: &str) -> Self {
        let host = Self::new();
        host.register_container(container_id);
        host
    }

    /// Registers a container element the frame can be mounted into.
    pub fn register_container(&self, container_id: &str) {
        self.containers
            .lock()
            .expect("frame host mutex poisoned")
            .insert(container_id.to_string());
    }

    /// Registers a stray element, simulating a document that already
    /// contains a node with that id.
    pub fn register_element(&self, element_id: &str) {
        self.elements
            .lock()
            .expect("frame host mutex poisoned")
            .insert(element_id.to_string());
    }

    /// Whether the simulated document contains an element with this id.
    #[must_use]
    pub fn contains_element(&self, element_id: &str) -> bool {
        self.elements
            .lock()
            .expect("frame host mutex poisoned")
            .contains(element_id)
    }

    /// The mounted enclave's public key, if a frame is mounted.
    #[must_use]
    pub fn enclave_public_key(&self) -> Option<String> {
        self.mounted
            .lock()
            .expect("frame host mutex poisoned")
            .as_ref()
            .map(|frame| frame.enclave.public_key_hex().to_string())
    }

    /// Pushes an arbitrary message onto the parent's inbound channel, as any
    /// other script sharing the channel could. Used to exercise origin
    /// filtering.
    pub fn push_inbound(&self, origin: &str, message: FrameMessage) {
        if let Some(tx) = self
            .parent_tx
            .lock()
            .expect("frame host mutex poisoned")
            .as_ref()
        {
            let _ = tx.send(InboundMessage {
                origin: origin.to_string(),
                message,
            });
        }
    }

}

impl Default for MemoryFrameHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHost for MemoryFrameHost {
    fn validate_mount(&self, config: &RelayFrameConfig) -> Result<(), CustodyKitError> {
        resolve_origin(&config.url)?;
        if !self
            .containers
            .lock()
            .expect("frame host mutex poisoned")
            .contains(&config.container_id)
        {
            return Err(CustodyKitError::configuration(format!(
                "container element '{}' does not exist",
                config.container_id
            )));
        }
        if self.contains_element(&config.element_id) {
            return Err(CustodyKitError::configuration(format!(
                "element id '{}' is already present",
                config.element_id
            )));
        }
        Ok(())
    }

    fn insert_frame(&self, config: &RelayFrameConfig) -> Result<(), CustodyKitError> {
        self.validate_mount(config)?;
        let origin = resolve_origin(&config.url)?;

        let enclave = Enclave::new();
        let public_key = enclave.public_key_hex().to_string();

        self.elements
            .lock()
            .expect("frame host mutex poisoned")
            .insert(config.element_id.clone());
        *self.mounted.lock().expect("frame host mutex poisoned") = Some(MountedFrame {
            element_id: config.element_id.clone(),
            origin: origin.clone(),
            enclave,
        });

        // The freshly mounted frame announces its key pair.
        self.push_inbound(&origin, FrameMessage::PublicKeyReady { value: public_key });
        Ok(())
    }

    fn remove_frame(&self, config: &RelayFrameConfig) {
        let mut mounted = self.mounted.lock().expect("frame host mutex poisoned");
        let is_mounted_here = mounted
            .as_ref()
            .is_some_and(|frame| frame.element_id == config.element_id);
        if is_mounted_here {
            self.elements
                .lock()
                .expect("frame host mutex poisoned")
                .remove(&config.element_id);
            *mounted = None;
            // Tearing down the frame closes the parent's channel.
            *self.parent_tx.lock().expect("frame host mutex poisoned") = None;
        }
    }

    fn post_message(&self, message: &FrameMessage) -> Result<(), CustodyKitError> {
        let mounted = self.mounted.lock().expect("frame host mutex poisoned");
        let frame = mounted
            .as_ref()
            .ok_or_else(|| CustodyKitError::unavailable("relay frame is not mounted"))?;

        if let Some(response) = frame.enclave.handle(message) {
            let origin = frame.origin.clone();
            drop(mounted);
            self.push_inbound(&origin, response);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.parent_tx.lock().expect("frame host mutex poisoned") = Some(tx);
        rx
    }
}
