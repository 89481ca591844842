//! Core client SDK for the Custodykit remote key-custody and signing service.
//!
//! The SDK covers three areas: request authentication ("stamping") through
//! pluggable [`stamper`] backends, relaying encrypted credentials into an
//! isolated execution context ([`relay`]) so the application never holds
//! plaintext key material, and polling multi-party-approved operations until
//! they reach a terminal state ([`ActivityPoller`]).
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
use strum::EnumString;

/// Hosted environment the SDK talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// Pre-production environment.
    Staging,
    /// Production environment.
    Production,
}

mod error;
pub use error::*;

mod defaults;
pub use defaults::*;

mod activity;
pub use activity::*;

mod poller;
pub use poller::*;

mod client;
pub use client::*;

pub mod bundle;
pub use bundle::CredentialBundle;

mod scheduler;
pub use scheduler::*;

mod session;
pub use session::*;

mod storage;
pub use storage::*;

pub mod relay;
pub mod stamper;

// private modules
mod http;
