//! # fastfetch-core
//!
//! Ad lifecycle engine for a single ad slot on a hosted page.
//!
//! Given a placeholder slot, the engine fetches a remotely served creative,
//! validates it and renders it through one of several isolation strategies:
//!
//! - **Signed flow**: the creative's signature is verified against the
//!   signing service's keyset and its embedded metadata is extracted; a
//!   valid creative renders first-party in a friendly embed.
//! - **Trustless flow**: the creative is streamed and its `<head>` is
//!   validated structurally; an approved creative renders first-party in a
//!   sandboxed secure frame.
//! - **Cross-domain fallback**: anything that fails validation renders in a
//!   safeframe, nameframe or GET iframe.
//!
//! ## Core Concepts
//!
//! - **Generation**: every (re)start of the pipeline gets a new id; stages
//!   holding a stale id stop at their next check ([`generation`]).
//! - **Ad promise**: the shared future of the request half of one
//!   generation ([`slot::AdPromise`]).
//! - **Collaborators**: the hosting page is reached only through traits
//!   ([`render::SlotHost`], [`host::HostDocument`],
//!   [`adapter::NetworkAdapter`], [`transport::Transport`], ...).
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use fastfetch_core::prelude::*;
//!
//! let services = SlotServices::new(adapter, transport, host, document, installer)
//!     .with_verifier(Arc::new(SignatureVerifier::new(engine.verifier.clone(), fetcher)));
//! let slot = AdSlot::new(engine, SlotConfig::new("doubleclick", 320, 50), services);
//!
//! slot.initiate_ad_request();
//! match slot.layout().await {
//!     RenderOutcome::FirstParty(kind) => println!("rendered {kind:?}"),
//!     other => println!("{other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod analytics;
pub mod config;
pub mod consent;
pub mod error;
pub mod frame;
pub mod generation;
pub mod head;
pub mod headers;
pub mod host;
pub mod metadata;
pub mod refresh;
pub mod render;
pub mod report;
pub mod request_url;
pub mod signature;
pub mod slot;
pub mod state;
pub mod transport;
pub mod validator;

// Re-export main types at crate root for convenience
pub use adapter::{DefaultNetworkAdapter, NetworkAdapter};
pub use config::{EngineConfig, SlotConfig};
pub use error::{PipelineError, Signal};
pub use refresh::{RefreshController, RefreshOutcome};
pub use render::RenderOutcome;
pub use slot::{AdSlot, SlotServices};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::adapter::{AdUrlContext, AdapterError, DefaultNetworkAdapter, NetworkAdapter};
    pub use crate::analytics::{AnalyticsEvent, AnalyticsSink};
    pub use crate::config::{EngineConfig, EngineMode, SlotConfig, ValidationFlow};
    pub use crate::error::{PipelineError, Signal};
    pub use crate::headers::{CreativeSize, RenderMode};
    pub use crate::host::{HostDocument, PageContext, Preconnector};
    pub use crate::refresh::{RefreshController, RefreshOutcome};
    pub use crate::render::{EmbedHandle, EmbedInstaller, EmbedSpec, FrameId, RenderOutcome, SlotHost};
    pub use crate::signature::{KeysetFetcher, SignatureVerifier, VerificationStatus};
    pub use crate::slot::{AdSlot, SlotServices};
    pub use crate::transport::{FetchRequest, FetchResponse, Transport};
}
