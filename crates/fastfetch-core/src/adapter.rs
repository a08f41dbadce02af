//! Per-network capability interface.
//!
//! Every ad network plugs into the engine through a [`NetworkAdapter`]. The
//! only required capabilities are the network type and the URL builder;
//! every other hook has a default that matches the behavior of a network
//! that does not customize it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;

use crate::config::SlotConfig;
use crate::consent::ConsentTuple;
use crate::headers::{self, CreativeSize};
use crate::metadata::CreativeMetadata;
use crate::request_url::RtcResponses;
use crate::transport::TransportError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by network adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The adapter could not build an ad URL.
    #[error("failed to build ad url: {0}")]
    UrlBuilder(String),

    /// A render hook failed.
    #[error("creative render hook failed: {0}")]
    RenderHook(String),
}

impl AdapterError {
    /// Creates a URL builder error.
    #[must_use]
    pub fn url_builder(message: impl Into<String>) -> Self {
        Self::UrlBuilder(message.into())
    }

    /// Creates a render hook error.
    #[must_use]
    pub fn render_hook(message: impl Into<String>) -> Self {
        Self::RenderHook(message.into())
    }
}

// =============================================================================
// Hook Inputs and Outputs
// =============================================================================

/// Everything the URL builder may use.
#[derive(Clone)]
pub struct AdUrlContext {
    /// Consent snapshot for this generation.
    pub consent: ConsentTuple,
    /// RTC results, if callouts were started.
    pub rtc: Option<RtcResponses>,
    /// Serve non-personalized ads.
    pub serve_npa: bool,
}

impl fmt::Debug for AdUrlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdUrlContext")
            .field("consent", &self.consent)
            .field("has_rtc", &self.rtc.is_some())
            .field("serve_npa", &self.serve_npa)
            .finish()
    }
}

/// Why an ad request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkFailure {
    /// The transport failed.
    Transport(TransportError),
    /// The server answered with a non-200 status.
    Status(u16),
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Status(status) => write!(f, "unexpected status {status}"),
        }
    }
}

/// Adapter decision after a failed ad request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFailureResult {
    /// URL to use for the GET-iframe retry, `None` to keep the original.
    pub ad_url: Option<String>,
    /// Do not retry through a GET iframe.
    pub frame_get_disabled: bool,
    /// Treat the failure as an empty response and collapse.
    pub treat_as_absent: bool,
}

impl NetworkFailureResult {
    /// Default decision: non-200 statuses collapse, transport failures retry
    /// with the original URL.
    #[must_use]
    pub const fn default_for(failure: &NetworkFailure) -> Self {
        Self {
            ad_url: None,
            frame_get_disabled: false,
            treat_as_absent: matches!(failure, NetworkFailure::Status(_)),
        }
    }
}

// =============================================================================
// NetworkAdapter Trait
// =============================================================================

/// Per-network behavior.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Network type, e.g. `doubleclick`.
    fn network_type(&self) -> &str;

    /// Returns `false` if the slot is misconfigured for this network.
    fn is_valid_element(&self, slot: &SlotConfig) -> bool {
        let _ = slot;
        true
    }

    /// Builds the ad request URL. `None` or an empty string means no
    /// request is made.
    async fn ad_url(&self, ctx: AdUrlContext) -> Result<Option<String>, AdapterError>;

    /// Returns `true` to request non-personalized ads.
    async fn serve_npa_signal(&self) -> bool {
        false
    }

    /// Returns `false` if the network only supports GET iframes.
    fn is_xhr_allowed(&self) -> bool {
        true
    }

    /// Extracts the creative size from the response.
    fn extract_size(&self, headers: &HeaderMap) -> Option<CreativeSize> {
        headers::extract_size(headers)
    }

    /// Decides how a failed ad request is handled.
    fn on_network_failure(&self, failure: &NetworkFailure, ad_url: &str) -> NetworkFailureResult {
        let _ = ad_url;
        NetworkFailureResult::default_for(failure)
    }

    /// Render first-party even when crypto is unavailable.
    fn supports_preferential_render_without_crypto(&self) -> bool {
        false
    }

    /// Skip streaming validation for this response.
    fn skip_client_side_validation(&self, headers: &HeaderMap) -> bool {
        let _ = headers;
        false
    }

    /// Additional macros for RTC callout URLs.
    fn custom_rtc_macros(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Extra context merged into cross-domain frame metadata.
    fn additional_context_metadata(
        &self,
        is_safeframe: bool,
    ) -> serde_json::Map<String, serde_json::Value> {
        let _ = is_safeframe;
        serde_json::Map::new()
    }

    /// Runs after the creative rendered. `metadata` is `None` for
    /// cross-domain renders.
    fn on_creative_render(&self, metadata: Option<&CreativeMetadata>) -> Result<(), AdapterError> {
        let _ = metadata;
        Ok(())
    }

    /// Origins to preconnect when the request starts.
    fn preconnect_urls(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Adapter for a network that only provides a fixed ad URL.
#[derive(Debug, Clone)]
pub struct DefaultNetworkAdapter {
    network_type: String,
    ad_url: Option<String>,
}

impl DefaultNetworkAdapter {
    /// Creates an adapter that always requests `ad_url`.
    #[must_use]
    pub fn new(network_type: impl Into<String>, ad_url: Option<String>) -> Self {
        Self {
            network_type: network_type.into(),
            ad_url,
        }
    }
}

#[async_trait]
impl NetworkAdapter for DefaultNetworkAdapter {
    fn network_type(&self) -> &str {
        &self.network_type
    }

    async fn ad_url(&self, _ctx: AdUrlContext) -> Result<Option<String>, AdapterError> {
        Ok(self.ad_url.clone())
    }

    fn preconnect_urls(&self) -> Vec<String> {
        self.ad_url
            .as_deref()
            .and_then(|url| url::Url::parse(url).ok())
            .map(|url| vec![url.origin().ascii_serialization()])
            .unwrap_or_default()
    }
}
