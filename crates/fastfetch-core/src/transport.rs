//! Ad request transport and response classification.
//!
//! [`Transport`] is the HTTP boundary. [`TransportStage`] runs the fetch step
//! of one generation: it decides whether a request is made at all, sends it,
//! routes failures through the network adapter and classifies the response
//! headers into slot state before handing the still-streaming body to
//! validation.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use http::HeaderMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::adapter::{NetworkAdapter, NetworkFailure};
use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::config::{EngineConfig, SlotConfig};
use crate::error::{PipelineError, Signal};
use crate::frame::safeframe_path;
use crate::generation::GenerationToken;
use crate::headers::{RenderMode, ResponseHints};
use crate::host::{HostDocument, Preconnector};
use crate::render::SlotHost;
use crate::state::SharedRenderState;

/// A streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Host attribute set when the price-neutral experiment is enabled.
pub const PREF_NEUTRAL_ATTRIBUTE: &str = "data-amp-pref-neutral";

/// Errors from the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request could not be completed.
    #[error("request to {url} failed: {reason}")]
    Request {
        /// Requested URL.
        url: String,
        /// Why it failed.
        reason: String,
    },
    /// Reading the body failed midway.
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// Creates a request error.
    #[must_use]
    pub fn request(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// An ad request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Ad URL, sent unchanged.
    pub url: String,
    /// Send cookies with the request.
    pub with_credentials: bool,
}

/// A raw transport response.
pub struct FetchResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body, `None` if the response had none.
    pub body: Option<BodyStream>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// HTTP client boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the response with its body unread.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// A classified response whose body has not been read yet.
pub struct StreamingResponse {
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: BodyStream,
}

impl StreamingResponse {
    /// Reads the whole body into an [`AdResponse`].
    ///
    /// # Errors
    ///
    /// Returns the first body read error.
    pub async fn buffer(self) -> Result<AdResponse, TransportError> {
        let bytes = collect_body(self.body).await?;
        Ok(AdResponse {
            headers: self.headers,
            bytes,
        })
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A fully buffered ad response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdResponse {
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub bytes: Bytes,
}

/// Concatenates every chunk of a body stream.
///
/// # Errors
///
/// Returns the first chunk error.
pub async fn collect_body(mut body: BodyStream) -> Result<Bytes, TransportError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// The fetch step of the pipeline.
pub struct TransportStage<'a> {
    /// Engine configuration.
    pub engine: &'a EngineConfig,
    /// Slot configuration.
    pub slot: &'a SlotConfig,
    /// Network adapter.
    pub adapter: &'a dyn NetworkAdapter,
    /// HTTP client.
    pub transport: &'a dyn Transport,
    /// Hosting document.
    pub document: &'a dyn HostDocument,
    /// Slot host, for attributes.
    pub host: &'a dyn SlotHost,
    /// Resource hints.
    pub preconnector: &'a dyn Preconnector,
    /// Analytics sink.
    pub analytics: &'a dyn AnalyticsSink,
    /// Render state of the slot.
    pub state: &'a SharedRenderState,
}

impl TransportStage<'_> {
    /// Fetches `ad_url` and classifies the response.
    ///
    /// # Errors
    ///
    /// - [`Signal::NoContent`] when there is nothing to render.
    /// - [`Signal::IframeGet`] when the network disallows XHR.
    /// - [`Signal::NetworkFailure`] when the request failed and a GET-iframe
    ///   retry may still work.
    /// - [`PipelineError::Cancelled`] when the generation went stale.
    pub async fn run(
        &self,
        ad_url: Option<String>,
        token: &GenerationToken,
    ) -> Result<StreamingResponse, PipelineError> {
        token.check()?;
        self.state.update(|state| state.ad_url.clone_from(&ad_url));
        let Some(ad_url) = ad_url else {
            debug!(network = %self.slot.network_type, "no ad url, skipping request");
            return Err(Signal::NoContent.into());
        };
        if !self.adapter.is_xhr_allowed() {
            self.state
                .update(|state| state.render_mode = Some(RenderMode::IframeGet));
            return Err(Signal::IframeGet.into());
        }

        self.analytics
            .trigger(&self.slot.network_type, AnalyticsEvent::AdRequestStart);
        let result = self
            .transport
            .fetch(FetchRequest {
                url: ad_url.clone(),
                with_credentials: true,
            })
            .await;
        token.check()?;
        self.analytics
            .trigger(&self.slot.network_type, AnalyticsEvent::AdRequestEnd);

        let response = match result {
            Ok(response) if response.status == 200 => response,
            Ok(response) => {
                return Err(self.handle_failure(&NetworkFailure::Status(response.status), &ad_url));
            },
            Err(err) => return Err(self.handle_failure(&NetworkFailure::Transport(err), &ad_url)),
        };

        let hints = ResponseHints::from_headers(
            &response.headers,
            &self.engine.safeframe.default_version,
        );
        let body = match response.body {
            Some(body) if !hints.empty_creative => body,
            _ => {
                debug!(network = %self.slot.network_type, "empty creative response");
                return Err(Signal::NoContent.into());
            },
        };

        self.apply_hints(&response.headers, hints);
        Ok(StreamingResponse {
            headers: response.headers,
            body,
        })
    }

    fn handle_failure(&self, failure: &NetworkFailure, ad_url: &str) -> PipelineError {
        info!(network = %self.slot.network_type, %failure, "ad request failed");
        let result = self.adapter.on_network_failure(failure, ad_url);
        if result.treat_as_absent {
            return Signal::NoContent.into();
        }
        self.state.update(|state| {
            state.ad_url = if result.frame_get_disabled {
                None
            } else {
                result.ad_url.or_else(|| Some(ad_url.to_string()))
            };
        });
        Signal::NetworkFailure.into()
    }

    fn apply_hints(&self, headers: &HeaderMap, hints: ResponseHints) {
        let size = self.adapter.extract_size(headers);
        if hints.pref_neutral_enabled() {
            self.host.set_attribute(PREF_NEUTRAL_ATTRIBUTE, "");
        }

        let render_mode = hints
            .render_mode
            .or(self.slot.render_mode_override)
            .or_else(|| self.document.is_ios().then_some(RenderMode::Safeframe));
        if render_mode == Some(RenderMode::Nameframe) {
            self.preconnector
                .preload(&self.engine.safeframe.nameframe_url);
        }
        if let Some(version) = &hints.safeframe_version {
            self.preconnector
                .preload(&safeframe_path(&self.engine.safeframe.base_url, version));
        }
        self.state.update(|state| {
            if let Some(size) = size {
                state.creative_size = Some(size);
            }
            state.render_mode = render_mode;
            if let Some(version) = hints.safeframe_version {
                state.safeframe_version = version;
            }
            state.experiment_features = hints.experiment_features;
        });
    }
}
