//! Ad request URL resolution.
//!
//! Runs after consent and before the fetch:
//!
//! 1. wait until the hosting document has been visible once,
//! 2. optionally wait until the slot is near the viewport,
//! 3. start real-time-config callouts unless blocked,
//! 4. ask the adapter for the serve-NPA signal,
//! 5. call the adapter's URL builder.
//!
//! The generation token is checked after every suspension point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::{AdUrlContext, NetworkAdapter};
use crate::config::{SlotConfig, ViewportSetting};
use crate::consent::ConsentTuple;
use crate::error::PipelineError;
use crate::generation::GenerationToken;
use crate::host::HostDocument;
use crate::render::SlotHost;

/// Result of one RTC callout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcResponse {
    /// Callout vendor or URL.
    pub callout: String,
    /// Response payload, if the callout succeeded.
    pub response: Option<serde_json::Value>,
    /// Callout latency in milliseconds.
    pub rtc_time_ms: u64,
    /// Error description, if the callout failed.
    pub error: Option<String>,
}

/// Shared future of all RTC callout results.
///
/// Resolves to `None` if the callouts timed out or the callout task failed.
pub type RtcResponses = Shared<BoxFuture<'static, Option<Vec<RtcResponse>>>>;

/// Input to the RTC manager.
#[derive(Debug, Clone)]
pub struct RtcRequest {
    /// The slot's RTC configuration.
    pub config: serde_json::Value,
    /// Network-specific URL macros.
    pub macros: BTreeMap<String, String>,
    /// Consent snapshot.
    pub consent: ConsentTuple,
}

/// Boundary to the real-time-config subsystem.
///
/// Failures are reported per callout in [`RtcResponse::error`]; the manager
/// itself never fails.
#[async_trait]
pub trait RtcManager: Send + Sync {
    /// Runs every configured callout.
    async fn execute(&self, request: RtcRequest) -> Vec<RtcResponse>;
}

/// Geo lookup boundary.
#[async_trait]
pub trait GeoService: Send + Sync {
    /// Returns `true` if the user is in the named country group.
    async fn is_in_country_group(&self, group: &str) -> bool;
}

/// Starts the RTC callouts on the runtime and returns a shared handle.
#[must_use]
pub fn spawn_rtc(
    manager: Arc<dyn RtcManager>,
    request: RtcRequest,
    timeout: Option<Duration>,
) -> RtcResponses {
    let handle = tokio::spawn(async move { manager.execute(request).await });
    async move {
        let joined = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?timeout, "rtc callouts timed out");
                    return None;
                },
            },
            None => handle.await,
        };
        joined
            .map_err(|err| warn!(error = %err, "rtc task failed"))
            .ok()
    }
    .boxed()
    .shared()
}

/// Returns the viewport distance to wait for before requesting, if any.
#[must_use]
pub fn request_delay_viewports(slot: &SlotConfig) -> Option<f64> {
    match slot.delay_request {
        ViewportSetting::Flag(false) => None,
        ViewportSetting::Viewports(viewports) => Some(viewports),
        ViewportSetting::Flag(true) => match slot.render_outside_viewport {
            ViewportSetting::Flag(true) => None,
            ViewportSetting::Flag(false) => Some(0.0),
            ViewportSetting::Viewports(viewports) => Some(viewports),
        },
    }
}

/// Resolves the ad request URL for one generation.
pub struct RequestUrlResolver<'a> {
    /// Slot configuration.
    pub slot: &'a SlotConfig,
    /// Network adapter.
    pub adapter: &'a dyn NetworkAdapter,
    /// Hosting document.
    pub document: &'a dyn HostDocument,
    /// Slot host, for viewport waits.
    pub host: &'a dyn SlotHost,
    /// RTC manager, if RTC is available.
    pub rtc: Option<Arc<dyn RtcManager>>,
    /// Geo service, for block-RTC groups.
    pub geo: Option<&'a dyn GeoService>,
    /// RTC timeout.
    pub rtc_timeout: Option<Duration>,
}

impl RequestUrlResolver<'_> {
    /// Resolves the URL. `Ok(None)` means no request is made.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if the generation went stale and
    /// [`PipelineError::UrlBuilder`] if the adapter failed.
    pub async fn resolve(
        &self,
        consent: ConsentTuple,
        token: &GenerationToken,
    ) -> Result<Option<String>, PipelineError> {
        token.check()?;
        self.document.when_first_visible().await;
        token.check()?;

        if let Some(viewports) = request_delay_viewports(self.slot) {
            debug!(network = %self.slot.network_type, viewports, "delaying ad request");
            self.host.when_within_viewports(viewports).await;
            token.check()?;
        }

        let rtc = self.start_rtc(&consent).await;
        token.check()?;

        let serve_npa = self.adapter.serve_npa_signal().await;
        token.check()?;

        let url = self
            .adapter
            .ad_url(AdUrlContext {
                consent,
                rtc,
                serve_npa,
            })
            .await?;
        token.check()?;
        Ok(url.filter(|url| !url.is_empty()))
    }

    async fn start_rtc(&self, consent: &ConsentTuple) -> Option<RtcResponses> {
        let config = self.slot.rtc_config.as_ref()?;
        let Some(manager) = &self.rtc else {
            debug!(network = %self.slot.network_type, "rtc configured without an rtc manager");
            return None;
        };
        if let Some(geo) = self.geo {
            for group in &self.slot.block_rtc {
                if geo.is_in_country_group(group).await {
                    debug!(group, "rtc blocked for geo group");
                    return None;
                }
            }
        }
        let request = RtcRequest {
            config: config.clone(),
            macros: self.adapter.custom_rtc_macros(),
            consent: consent.clone(),
        };
        Some(spawn_rtc(Arc::clone(manager), request, self.rtc_timeout))
    }
}
