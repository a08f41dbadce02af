//! Lifecycle analytics signals.

use std::fmt;

use serde::Serialize;
use tracing::debug;

/// Lifecycle events emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalyticsEvent {
    /// The ad request is about to be sent.
    AdRequestStart,
    /// The ad response arrived.
    AdRequestEnd,
    /// Creative validation started.
    AdResponseValidateStart,
    /// First-party rendering started.
    RenderFriendlyStart,
    /// GET-iframe rendering started.
    RenderCrossDomainStart,
    /// Safeframe or nameframe rendering started.
    RenderSafeFrameStart,
    /// The friendly embed finished its initial load.
    FriendlyIframeIniLoad,
    /// A cross-domain frame finished loading.
    CrossDomainIframeLoaded,
}

impl AnalyticsEvent {
    /// Returns the trigger name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdRequestStart => "adRequestStart",
            Self::AdRequestEnd => "adRequestEnd",
            Self::AdResponseValidateStart => "adResponseValidateStart",
            Self::RenderFriendlyStart => "renderFriendlyStart",
            Self::RenderCrossDomainStart => "renderCrossDomainStart",
            Self::RenderSafeFrameStart => "renderSafeFrameStart",
            Self::FriendlyIframeIniLoad => "friendlyIframeIniLoad",
            Self::CrossDomainIframeLoaded => "crossDomainIframeLoaded",
        }
    }
}

impl fmt::Display for AnalyticsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boundary to the analytics dispatch helper.
pub trait AnalyticsSink: Send + Sync {
    /// Triggers `event` for `network_type`.
    fn trigger(&self, network_type: &str, event: AnalyticsEvent);
}

/// Sink that records events as trace output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn trigger(&self, network_type: &str, event: AnalyticsEvent) {
        debug!(network = network_type, %event, "analytics trigger");
    }
}
