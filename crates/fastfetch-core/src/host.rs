//! Boundary to the hosting document.
//!
//! The engine never touches a DOM directly. Document-wide facts (visibility,
//! platform, page identity, geometry) come from a [`HostDocument`], and
//! resource hints go out through a [`Preconnector`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutRect {
    /// Left edge.
    pub left: f64,
    /// Top edge.
    pub top: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

/// Snapshot of the slot's intersection with the viewport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectionSnapshot {
    /// Milliseconds since page start when the snapshot was taken.
    pub time: f64,
    /// Viewport rectangle.
    pub root_bounds: LayoutRect,
    /// Slot rectangle.
    pub bounding_client_rect: LayoutRect,
    /// Visible part of the slot.
    pub intersection_rect: LayoutRect,
    /// Visible fraction of the slot.
    pub intersection_ratio: f64,
}

/// Identity of the hosting page, serialized into cross-domain frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    /// URL of the document as served.
    pub source_url: String,
    /// Canonical URL of the document.
    pub canonical_url: String,
    /// Document referrer.
    pub referrer: Option<String>,
    /// Random id identifying this page view.
    pub page_view_id: String,
    /// Current location.
    pub location_href: String,
    /// Origin used for CORS source-origin rewriting.
    pub source_origin: String,
    /// Page start time, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Per-page sentinel correlating postMessage traffic.
    pub sentinel: String,
    /// Whether the document is currently hidden.
    pub hidden: bool,
    /// Stable fingerprint of the slot's position in the DOM.
    pub dom_fingerprint: String,
    /// Runtime version string.
    pub runtime_version: String,
    /// Experiment toggles active on the page.
    pub experiment_toggles: BTreeMap<String, bool>,
}

/// Document-level collaborator.
#[async_trait]
pub trait HostDocument: Send + Sync {
    /// Resolves once the document has been visible at least once.
    async fn when_first_visible(&self);

    /// Returns `true` on iOS, where safeframe is the default render mode.
    fn is_ios(&self) -> bool;

    /// Returns `true` if the platform supports the isolation primitive the
    /// streaming validation flow requires.
    fn supports_secure_frames(&self) -> bool;

    /// Returns the page identity.
    fn page_context(&self) -> PageContext;

    /// Returns the slot's current intersection with the viewport.
    fn intersection_snapshot(&self) -> IntersectionSnapshot;

    /// Returns the slot's layout rectangle.
    fn layout_rect(&self) -> LayoutRect;

    /// Returns `true` if the slot is currently in the viewport.
    fn is_in_viewport(&self) -> bool;
}

/// Resource hint sink.
pub trait Preconnector: Send + Sync {
    /// Opens a connection to the origin of `url` ahead of use.
    fn preconnect(&self, url: &str);

    /// Preloads the resource at `url`.
    fn preload(&self, url: &str);

    /// Preloads a runtime extension by id.
    fn preload_extension(&self, extension_id: &str);
}

/// Preconnector that only logs the hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPreconnector;

impl Preconnector for LoggingPreconnector {
    fn preconnect(&self, url: &str) {
        debug!(url, "preconnect");
    }

    fn preload(&self, url: &str) {
        debug!(url, "preload");
    }

    fn preload_extension(&self, extension_id: &str) {
        debug!(extension_id, "preload extension");
    }
}
