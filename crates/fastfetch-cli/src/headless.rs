//! Headless page collaborators.
//!
//! There is no DOM here: frames are recorded instead of attached, the page
//! is always visible and every viewport wait resolves at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fastfetch_core::frame::{FrameKind, FrameSpec};
use fastfetch_core::headers::CreativeSize;
use fastfetch_core::host::{HostDocument, IntersectionSnapshot, LayoutRect, PageContext};
use fastfetch_core::render::{
    EmbedHandle, EmbedInstaller, EmbedSpec, FrameId, RenderError, SlotHost,
};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

/// A frame the engine attached.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedFrame {
    pub id: u64,
    pub kind: FrameKind,
    pub width: Option<String>,
    pub height: Option<String>,
    pub src: Option<String>,
    /// Length of the `name` or `srcdoc` payload, if any.
    pub payload_bytes: Option<usize>,
    pub removed: bool,
}

/// What happened to the slot element.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostRecord {
    pub frames: Vec<RecordedFrame>,
    pub collapsed: bool,
    pub attributes: Vec<(String, String)>,
    pub resizes: Vec<CreativeSize>,
}

/// Slot element that records frames instead of attaching them.
#[derive(Debug, Default)]
pub struct HeadlessHost {
    next_id: AtomicU64,
    record: Mutex<HostRecord>,
}

impl HeadlessHost {
    pub fn record(&self) -> HostRecord {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SlotHost for HeadlessHost {
    fn attach_frame(&self, spec: FrameSpec) -> Result<FrameId, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload_bytes = spec.attr("srcdoc").or_else(|| spec.attr("name")).map(str::len);
        info!(frame = id, kind = ?spec.kind, "attach frame");
        self.lock().frames.push(RecordedFrame {
            id,
            kind: spec.kind,
            width: spec.attr("width").map(str::to_string),
            height: spec.attr("height").map(str::to_string),
            src: spec.attr("src").map(str::to_string),
            payload_bytes,
            removed: false,
        });
        Ok(FrameId(id))
    }

    fn remove_frame(&self, frame: FrameId) {
        debug!(%frame, "remove frame");
        if let Some(recorded) = self.lock().frames.iter_mut().find(|f| f.id == frame.0) {
            recorded.removed = true;
        }
    }

    async fn when_frame_loaded(&self, _frame: FrameId) {}

    async fn when_within_viewports(&self, _viewports: f64) {}

    fn force_collapse(&self) {
        info!("collapse slot");
        self.lock().collapsed = true;
    }

    fn toggle_placeholder(&self, show: bool) {
        debug!(show, "toggle placeholder");
    }

    fn require_layout_when_visible(&self) {
        debug!("re-layout requested");
    }

    fn set_attribute(&self, name: &str, value: &str) {
        self.lock()
            .attributes
            .push((name.to_string(), value.to_string()));
    }

    fn attempt_change_size(&self, size: CreativeSize) {
        self.lock().resizes.push(size);
    }
}

/// Always-visible document at a fixed URL.
#[derive(Debug, Clone)]
pub struct HeadlessDocument {
    context: PageContext,
    slot_rect: LayoutRect,
}

impl HeadlessDocument {
    pub fn new(page_url: &Url, slot_size: CreativeSize) -> Self {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        let pid = std::process::id();
        let context = PageContext {
            source_url: page_url.to_string(),
            canonical_url: page_url.to_string(),
            referrer: None,
            page_view_id: format!("{}", start_time_ms % 10_000),
            location_href: page_url.to_string(),
            source_origin: page_url.origin().ascii_serialization(),
            start_time_ms,
            sentinel: format!("0-{pid}"),
            hidden: false,
            dom_fingerprint: String::new(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            experiment_toggles: std::collections::BTreeMap::new(),
        };
        Self {
            context,
            slot_rect: LayoutRect {
                left: 0.0,
                top: 0.0,
                width: f64::from(slot_size.width),
                height: f64::from(slot_size.height),
            },
        }
    }
}

#[async_trait]
impl HostDocument for HeadlessDocument {
    async fn when_first_visible(&self) {}

    fn is_ios(&self) -> bool {
        false
    }

    fn supports_secure_frames(&self) -> bool {
        true
    }

    fn page_context(&self) -> PageContext {
        self.context.clone()
    }

    fn intersection_snapshot(&self) -> IntersectionSnapshot {
        IntersectionSnapshot {
            time: 0.0,
            root_bounds: self.slot_rect,
            bounding_client_rect: self.slot_rect,
            intersection_rect: self.slot_rect,
            intersection_ratio: 1.0,
        }
    }

    fn layout_rect(&self) -> LayoutRect {
        self.slot_rect
    }

    fn is_in_viewport(&self) -> bool {
        true
    }
}

/// Embed installer that only logs what it would install.
#[derive(Debug, Default)]
pub struct HeadlessInstaller {
    installed: Mutex<Vec<EmbedSpec>>,
}

impl HeadlessInstaller {
    pub fn installed(&self) -> Vec<EmbedSpec> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EmbedInstaller for HeadlessInstaller {
    async fn install(
        &self,
        frame: FrameId,
        spec: EmbedSpec,
    ) -> Result<Arc<dyn EmbedHandle>, RenderError> {
        info!(
            %frame,
            extensions = ?spec.extensions,
            fonts = spec.fonts.len(),
            "install friendly embed"
        );
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec);
        Ok(Arc::new(HeadlessEmbed { frame }))
    }
}

struct HeadlessEmbed {
    frame: FrameId,
}

#[async_trait]
impl EmbedHandle for HeadlessEmbed {
    fn set_visible(&self, visible: bool) {
        debug!(frame = %self.frame, visible, "embed visibility");
    }

    fn unhide_body(&self) {}

    async fn when_ini_loaded(&self) {}

    fn destroy(&self) {
        debug!(frame = %self.frame, "destroy embed");
    }
}
