//! Render dispatch.
//!
//! Exactly one strategy renders a creative:
//!
//! 1. a collapsed slot renders nothing,
//! 2. a slot that already shows a frame (outside a refresh) is left alone,
//! 3. a creative that failed validation renders cross-domain,
//! 4. a validated creative renders first-party, falling back to cross-domain
//!    if that fails.
//!
//! The previous frame is always destroyed before a new one is attached.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::NetworkAdapter;
use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::config::{EngineConfig, SlotConfig};
use crate::error::PipelineError;
use crate::frame::{FrameBuilder, FrameKind, FrameSpec};
use crate::generation::GenerationToken;
use crate::headers::{CreativeSize, RenderMode};
use crate::host::HostDocument;
use crate::report::ErrorReporter;
use crate::state::SharedRenderState;
use crate::validator::ValidatedCreative;

// =============================================================================
// Host Boundary
// =============================================================================

/// Handle to a frame attached by the slot host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame-{}", self.0)
    }
}

/// Errors from rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The host could not attach the frame.
    #[error("failed to attach frame: {0}")]
    Attach(String),

    /// The friendly embed could not be installed.
    #[error("failed to install embed: {0}")]
    Install(String),

    /// The ad URL is not a valid URL.
    #[error("invalid ad url: {0}")]
    InvalidUrl(String),

    /// The ad URL already carries the source origin parameter.
    #[error("Source origin is not allowed in ad url")]
    SourceOriginPresent,
}

/// The slot element as seen by the engine.
#[async_trait]
pub trait SlotHost: Send + Sync {
    /// Attaches a frame to the slot.
    fn attach_frame(&self, spec: FrameSpec) -> Result<FrameId, RenderError>;

    /// Removes a frame.
    fn remove_frame(&self, frame: FrameId);

    /// Resolves when the frame has loaded.
    async fn when_frame_loaded(&self, frame: FrameId);

    /// Resolves when the slot is within `viewports` viewports of the
    /// visible area.
    async fn when_within_viewports(&self, viewports: f64);

    /// Collapses the slot.
    fn force_collapse(&self);

    /// Shows or hides the loading placeholder.
    fn toggle_placeholder(&self, show: bool);

    /// Schedules a forced re-layout once the page is visible.
    fn require_layout_when_visible(&self);

    /// Sets an attribute on the slot element.
    fn set_attribute(&self, name: &str, value: &str);

    /// Asks the layout system to resize the slot.
    fn attempt_change_size(&self, size: CreativeSize);
}

/// What the friendly embed installs into a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedSpec {
    /// URL of the hosting page.
    pub host_url: String,
    /// Creative markup.
    pub html: String,
    /// Runtime extensions to install.
    pub extensions: Vec<String>,
    /// Font stylesheets to install.
    pub fonts: Vec<String>,
    /// The markup is a full document and must not be merged into a
    /// skeleton.
    pub skip_html_merge: bool,
}

/// A live friendly embed.
#[async_trait]
pub trait EmbedHandle: Send + Sync {
    /// Marks the embed visible or hidden.
    fn set_visible(&self, visible: bool);

    /// Reveals the creative body.
    fn unhide_body(&self);

    /// Resolves when the initial resources have loaded.
    async fn when_ini_loaded(&self);

    /// Destroys the embed.
    fn destroy(&self);
}

/// Boundary to the friendly-embed installer.
#[async_trait]
pub trait EmbedInstaller: Send + Sync {
    /// Installs an embed into an attached frame.
    async fn install(
        &self,
        frame: FrameId,
        spec: EmbedSpec,
    ) -> Result<Arc<dyn EmbedHandle>, RenderError>;
}

/// How a layout ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RenderOutcome {
    /// Rendered first-party.
    FirstParty(FrameKind),
    /// Rendered cross-domain.
    CrossDomain(RenderMode),
    /// The slot is collapsed.
    Collapsed,
    /// A frame is already attached.
    AlreadyRendered,
    /// Nothing could be rendered.
    Failed(String),
    /// The generation went stale.
    Cancelled,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Renders the outcome of one generation.
pub struct RenderDispatcher<'a> {
    /// Engine configuration.
    pub engine: &'a EngineConfig,
    /// Slot configuration.
    pub slot: &'a SlotConfig,
    /// Network adapter.
    pub adapter: &'a dyn NetworkAdapter,
    /// Hosting document.
    pub document: &'a dyn HostDocument,
    /// Slot host.
    pub host: &'a dyn SlotHost,
    /// Friendly-embed installer.
    pub installer: &'a dyn EmbedInstaller,
    /// Analytics sink, shared with the ini-load task.
    pub analytics: Arc<dyn AnalyticsSink>,
    /// Render state.
    pub state: &'a SharedRenderState,
    /// Error reporter.
    pub reporter: &'a ErrorReporter,
}

impl RenderDispatcher<'_> {
    /// Renders `creative`, or the retained body when it is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if the generation went stale.
    pub async fn dispatch(
        &self,
        creative: Option<Arc<ValidatedCreative>>,
        token: &GenerationToken,
    ) -> Result<RenderOutcome, PipelineError> {
        token.check()?;
        let (collapsed, has_frame, refreshing, ad_url) = self.state.read(|state| {
            (
                state.is_collapsed,
                state.active_frame.is_some(),
                state.is_refreshing,
                state.ad_url.clone(),
            )
        });
        if collapsed {
            return Ok(RenderOutcome::Collapsed);
        }
        if has_frame && !refreshing {
            self.reporter.report(
                &PipelineError::internal("iframe already exists"),
                ad_url.as_deref(),
            );
            return Ok(RenderOutcome::AlreadyRendered);
        }

        let Some(creative) = creative else {
            return self.render_cross_domain(token).await;
        };
        match self.render_first_party(&creative, token).await {
            Ok(kind) => Ok(RenderOutcome::FirstParty(kind)),
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                warn!(network = %self.slot.network_type, error = %err, "first-party render failed");
                self.reporter.report(&err, ad_url.as_deref());
                self.render_cross_domain(token).await
            },
        }
    }

    async fn render_first_party(
        &self,
        creative: &ValidatedCreative,
        token: &GenerationToken,
    ) -> Result<FrameKind, PipelineError> {
        self.analytics
            .trigger(&self.slot.network_type, AnalyticsEvent::RenderFriendlyStart);
        let builder = self.frame_builder();
        let host_url = self.document.page_context().source_url;
        let (spec, embed) = match creative {
            ValidatedCreative::Signed(metadata) => (
                builder.friendly(),
                EmbedSpec {
                    host_url,
                    html: metadata.minified_creative.clone(),
                    extensions: metadata.extension_ids(),
                    fonts: metadata.font_urls(),
                    skip_html_merge: false,
                },
            ),
            ValidatedCreative::Trustless { head, body } => {
                let body = String::from_utf8_lossy(body);
                (
                    builder.secure(&head.head, &body),
                    EmbedSpec {
                        host_url,
                        html: body.into_owned(),
                        extensions: head.extensions.iter().map(|ext| ext.id.clone()).collect(),
                        fonts: head.fonts.clone(),
                        skip_html_merge: true,
                    },
                )
            },
        };

        let kind = spec.kind;
        let frame = self.attach(spec)?;
        let handle = self.installer.install(frame, embed).await?;
        if let Err(err) = token.check() {
            handle.destroy();
            return Err(err);
        }

        self.state.update(|state| {
            state.embed = Some(Arc::clone(&handle));
            state.is_first_party = true;
            state.is_verified_amp_creative = true;
        });
        handle.set_visible(self.document.is_in_viewport());
        handle.unhide_body();
        if let Err(err) = self.adapter.on_creative_render(creative.metadata()) {
            warn!(network = %self.slot.network_type, error = %err, "creative render hook failed");
        }

        let analytics = Arc::clone(&self.analytics);
        let network_type = self.slot.network_type.clone();
        let token = token.clone();
        tokio::spawn(async move {
            handle.when_ini_loaded().await;
            if token.is_current() {
                analytics.trigger(&network_type, AnalyticsEvent::FriendlyIframeIniLoad);
            }
        });
        Ok(kind)
    }

    async fn render_cross_domain(
        &self,
        token: &GenerationToken,
    ) -> Result<RenderOutcome, PipelineError> {
        if self.slot.cross_domain_fallback_disabled() {
            warn!(network = %self.slot.network_type, "cross-domain fallback disabled");
            return Ok(RenderOutcome::Failed(
                "cross-domain fallback disabled".to_string(),
            ));
        }

        let (render_mode, body, ad_url, version) = self.state.read(|state| {
            (
                state.render_mode,
                state.creative_body.clone(),
                state.ad_url.clone(),
                state.safeframe_version.clone(),
            )
        });
        let builder = self.frame_builder();
        let (spec, mode) = match (render_mode, body, ad_url) {
            (Some(mode), Some(body), _) if mode.uses_name_attribute() => {
                self.analytics
                    .trigger(&self.slot.network_type, AnalyticsEvent::RenderSafeFrameStart);
                let creative = String::from_utf8_lossy(&body);
                let spec = if mode == RenderMode::Safeframe {
                    builder.safeframe(&version, &creative)
                } else {
                    builder.nameframe(&creative)
                };
                self.state.update(|state| state.creative_body = None);
                (spec, mode)
            },
            (_, _, Some(ad_url)) => {
                self.analytics
                    .trigger(&self.slot.network_type, AnalyticsEvent::RenderCrossDomainStart);
                (builder.iframe_get(&ad_url)?, RenderMode::IframeGet)
            },
            _ => {
                warn!(network = %self.slot.network_type, "No creative or URL available -- can't render");
                return Ok(RenderOutcome::Failed(
                    "no creative or url available".to_string(),
                ));
            },
        };

        let frame = self.attach(spec)?;
        self.host.when_frame_loaded(frame).await;
        token.check()?;
        self.analytics
            .trigger(&self.slot.network_type, AnalyticsEvent::CrossDomainIframeLoaded);
        if let Err(err) = self.adapter.on_creative_render(None) {
            debug!(network = %self.slot.network_type, error = %err, "creative render hook failed");
        }
        Ok(RenderOutcome::CrossDomain(mode))
    }

    /// Destroys the current frame, then attaches `spec`.
    fn attach(&self, spec: FrameSpec) -> Result<FrameId, RenderError> {
        if let Some(detached) = self.state.update(|state| state.take_frame(true)) {
            if let Some(embed) = detached.embed {
                embed.destroy();
            }
            if let Some(frame) = detached.frame {
                self.host.remove_frame(frame);
            }
        }
        let kind = spec.kind;
        let frame = self.host.attach_frame(spec)?;
        debug!(network = %self.slot.network_type, %frame, ?kind, "attached frame");
        self.state
            .update(|state| state.active_frame = Some((frame, kind)));
        Ok(frame)
    }

    fn frame_builder(&self) -> FrameBuilder<'_> {
        let size = self
            .state
            .read(|state| state.creative_size)
            .unwrap_or_else(|| self.slot.size());
        FrameBuilder {
            engine: self.engine,
            slot: self.slot,
            document: self.document,
            adapter: self.adapter,
            size,
        }
    }
}
