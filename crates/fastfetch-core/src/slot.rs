//! Slot controller.
//!
//! [`AdSlot`] owns everything one ad slot needs across generations: its
//! configuration, collaborators, render state, generation tracker and the
//! shared "ad promise" of the current generation.
//!
//! # Lifecycle
//!
//! ```text
//! initiate_ad_request ──► ad promise (spawned)
//!                          ConsentPending ─► UrlPending ─► Fetching ─► Validating ─► Rendering
//! layout ───────────────► await promise ─► RenderDispatcher ─► Done
//! unlayout / detach ────► teardown (generation bumped, state reset)
//! ```
//!
//! The request half of the pipeline is an explicit [`Stage`] machine driven
//! by [`advance`]. Every transition checks the generation token at entry, so
//! a pipeline whose generation was superseded stops at the next transition
//! without touching slot state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{Instrument, debug, error, info_span, instrument};

use crate::adapter::NetworkAdapter;
use crate::analytics::{AnalyticsSink, TracingAnalytics};
use crate::config::{EngineConfig, SlotConfig, ValidationFlow};
use crate::consent::{ConsentGate, ConsentPolicyService, ConsentTuple};
use crate::error::{PipelineError, Signal};
use crate::generation::{Generation, GenerationToken, GenerationTracker};
use crate::head::HeadSanitizer;
use crate::headers::CreativeSize;
use crate::host::{HostDocument, LoggingPreconnector, Preconnector};
use crate::render::{EmbedInstaller, RenderDispatcher, RenderOutcome, SlotHost};
use crate::report::ErrorReporter;
use crate::request_url::{GeoService, RequestUrlResolver, RtcManager};
use crate::signature::SignatureVerifier;
use crate::state::{DetachedFrame, SharedRenderState, SlotRenderState, SlotSnapshot};
use crate::transport::{StreamingResponse, Transport, TransportStage};
use crate::validator::{CreativeValidator, ValidatedCreative};

/// Callback fired when a refresh cycle ends.
pub type RefreshEndCallback = Box<dyn FnOnce() + Send>;

/// Settled value of the ad promise.
#[derive(Debug, Clone)]
pub enum AdPromiseOutcome {
    /// The request half finished; `None` renders cross-domain.
    Creative(Option<Arc<ValidatedCreative>>),
    /// The generation was superseded.
    Cancelled,
}

/// Shared future of the request half of one generation.
pub type AdPromise = Shared<BoxFuture<'static, AdPromiseOutcome>>;

// =============================================================================
// Collaborators
// =============================================================================

/// Collaborators of a slot.
#[derive(Clone)]
pub struct SlotServices {
    /// Network adapter.
    pub adapter: Arc<dyn NetworkAdapter>,
    /// HTTP client.
    pub transport: Arc<dyn Transport>,
    /// Slot element.
    pub host: Arc<dyn SlotHost>,
    /// Hosting document.
    pub document: Arc<dyn HostDocument>,
    /// Friendly-embed installer.
    pub installer: Arc<dyn EmbedInstaller>,
    /// Consent policy service.
    pub consent: Option<Arc<dyn ConsentPolicyService>>,
    /// RTC manager.
    pub rtc: Option<Arc<dyn RtcManager>>,
    /// Geo service.
    pub geo: Option<Arc<dyn GeoService>>,
    /// Document-scoped signature verifier.
    pub verifier: Option<Arc<SignatureVerifier>>,
    /// Head sanitizer.
    pub sanitizer: Option<Arc<dyn HeadSanitizer>>,
    /// Resource hints.
    pub preconnector: Arc<dyn Preconnector>,
    /// Analytics sink.
    pub analytics: Arc<dyn AnalyticsSink>,
}

impl SlotServices {
    /// Creates the required collaborators; optional ones start empty and
    /// hints and analytics only go to the log.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn NetworkAdapter>,
        transport: Arc<dyn Transport>,
        host: Arc<dyn SlotHost>,
        document: Arc<dyn HostDocument>,
        installer: Arc<dyn EmbedInstaller>,
    ) -> Self {
        Self {
            adapter,
            transport,
            host,
            document,
            installer,
            consent: None,
            rtc: None,
            geo: None,
            verifier: None,
            sanitizer: None,
            preconnector: Arc::new(LoggingPreconnector),
            analytics: Arc::new(TracingAnalytics),
        }
    }

    /// Sets the consent policy service.
    #[must_use]
    pub fn with_consent(mut self, consent: Arc<dyn ConsentPolicyService>) -> Self {
        self.consent = Some(consent);
        self
    }

    /// Sets the RTC manager.
    #[must_use]
    pub fn with_rtc(mut self, rtc: Arc<dyn RtcManager>) -> Self {
        self.rtc = Some(rtc);
        self
    }

    /// Sets the geo service.
    #[must_use]
    pub fn with_geo(mut self, geo: Arc<dyn GeoService>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Sets the signature verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Sets the head sanitizer.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn HeadSanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Sets the resource hint sink.
    #[must_use]
    pub fn with_preconnector(mut self, preconnector: Arc<dyn Preconnector>) -> Self {
        self.preconnector = preconnector;
        self
    }

    /// Sets the analytics sink.
    #[must_use]
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }
}

// =============================================================================
// Stage Machine
// =============================================================================

/// Position of one generation in the pipeline.
pub enum Stage {
    /// Consent has not been resolved.
    ConsentPending,
    /// Waiting for the ad URL.
    UrlPending(ConsentTuple),
    /// Fetching the ad URL (`None`: no request).
    Fetching(Option<String>),
    /// Validating the response.
    Validating(StreamingResponse),
    /// Ready to render; `None` renders cross-domain.
    Rendering(Option<ValidatedCreative>),
    /// Rendered.
    Done,
    /// The generation was superseded.
    Cancelled,
    /// The generation failed.
    Failed(PipelineError),
}

impl Stage {
    /// Returns the stage name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConsentPending => "consent_pending",
            Self::UrlPending(_) => "url_pending",
            Self::Fetching(_) => "fetching",
            Self::Validating(_) => "validating",
            Self::Rendering(_) => "rendering",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    /// Returns `true` while [`advance`] still has work to do.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::ConsentPending | Self::UrlPending(_) | Self::Fetching(_) | Self::Validating(_)
        )
    }

    fn from_result<T>(result: Result<T, PipelineError>, next: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => next(value),
            Err(err) if err.is_cancellation() => Self::Cancelled,
            Err(err) => Self::Failed(err),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Runs one transition of the request half.
///
/// Terminal stages are returned unchanged.
pub async fn advance(slot: &AdSlot, stage: Stage, token: &GenerationToken) -> Stage {
    let inner = slot.inner.as_ref();
    if stage.is_pending() && !token.is_current() {
        return Stage::Cancelled;
    }
    match stage {
        Stage::ConsentPending => {
            let gate = ConsentGate::new(inner.services.consent.as_deref());
            let consent = gate
                .resolve(inner.slot.consent_policy.as_deref(), token)
                .await;
            Stage::from_result(consent, Stage::UrlPending)
        },
        Stage::UrlPending(consent) => {
            let resolver = RequestUrlResolver {
                slot: &inner.slot,
                adapter: inner.services.adapter.as_ref(),
                document: inner.services.document.as_ref(),
                host: inner.services.host.as_ref(),
                rtc: inner.services.rtc.clone(),
                geo: inner.services.geo.as_deref(),
                rtc_timeout: inner.engine.rtc_timeout(),
            };
            Stage::from_result(resolver.resolve(consent, token).await, Stage::Fetching)
        },
        Stage::Fetching(ad_url) => {
            let stage = TransportStage {
                engine: &inner.engine,
                slot: &inner.slot,
                adapter: inner.services.adapter.as_ref(),
                transport: inner.services.transport.as_ref(),
                document: inner.services.document.as_ref(),
                host: inner.services.host.as_ref(),
                preconnector: inner.services.preconnector.as_ref(),
                analytics: inner.services.analytics.as_ref(),
                state: &inner.state,
            };
            Stage::from_result(stage.run(ad_url, token).await, Stage::Validating)
        },
        Stage::Validating(response) => {
            let validator = CreativeValidator {
                engine: &inner.engine,
                slot: &inner.slot,
                adapter: inner.services.adapter.as_ref(),
                document: inner.services.document.as_ref(),
                verifier: inner.services.verifier.as_deref(),
                sanitizer: inner.services.sanitizer.as_deref(),
                preconnector: inner.services.preconnector.as_ref(),
                analytics: inner.services.analytics.as_ref(),
            };
            let output = validator.validate(response, token).await;
            Stage::from_result(output, |output| {
                if token.is_current() {
                    inner
                        .state
                        .update(|state| state.creative_body = Some(output.body));
                    Stage::Rendering(output.creative)
                } else {
                    Stage::Cancelled
                }
            })
        },
        terminal => terminal,
    }
}

// =============================================================================
// AdSlot
// =============================================================================

struct PendingAd {
    generation: Generation,
    promise: AdPromise,
}

struct SlotInner {
    engine: EngineConfig,
    slot: SlotConfig,
    services: SlotServices,
    state: SharedRenderState,
    tracker: GenerationTracker,
    reporter: ErrorReporter,
    pending: Mutex<Option<PendingAd>>,
    refresh_end: Mutex<Option<RefreshEndCallback>>,
}

/// One ad slot.
#[derive(Clone)]
pub struct AdSlot {
    inner: Arc<SlotInner>,
}

impl fmt::Debug for AdSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdSlot")
            .field("network_type", &self.inner.slot.network_type)
            .field("generation", &self.inner.tracker.current())
            .field("state", &self.inner.state.snapshot())
            .finish()
    }
}

impl AdSlot {
    /// Creates a slot.
    #[must_use]
    pub fn new(engine: EngineConfig, slot: SlotConfig, services: SlotServices) -> Self {
        let reporter = ErrorReporter::new(slot.network_type.clone(), &engine);
        Self::with_reporter(engine, slot, services, reporter)
    }

    /// Creates a slot with an explicit error reporter.
    #[must_use]
    pub fn with_reporter(
        engine: EngineConfig,
        slot: SlotConfig,
        services: SlotServices,
        reporter: ErrorReporter,
    ) -> Self {
        let state = SharedRenderState::new(SlotRenderState::new(
            engine.safeframe.default_version.clone(),
        ));
        Self {
            inner: Arc::new(SlotInner {
                engine,
                slot,
                services,
                state,
                tracker: GenerationTracker::new(),
                reporter,
                pending: Mutex::new(None),
                refresh_end: Mutex::new(None),
            }),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn engine(&self) -> &EngineConfig {
        &self.inner.engine
    }

    /// Slot configuration.
    #[must_use]
    pub fn config(&self) -> &SlotConfig {
        &self.inner.slot
    }

    /// Latest generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.tracker.current()
    }

    /// Current render state.
    #[must_use]
    pub fn snapshot(&self) -> SlotSnapshot {
        self.inner.state.snapshot()
    }

    /// Returns `true` if the slot is configured well enough to request.
    #[must_use]
    pub fn should_initialize(&self) -> bool {
        self.inner.slot.has_layout_size()
            && self.inner.services.adapter.is_valid_element(&self.inner.slot)
    }

    /// Starts a new generation and its ad request.
    ///
    /// Returns `false` if a request is already pending or the slot should not
    /// initialize. Must be called from within a tokio runtime.
    pub fn initiate_ad_request(&self) -> bool {
        let mut pending = lock(&self.inner.pending);
        if pending.is_some() || !self.should_initialize() {
            return false;
        }
        let token = self.inner.tracker.start();
        let generation = token.generation();

        if self.inner.engine.flow == ValidationFlow::Signed
            && !self.inner.slot.is_unsigned_test_creative()
        {
            if let Some(verifier) = self.inner.services.verifier.clone() {
                tokio::spawn(async move { verifier.load_keysets().await });
            }
        }
        for url in self.inner.services.adapter.preconnect_urls() {
            self.inner.services.preconnector.preconnect(&url);
        }

        let span = info_span!(
            "ad_pipeline",
            network = %self.inner.slot.network_type,
            generation
        );
        let slot = self.clone();
        let handle = tokio::spawn(async move { slot.run_pipeline(token).await }.instrument(span));
        let promise = async move {
            handle.await.unwrap_or_else(|err| {
                error!(error = %err, "ad pipeline task failed");
                AdPromiseOutcome::Cancelled
            })
        }
        .boxed()
        .shared();

        *pending = Some(PendingAd {
            generation,
            promise,
        });
        true
    }

    async fn run_pipeline(&self, token: GenerationToken) -> AdPromiseOutcome {
        let mut stage = Stage::ConsentPending;
        while stage.is_pending() {
            let from = stage.name();
            stage = advance(self, stage, &token).await;
            debug!(from, to = stage.name(), "stage transition");
        }
        match stage {
            Stage::Rendering(creative) => AdPromiseOutcome::Creative(creative.map(Arc::new)),
            Stage::Failed(err) => self.handle_pipeline_error(&err, &token),
            Stage::Cancelled | Stage::Done => AdPromiseOutcome::Cancelled,
            pending => {
                error!(stage = pending.name(), "pipeline stopped in a pending stage");
                AdPromiseOutcome::Cancelled
            },
        }
    }

    fn handle_pipeline_error(&self, err: &PipelineError, token: &GenerationToken) -> AdPromiseOutcome {
        if !token.is_current() {
            return AdPromiseOutcome::Cancelled;
        }
        match err.signal() {
            Some(Signal::NoContent) => {
                debug!("no content, collapsing");
                self.force_collapse();
            },
            Some(signal @ (Signal::NetworkFailure | Signal::IframeGet)) => {
                debug!(%signal, "falling back to a GET iframe");
            },
            None => {
                let ad_url = self.inner.state.read(|state| state.ad_url.clone());
                self.inner.reporter.report(err, ad_url.as_deref());
                if matches!(err, PipelineError::InvalidSpsaResponse { .. }) {
                    self.force_collapse();
                }
            },
        }
        AdPromiseOutcome::Creative(None)
    }

    /// Renders the outcome of the pending generation.
    ///
    /// Starts the ad request if none is pending. While refreshing, the held
    /// creative is destroyed first and the refresh ends once the new one is
    /// rendered.
    #[instrument(skip(self), fields(network = %self.inner.slot.network_type))]
    pub async fn layout(&self) -> RenderOutcome {
        let refreshing = self.inner.state.read(|state| state.is_refreshing);
        if refreshing {
            let detached = self.inner.state.update(|state| state.take_frame(true));
            self.release(detached);
        }

        let pending = match self.pending() {
            Some(pending) => Some(pending),
            None if self.initiate_ad_request() => self.pending(),
            None => None,
        };
        let Some((generation, promise)) = pending else {
            return RenderOutcome::Failed("ad request not started".to_string());
        };

        let outcome = match promise.await {
            AdPromiseOutcome::Cancelled => RenderOutcome::Cancelled,
            AdPromiseOutcome::Creative(creative) => {
                let token = self.inner.tracker.check_still_current(generation);
                self.dispatch(creative, &token).await
            },
        };
        if outcome == RenderOutcome::Cancelled {
            return outcome;
        }

        let was_refreshing = self
            .inner
            .state
            .update(|state| std::mem::take(&mut state.is_refreshing));
        if was_refreshing {
            self.inner.services.host.toggle_placeholder(false);
        }
        if let Some(callback) = lock(&self.inner.refresh_end).take() {
            callback();
        }
        outcome
    }

    async fn dispatch(
        &self,
        creative: Option<Arc<ValidatedCreative>>,
        token: &GenerationToken,
    ) -> RenderOutcome {
        let inner = self.inner.as_ref();
        let dispatcher = RenderDispatcher {
            engine: &inner.engine,
            slot: &inner.slot,
            adapter: inner.services.adapter.as_ref(),
            document: inner.services.document.as_ref(),
            host: inner.services.host.as_ref(),
            installer: inner.services.installer.as_ref(),
            analytics: Arc::clone(&inner.services.analytics),
            state: &inner.state,
            reporter: &inner.reporter,
        };
        match dispatcher.dispatch(creative, token).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancellation() => RenderOutcome::Cancelled,
            Err(err) => {
                let ad_url = inner.state.read(|state| state.ad_url.clone());
                inner.reporter.report(&err, ad_url.as_deref());
                RenderOutcome::Failed(err.to_string())
            },
        }
    }

    /// Tears the slot down after it left the layout.
    pub fn unlayout(&self) {
        self.teardown_slot();
    }

    /// Tears the slot down after it was removed from the document.
    pub fn detach(&self) {
        self.teardown_slot();
        let detached = self.inner.state.update(|state| {
            state.is_refreshing = false;
            state.take_frame(true)
        });
        self.release(detached);
        lock(&self.inner.refresh_end).take();
    }

    /// Resets the slot for a new generation.
    ///
    /// Outstanding stages become stale. While refreshing the current frame
    /// is held.
    pub fn teardown_slot(&self) {
        let generation = self.inner.tracker.invalidate();
        let default_version = self.inner.engine.safeframe.default_version.clone();
        let (original_size, detached) = self.inner.state.update(|state| {
            let original_size = state.original_size.take();
            let detached = state.take_frame(false);
            state.render_mode = None;
            state.experiment_features.clear();
            state.ad_url = None;
            state.creative_body = None;
            state.creative_size = None;
            state.safeframe_version = default_version;
            state.is_verified_amp_creative = false;
            state.is_collapsed = false;
            (original_size, detached)
        });
        if let Some(size) = original_size {
            self.inner.services.host.attempt_change_size(size);
        }
        self.release(detached);
        lock(&self.inner.pending).take();
        debug!(network = %self.inner.slot.network_type, generation, "slot torn down");
    }

    /// Collapses the slot, or keeps the old creative during a refresh.
    pub fn force_collapse(&self) {
        let slot_size = self.inner.slot.size();
        let collapsed = self.inner.state.update(|state| {
            if state.is_refreshing {
                state.is_refreshing = false;
                return false;
            }
            state.original_size.get_or_insert(slot_size);
            state.is_collapsed = true;
            true
        });
        if collapsed {
            self.inner.services.host.force_collapse();
        } else {
            debug!(network = %self.inner.slot.network_type, "keeping old creative");
        }
    }

    /// Asks the host to resize the slot, remembering the original size.
    pub fn attempt_change_size(&self, size: CreativeSize) {
        let slot_size = self.inner.slot.size();
        self.inner.state.update(|state| {
            state.original_size.get_or_insert(slot_size);
        });
        self.inner.services.host.attempt_change_size(size);
    }

    // -------------------------------------------------------------------------
    // Refresh support
    // -------------------------------------------------------------------------

    pub(crate) fn pending(&self) -> Option<(Generation, AdPromise)> {
        lock(&self.inner.pending)
            .as_ref()
            .map(|pending| (pending.generation, pending.promise.clone()))
    }

    /// Sets the refreshing flag; returns `false` if it was already set.
    pub(crate) fn begin_refresh(&self) -> bool {
        self.inner
            .state
            .update(|state| !std::mem::replace(&mut state.is_refreshing, true))
    }

    pub(crate) fn end_refresh(&self) {
        self.inner.state.update(|state| state.is_refreshing = false);
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        self.inner.state.read(|state| state.is_refreshing)
    }

    pub(crate) fn store_refresh_end(&self, callback: RefreshEndCallback) {
        *lock(&self.inner.refresh_end) = Some(callback);
    }

    pub(crate) fn host(&self) -> &dyn SlotHost {
        self.inner.services.host.as_ref()
    }

    fn release(&self, detached: Option<DetachedFrame>) {
        let Some(detached) = detached else {
            return;
        };
        if let Some(embed) = detached.embed {
            embed.destroy();
        }
        if let Some(frame) = detached.frame {
            self.inner.services.host.remove_frame(frame);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
