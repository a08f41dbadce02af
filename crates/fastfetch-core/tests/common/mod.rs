//! Shared fakes for the slot integration tests.
//!
//! Every collaborator records what the engine asked of it so tests can
//! assert on host effects (frames attached and removed, collapses,
//! placeholder toggles) without a real page.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use bytes::Bytes;
use ed25519_dalek::{Signer as _, SigningKey};
use fastfetch_core::adapter::{
    AdUrlContext, AdapterError, NetworkAdapter, NetworkFailure, NetworkFailureResult,
};
use fastfetch_core::analytics::{AnalyticsEvent, AnalyticsSink};
use fastfetch_core::config::{EngineConfig, SigningServiceConfig, SlotConfig, VerifierConfig};
use fastfetch_core::frame::FrameSpec;
use fastfetch_core::headers::{CreativeSize, SIGNATURE_HEADER};
use fastfetch_core::host::{HostDocument, IntersectionSnapshot, LayoutRect, PageContext};
use fastfetch_core::metadata::CreativeMetadata;
use fastfetch_core::render::{
    EmbedHandle, EmbedInstaller, EmbedSpec, FrameId, RenderError, SlotHost,
};
use fastfetch_core::request_url::{GeoService, RtcManager, RtcRequest, RtcResponse};
use fastfetch_core::signature::{KeysetFetcher, SignatureVerifier, VerifierError};
use fastfetch_core::transport::{FetchRequest, FetchResponse, Transport, TransportError};
use fastfetch_core::{AdSlot, DefaultNetworkAdapter, SlotServices};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Ad URL requested by every test slot.
pub const AD_URL: &str = "https://ads.example/serve?slot=1";

/// Signing service name used by the test keysets.
pub const SIGNING_SERVICE: &str = "google";

const RUNTIME: &str = "<script async src=\"https://cdn.ampproject.org/amp4ads-v0.js\"></script>";

// =============================================================================
// Slot Host
// =============================================================================

#[derive(Debug, Default)]
pub struct HostLog {
    next_id: u64,
    pub live: Vec<FrameId>,
    pub attached: Vec<FrameSpec>,
    pub removed: Vec<FrameId>,
    pub max_live: usize,
    pub collapses: usize,
    pub placeholder: Vec<bool>,
    pub layout_requests: usize,
    pub attributes: BTreeMap<String, String>,
    pub resizes: Vec<CreativeSize>,
}

/// Slot element that records every call.
#[derive(Debug, Default)]
pub struct RecordingHost {
    log: Mutex<HostLog>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&HostLog) -> R) -> R {
        f(&self.log.lock().unwrap())
    }

    pub fn live_frames(&self) -> usize {
        self.with_log(|log| log.live.len())
    }

    pub fn max_live_frames(&self) -> usize {
        self.with_log(|log| log.max_live)
    }

    pub fn collapses(&self) -> usize {
        self.with_log(|log| log.collapses)
    }

    pub fn last_attached(&self) -> Option<FrameSpec> {
        self.with_log(|log| log.attached.last().cloned())
    }
}

#[async_trait]
impl SlotHost for RecordingHost {
    fn attach_frame(&self, spec: FrameSpec) -> Result<FrameId, RenderError> {
        let mut log = self.log.lock().unwrap();
        log.next_id += 1;
        let frame = FrameId(log.next_id);
        log.live.push(frame);
        log.max_live = log.max_live.max(log.live.len());
        log.attached.push(spec);
        Ok(frame)
    }

    fn remove_frame(&self, frame: FrameId) {
        let mut log = self.log.lock().unwrap();
        log.live.retain(|live| *live != frame);
        log.removed.push(frame);
    }

    async fn when_frame_loaded(&self, _frame: FrameId) {}

    async fn when_within_viewports(&self, _viewports: f64) {}

    fn force_collapse(&self) {
        self.log.lock().unwrap().collapses += 1;
    }

    fn toggle_placeholder(&self, show: bool) {
        self.log.lock().unwrap().placeholder.push(show);
    }

    fn require_layout_when_visible(&self) {
        self.log.lock().unwrap().layout_requests += 1;
    }

    fn set_attribute(&self, name: &str, value: &str) {
        self.log
            .lock()
            .unwrap()
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    fn attempt_change_size(&self, size: CreativeSize) {
        self.log.lock().unwrap().resizes.push(size);
    }
}

// =============================================================================
// Transport
// =============================================================================

/// One scripted reply.
pub enum Scripted {
    Response {
        status: u16,
        headers: HeaderMap,
        chunks: Option<Vec<Bytes>>,
        delay: Duration,
    },
    Error(String),
}

impl Scripted {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_headers(body, &[])
    }

    pub fn with_headers(body: impl Into<String>, headers: &[(&str, &str)]) -> Self {
        Self::Response {
            status: 200,
            headers: header_map(headers),
            chunks: Some(vec![Bytes::from(body.into())]),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Response {
            status,
            headers: HeaderMap::new(),
            chunks: None,
            delay: Duration::ZERO,
        }
    }

    /// Splits the body into chunks of `size` bytes.
    #[must_use]
    pub fn chunked(self, size: usize) -> Self {
        match self {
            Self::Response {
                status,
                headers,
                chunks,
                delay,
            } => {
                let joined: Vec<u8> = chunks.unwrap_or_default().concat();
                let chunks = joined
                    .chunks(size)
                    .map(Bytes::copy_from_slice)
                    .collect();
                Self::Response {
                    status,
                    headers,
                    chunks: Some(chunks),
                    delay,
                }
            },
            error => error,
        }
    }

    #[must_use]
    pub fn delayed(self, by: Duration) -> Self {
        match self {
            Self::Response {
                status,
                headers,
                chunks,
                ..
            } => Self::Response {
                status,
                headers,
                chunks,
                delay: by,
            },
            error => error,
        }
    }
}

pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    headers
}

/// Transport serving scripted replies in order.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Scripted) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Scripted::Response {
                status,
                headers,
                chunks,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let body = chunks.map(|chunks| {
                    let stream: fastfetch_core::transport::BodyStream =
                        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
                    stream
                });
                Ok(FetchResponse {
                    status,
                    headers,
                    body,
                })
            },
            Some(Scripted::Error(reason)) => Err(TransportError::request(url, reason)),
            None => Err(TransportError::request(url, "no scripted reply")),
        }
    }
}

// =============================================================================
// Embeds
// =============================================================================

#[derive(Debug, Default)]
pub struct RecordingEmbed {
    pub visible: AtomicBool,
    pub unhidden: AtomicBool,
    pub destroyed: AtomicBool,
}

impl RecordingEmbed {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbedHandle for RecordingEmbed {
    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    fn unhide_body(&self) {
        self.unhidden.store(true, Ordering::SeqCst);
    }

    async fn when_ini_loaded(&self) {}

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Installer that hands out [`RecordingEmbed`]s.
#[derive(Default)]
pub struct RecordingInstaller {
    pub installs: Mutex<Vec<(FrameId, EmbedSpec, Arc<RecordingEmbed>)>>,
}

impl RecordingInstaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn embeds(&self) -> Vec<Arc<RecordingEmbed>> {
        self.installs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, embed)| Arc::clone(embed))
            .collect()
    }

    pub fn last_spec(&self) -> Option<EmbedSpec> {
        self.installs
            .lock()
            .unwrap()
            .last()
            .map(|(_, spec, _)| spec.clone())
    }
}

#[async_trait]
impl EmbedInstaller for RecordingInstaller {
    async fn install(
        &self,
        frame: FrameId,
        spec: EmbedSpec,
    ) -> Result<Arc<dyn EmbedHandle>, RenderError> {
        let embed = Arc::new(RecordingEmbed::default());
        self.installs
            .lock()
            .unwrap()
            .push((frame, spec, Arc::clone(&embed)));
        Ok(embed)
    }
}

// =============================================================================
// Document, Analytics, Keysets
// =============================================================================

/// Always-visible desktop document.
#[derive(Debug, Clone, Default)]
pub struct StaticDocument {
    pub ios: bool,
    pub secure_frames: bool,
}

#[async_trait]
impl HostDocument for StaticDocument {
    async fn when_first_visible(&self) {}

    fn is_ios(&self) -> bool {
        self.ios
    }

    fn supports_secure_frames(&self) -> bool {
        self.secure_frames
    }

    fn page_context(&self) -> PageContext {
        PageContext {
            source_url: "https://publisher.example/article".to_string(),
            canonical_url: "https://publisher.example/article".to_string(),
            page_view_id: "4242".to_string(),
            location_href: "https://publisher.example/article".to_string(),
            source_origin: "https://publisher.example".to_string(),
            sentinel: "0-1234".to_string(),
            ..PageContext::default()
        }
    }

    fn intersection_snapshot(&self) -> IntersectionSnapshot {
        IntersectionSnapshot::default()
    }

    fn layout_rect(&self) -> LayoutRect {
        LayoutRect::default()
    }

    fn is_in_viewport(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct RecordingAnalytics {
    pub events: Mutex<Vec<AnalyticsEvent>>,
}

impl RecordingAnalytics {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn trigger(&self, _network_type: &str, event: AnalyticsEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Keyset fetcher serving one JWK set.
pub struct StaticKeysetFetcher {
    document: Vec<u8>,
}

impl StaticKeysetFetcher {
    pub fn new(kid: &str, key: &SigningKey) -> Arc<Self> {
        let document = serde_json::to_vec(&serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "kid": kid,
                "x": URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
            }]
        }))
        .unwrap();
        Arc::new(Self { document })
    }
}

#[async_trait]
impl KeysetFetcher for StaticKeysetFetcher {
    async fn fetch_keyset(
        &self,
        _service: &SigningServiceConfig,
    ) -> Result<Vec<u8>, VerifierError> {
        Ok(self.document.clone())
    }
}

pub fn verifier_config() -> VerifierConfig {
    VerifierConfig {
        crypto_available: true,
        signing_services: vec![SigningServiceConfig {
            name: SIGNING_SERVICE.to_string(),
            keyset_url: "https://signing.example/keyset.json".to_string(),
        }],
    }
}

/// Value of the signature header for `creative`.
pub fn signature_header(kid: &str, key: &SigningKey, creative: &str) -> String {
    let signature = STANDARD.encode(key.sign(creative.as_bytes()).to_bytes());
    format!("{SIGNING_SERVICE}:{kid}:{signature}")
}

/// A signed-format creative carrying a metadata block.
///
/// `extra_metadata` is spliced into the metadata object, e.g.
/// `"ctaType":"SHOP",`.
pub fn signed_creative(body: &str, extra_metadata: &str) -> String {
    let prefix = "<html ⚡4ads><head>";
    let start = prefix.encode_utf16().count();
    let end = start + RUNTIME.encode_utf16().count();
    format!(
        "{prefix}{RUNTIME}<style amp-custom>p{{}}</style></head><body>{body}</body>\
         <script type=\"application/json\" amp-ad-metadata>\
         {{{extra_metadata}\"ampRuntimeUtf16CharOffsets\":[{start},{end}],\
         \"customElementExtensions\":[\"amp-carousel\"],\
         \"customStylesheets\":[{{\"href\":\"https://fonts.googleapis.com/css?family=Lato\"}}]}}\
         </script></html>"
    )
}

/// A streaming-format creative with an allowlisted head.
pub fn trustless_creative(body: &str) -> String {
    format!(
        "<html ⚡4ads><head><meta charset=\"utf-8\">{RUNTIME}\
         <script async custom-element=\"amp-carousel\" src=\"https://cdn.ampproject.org/v0/amp-carousel-0.2.js\"></script>\
         <style amp4ads-boilerplate>body{{visibility:hidden}}</style></head>\
         <body>{body}</body></html>"
    )
}

// =============================================================================
// Network Adapter
// =============================================================================

/// Adapter whose hooks are switched per test.
///
/// Records every URL build and every `on_creative_render` call.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    pub network_type: String,
    pub ad_url: Option<String>,
    pub xhr_disallowed: bool,
    pub failure_result: Option<NetworkFailureResult>,
    pub render_without_crypto: bool,
    pub skip_client_validation: bool,
    pub failing_render_hook: bool,
    /// RTC callout count seen by each URL build, `None` without RTC.
    pub rtc_seen: Mutex<Vec<Option<usize>>>,
    /// Whether metadata was passed to each `on_creative_render` call.
    pub render_hooks: Mutex<Vec<bool>>,
}

impl ScriptedAdapter {
    pub fn new(network_type: &str) -> Self {
        Self {
            network_type: network_type.to_string(),
            ad_url: Some(AD_URL.to_string()),
            ..Self::default()
        }
    }

    pub fn rtc_seen(&self) -> Vec<Option<usize>> {
        self.rtc_seen.lock().unwrap().clone()
    }

    pub fn render_hooks(&self) -> Vec<bool> {
        self.render_hooks.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkAdapter for ScriptedAdapter {
    fn network_type(&self) -> &str {
        &self.network_type
    }

    async fn ad_url(&self, ctx: AdUrlContext) -> Result<Option<String>, AdapterError> {
        let rtc = match ctx.rtc {
            Some(rtc) => Some(rtc.await.map_or(0, |responses| responses.len())),
            None => None,
        };
        self.rtc_seen.lock().unwrap().push(rtc);
        Ok(self.ad_url.clone())
    }

    fn is_xhr_allowed(&self) -> bool {
        !self.xhr_disallowed
    }

    fn on_network_failure(&self, failure: &NetworkFailure, _ad_url: &str) -> NetworkFailureResult {
        self.failure_result
            .clone()
            .unwrap_or_else(|| NetworkFailureResult::default_for(failure))
    }

    fn supports_preferential_render_without_crypto(&self) -> bool {
        self.render_without_crypto
    }

    fn skip_client_side_validation(&self, _headers: &HeaderMap) -> bool {
        self.skip_client_validation
    }

    fn on_creative_render(&self, metadata: Option<&CreativeMetadata>) -> Result<(), AdapterError> {
        self.render_hooks.lock().unwrap().push(metadata.is_some());
        if self.failing_render_hook {
            return Err(AdapterError::render_hook("hook exploded"));
        }
        Ok(())
    }
}

/// RTC manager answering one successful callout.
#[derive(Debug, Default)]
pub struct CountingRtc {
    pub calls: AtomicUsize,
}

impl CountingRtc {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtcManager for CountingRtc {
    async fn execute(&self, _request: RtcRequest) -> Vec<RtcResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        vec![RtcResponse {
            callout: "vendor".to_string(),
            response: Some(serde_json::json!({"targeting": {"k": "v"}})),
            rtc_time_ms: 3,
            error: None,
        }]
    }
}

/// Geo service placing the user in a fixed set of groups.
#[derive(Debug, Default)]
pub struct StaticGeo {
    pub groups: Vec<String>,
}

#[async_trait]
impl GeoService for StaticGeo {
    async fn is_in_country_group(&self, group: &str) -> bool {
        self.groups.iter().any(|member| member == group)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A slot wired to recording fakes.
pub struct Harness {
    pub slot: AdSlot,
    pub host: Arc<RecordingHost>,
    pub transport: Arc<ScriptedTransport>,
    pub installer: Arc<RecordingInstaller>,
    pub analytics: Arc<RecordingAnalytics>,
}

pub struct HarnessBuilder {
    engine: EngineConfig,
    slot: SlotConfig,
    document: StaticDocument,
    replies: Vec<Scripted>,
    adapter: Option<Arc<dyn NetworkAdapter>>,
    verifier: Option<Arc<SignatureVerifier>>,
    configure: Option<Box<dyn FnOnce(SlotServices) -> SlotServices>>,
}

impl HarnessBuilder {
    pub fn new(slot: SlotConfig) -> Self {
        Self {
            engine: EngineConfig::default(),
            slot,
            document: StaticDocument::default(),
            replies: Vec::new(),
            adapter: None,
            verifier: None,
            configure: None,
        }
    }

    #[must_use]
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    #[must_use]
    pub fn document(mut self, document: StaticDocument) -> Self {
        self.document = document;
        self
    }

    #[must_use]
    pub fn reply(mut self, reply: Scripted) -> Self {
        self.replies.push(reply);
        self
    }

    /// Replaces the fixed-URL default adapter.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn NetworkAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Verifies signatures against a keyset holding `key` under `kid`.
    #[must_use]
    pub fn keyset(mut self, kid: &str, key: &SigningKey) -> Self {
        self.verifier = Some(Arc::new(SignatureVerifier::new(
            verifier_config(),
            StaticKeysetFetcher::new(kid, key),
        )));
        self
    }

    #[must_use]
    pub fn services(mut self, f: impl FnOnce(SlotServices) -> SlotServices + 'static) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Harness {
        let host = RecordingHost::new();
        let transport = ScriptedTransport::new(self.replies);
        let installer = RecordingInstaller::new();
        let analytics = Arc::new(RecordingAnalytics::default());
        let adapter = self.adapter.unwrap_or_else(|| {
            Arc::new(DefaultNetworkAdapter::new(
                self.slot.network_type.clone(),
                Some(AD_URL.to_string()),
            )) as Arc<dyn NetworkAdapter>
        });
        let mut services = SlotServices::new(
            adapter,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&host) as Arc<dyn SlotHost>,
            Arc::new(self.document),
            Arc::clone(&installer) as Arc<dyn EmbedInstaller>,
        )
        .with_analytics(Arc::clone(&analytics) as Arc<dyn AnalyticsSink>);
        if let Some(verifier) = self.verifier {
            services = services.with_verifier(verifier);
        }
        if let Some(configure) = self.configure {
            services = configure(services);
        }
        Harness {
            slot: AdSlot::new(self.engine, self.slot, services),
            host,
            transport,
            installer,
            analytics,
        }
    }
}

/// Lets spawned tasks run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
