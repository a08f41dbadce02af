//! Frame construction.
//!
//! Builds the [`FrameSpec`] for every rendering strategy. A frame spec is the
//! complete attribute set the slot host needs to attach an iframe; the
//! engine never creates DOM nodes itself.
//!
//! # Naming Protocol
//!
//! Cross-domain frames receive the creative and the page context through
//! the frame `name`:
//!
//! - Safeframe: `<version>;<creative length>;<creative><context json>` with
//!   the length counted in UTF-16 code units, matching what the container
//!   script slices on.
//! - Nameframe: the context JSON with an added `creative` key.
//! - GET iframe: the context JSON; the creative is fetched by the frame from
//!   its `src`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};
use url::Url;

use crate::adapter::NetworkAdapter;
use crate::config::{EngineConfig, EngineMode, SlotConfig};
use crate::headers::CreativeSize;
use crate::host::HostDocument;
use crate::render::RenderError;

/// Query parameter carrying the page origin on GET-iframe requests.
pub const SOURCE_ORIGIN_PARAM: &str = "__amp_source_origin";

/// Tag name reported in the context metadata.
pub const CONTEXT_TAG_NAME: &str = "AMP-AD";

/// Version of the context metadata layout.
pub const CONTEXT_VERSION: &str = "1";

/// Sandbox tokens for cross-domain and secure frames.
pub const SANDBOX_TOKENS: [&str; 6] = [
    "allow-forms",
    "allow-popups",
    "allow-popups-to-escape-sandbox",
    "allow-same-origin",
    "allow-scripts",
    "allow-top-navigation-by-user-activation",
];

/// Content security policy of every cross-domain frame.
pub const CROSS_DOMAIN_CSP: &str = concat!(
    "script-src https://cdn.ampproject.org/ https://tpc.googlesyndication.com/ ",
    "https://securepubads.g.doubleclick.net/ 'unsafe-inline'; ",
    "object-src 'none'; ",
    "base-uri 'none';",
);

/// Content security policy of the secure document.
pub const SECURE_DOCUMENT_CSP: &str = concat!(
    "default-src 'none'; ",
    "frame-src 'none'; ",
    "worker-src 'none'; ",
    "img-src https: data:; ",
    "media-src https: data:; ",
    "font-src *; ",
    "connect-src *; ",
    "script-src https://cdn.ampproject.org/; ",
    "object-src 'none'; ",
    "child-src 'none'; ",
    "base-uri 'self'; ",
    "form-action 'none'; ",
    "style-src https://cdn.materialdesignicons.com https://cloud.typography.com ",
    "https://fast.fonts.net https://fonts.googleapis.com https://maxcdn.bootstrapcdn.com ",
    "https://p.typekit.net https://use.fontawesome.com https://use.typekit.net 'unsafe-inline';",
);

/// Rendering strategy of an attached frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Same-origin frame hosting a friendly embed.
    FriendlyEmbed,
    /// Sandboxed `srcdoc` frame hosting a structurally validated creative.
    SecureEmbed,
    /// Cross-domain safeframe container.
    Safeframe,
    /// Cross-domain nameframe bootstrap.
    Nameframe,
    /// Cross-domain frame loading the ad URL.
    IframeGet,
}

impl FrameKind {
    /// Returns `true` for first-party strategies.
    #[must_use]
    pub const fn is_first_party(self) -> bool {
        matches!(self, Self::FriendlyEmbed | Self::SecureEmbed)
    }
}

/// Attributes of a frame to attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSpec {
    /// Strategy.
    pub kind: FrameKind,
    /// Frame attributes.
    pub attributes: BTreeMap<String, String>,
}

impl FrameSpec {
    /// Returns an attribute.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Returns the sandbox attribute value.
#[must_use]
pub fn sandbox_attribute() -> String {
    SANDBOX_TOKENS.join(" ")
}

/// Returns the safeframe container path for `version`.
#[must_use]
pub fn safeframe_path(base_url: &str, version: &str) -> String {
    format!("{base_url}{version}/html/container.html")
}

/// Returns the safeframe `name` attribute.
#[must_use]
pub fn safeframe_name(version: &str, creative: &str, context_json: &str) -> String {
    let length = creative.encode_utf16().count();
    format!("{version};{length};{creative}{context_json}")
}

/// Appends the source origin to a GET-iframe URL.
///
/// # Errors
///
/// Fails if the URL is invalid or already carries the parameter.
pub fn cors_url(ad_url: &str, source_origin: &str) -> Result<String, RenderError> {
    let mut url = Url::parse(ad_url).map_err(|err| RenderError::InvalidUrl(err.to_string()))?;
    if url.query_pairs().any(|(key, _)| key == SOURCE_ORIGIN_PARAM) {
        return Err(RenderError::SourceOriginPresent);
    }
    url.query_pairs_mut()
        .append_pair(SOURCE_ORIGIN_PARAM, source_origin);
    Ok(url.into())
}

/// Returns the full document loaded into a secure frame.
#[must_use]
pub fn secure_document_skeleton(sanitized_head: &str, body: &str) -> String {
    let head_inner = sanitized_head
        .strip_prefix("<head>")
        .and_then(|head| head.strip_suffix("</head>"))
        .unwrap_or(sanitized_head);
    format!(
        "<!DOCTYPE html><html ⚡4ads lang=\"en\"><head><meta charset=\"UTF-8\">\
         <meta http-equiv=Content-Security-Policy content=\"{SECURE_DOCUMENT_CSP}\">\
         {head_inner}</head><body>{body}</body></html>"
    )
}

/// Builds frame specs for one slot.
pub struct FrameBuilder<'a> {
    /// Engine configuration.
    pub engine: &'a EngineConfig,
    /// Slot configuration.
    pub slot: &'a SlotConfig,
    /// Hosting document.
    pub document: &'a dyn HostDocument,
    /// Network adapter.
    pub adapter: &'a dyn NetworkAdapter,
    /// Frame size.
    pub size: CreativeSize,
}

impl FrameBuilder<'_> {
    /// Frame for a friendly embed.
    #[must_use]
    pub fn friendly(&self) -> FrameSpec {
        FrameSpec {
            kind: FrameKind::FriendlyEmbed,
            attributes: self.shared_attributes(),
        }
    }

    /// Sandboxed frame whose document is the sanitized head plus body.
    #[must_use]
    pub fn secure(&self, sanitized_head: &str, body: &str) -> FrameSpec {
        let mut attributes = self.shared_attributes();
        attributes.insert("sandbox".to_string(), sandbox_attribute());
        attributes.insert(
            "srcdoc".to_string(),
            secure_document_skeleton(sanitized_head, body),
        );
        FrameSpec {
            kind: FrameKind::SecureEmbed,
            attributes,
        }
    }

    /// Safeframe container carrying `creative`.
    #[must_use]
    pub fn safeframe(&self, version: &str, creative: &str) -> FrameSpec {
        let context = Value::Object(self.context_metadata(true)).to_string();
        let mut attributes = self.cross_domain_attributes();
        attributes.insert(
            "src".to_string(),
            format!(
                "{}?n=0",
                safeframe_path(&self.engine.safeframe.base_url, version)
            ),
        );
        attributes.insert(
            "name".to_string(),
            safeframe_name(version, creative, &context),
        );
        FrameSpec {
            kind: FrameKind::Safeframe,
            attributes,
        }
    }

    /// Nameframe bootstrap carrying `creative`.
    #[must_use]
    pub fn nameframe(&self, creative: &str) -> FrameSpec {
        let mut context = self.context_metadata(false);
        context.insert("creative".to_string(), Value::String(creative.to_string()));
        let mut attributes = self.cross_domain_attributes();
        attributes.insert(
            "src".to_string(),
            self.engine.safeframe.nameframe_url.clone(),
        );
        attributes.insert("name".to_string(), Value::Object(context).to_string());
        FrameSpec {
            kind: FrameKind::Nameframe,
            attributes,
        }
    }

    /// Cross-domain frame loading `ad_url`.
    ///
    /// # Errors
    ///
    /// Fails if the ad URL cannot be CORS-rewritten.
    pub fn iframe_get(&self, ad_url: &str) -> Result<FrameSpec, RenderError> {
        let page = self.document.page_context();
        let mut attributes = self.cross_domain_attributes();
        attributes.insert("src".to_string(), cors_url(ad_url, &page.source_origin)?);
        attributes.insert(
            "name".to_string(),
            Value::Object(self.context_metadata(false)).to_string(),
        );
        Ok(FrameSpec {
            kind: FrameKind::IframeGet,
            attributes,
        })
    }

    /// Context metadata for cross-domain frames.
    #[must_use]
    pub fn context_metadata(&self, is_safeframe: bool) -> Map<String, Value> {
        let page = self.document.page_context();
        let context = json!({
            "ampcontextVersion": CONTEXT_VERSION,
            "sourceUrl": page.source_url,
            "referrer": page.referrer,
            "canonicalUrl": page.canonical_url,
            "pageViewId": page.page_view_id,
            "location": { "href": page.location_href },
            "startTime": page.start_time_ms,
            "tagName": CONTEXT_TAG_NAME,
            "mode": {
                "development": self.engine.mode == EngineMode::Development,
                "version": page.runtime_version,
            },
            "hidden": page.hidden,
            "initialLayoutRect": self.document.layout_rect(),
            "initialIntersection": self.document.intersection_snapshot(),
            "domFingerprint": page.dom_fingerprint,
            "experimentToggles": page.experiment_toggles,
            "sentinel": page.sentinel,
        });

        let mut metadata = Map::new();
        metadata.insert("type".to_string(), Value::String(self.slot.network_type.clone()));
        metadata.insert("width".to_string(), json!(self.size.width));
        metadata.insert("height".to_string(), json!(self.size.height));
        metadata.insert("_context".to_string(), context);
        metadata.extend(self.adapter.additional_context_metadata(is_safeframe));
        metadata
    }

    fn shared_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes: BTreeMap<String, String> = [
            ("frameborder", "0"),
            ("allowfullscreen", ""),
            ("allowtransparency", ""),
            ("scrolling", "no"),
            ("marginwidth", "0"),
            ("marginheight", "0"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        attributes.insert("width".to_string(), self.size.width.to_string());
        attributes.insert("height".to_string(), self.size.height.to_string());
        attributes.insert("title".to_string(), self.slot.frame_title().to_string());
        attributes
    }

    fn cross_domain_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = self.shared_attributes();
        attributes.insert(
            "data-amp-3p-sentinel".to_string(),
            self.document.page_context().sentinel,
        );
        if !self.slot.allow_sync_xhr {
            attributes.insert("allow".to_string(), "sync-xhr 'none';".to_string());
        }
        attributes.insert("sandbox".to_string(), sandbox_attribute());
        attributes.insert("csp".to_string(), CROSS_DOMAIN_CSP.to_string());
        attributes
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::adapter::DefaultNetworkAdapter;
    use crate::host::{IntersectionSnapshot, LayoutRect, PageContext};

    struct StaticDocument;

    #[async_trait]
    impl HostDocument for StaticDocument {
        async fn when_first_visible(&self) {}

        fn is_ios(&self) -> bool {
            false
        }

        fn supports_secure_frames(&self) -> bool {
            true
        }

        fn page_context(&self) -> PageContext {
            PageContext {
                source_url: "https://publisher.example/article".to_string(),
                canonical_url: "https://publisher.example/article".to_string(),
                page_view_id: "1234".to_string(),
                location_href: "https://publisher.example/article".to_string(),
                source_origin: "https://publisher.example".to_string(),
                sentinel: "0-42".to_string(),
                ..PageContext::default()
            }
        }

        fn intersection_snapshot(&self) -> IntersectionSnapshot {
            IntersectionSnapshot {
                intersection_ratio: 0.5,
                ..IntersectionSnapshot::default()
            }
        }

        fn layout_rect(&self) -> LayoutRect {
            LayoutRect {
                left: 0.0,
                top: 100.0,
                width: 320.0,
                height: 50.0,
            }
        }

        fn is_in_viewport(&self) -> bool {
            true
        }
    }

    fn with_builder<R>(slot: &SlotConfig, f: impl FnOnce(&FrameBuilder<'_>) -> R) -> R {
        let engine = EngineConfig::default();
        let adapter = DefaultNetworkAdapter::new("test", None);
        let builder = FrameBuilder {
            engine: &engine,
            slot,
            document: &StaticDocument,
            adapter: &adapter,
            size: CreativeSize::new(320, 50),
        };
        f(&builder)
    }

    #[test]
    fn test_safeframe_name_counts_utf16_units() {
        assert_eq!(safeframe_name("1-0-40", "<p>ad</p>", "{}"), "1-0-40;9;<p>ad</p>{}");
        // One supplementary-plane character is two UTF-16 units.
        assert_eq!(safeframe_name("1-0-40", "😀", "{}"), "1-0-40;2;😀{}");
    }

    #[test]
    fn test_safeframe_spec() {
        let slot = SlotConfig::new("test", 320, 50);
        let spec = with_builder(&slot, |builder| builder.safeframe("1-0-40", "<p>ad</p>"));
        assert_eq!(spec.kind, FrameKind::Safeframe);
        assert_eq!(
            spec.attr("src"),
            Some("https://tpc.googlesyndication.com/safeframe/1-0-40/html/container.html?n=0")
        );
        let name = spec.attr("name").unwrap();
        assert!(name.starts_with("1-0-40;9;<p>ad</p>{"));
        let context: Value = serde_json::from_str(&name["1-0-40;9;<p>ad</p>".len()..]).unwrap();
        assert_eq!(context["_context"]["sentinel"], "0-42");
        assert_eq!(context["_context"]["initialIntersection"]["intersectionRatio"], 0.5);
        assert_eq!(spec.attr("allow"), Some("sync-xhr 'none';"));
        assert_eq!(spec.attr("data-amp-3p-sentinel"), Some("0-42"));
        assert_eq!(spec.attr("width"), Some("320"));
        assert_eq!(spec.attr("sandbox"), Some(sandbox_attribute().as_str()));
    }

    #[test]
    fn test_nameframe_and_sync_xhr() {
        let mut slot = SlotConfig::new("test", 320, 50);
        slot.allow_sync_xhr = true;
        let spec = with_builder(&slot, |builder| builder.nameframe("<p>ad</p>"));
        assert_eq!(spec.kind, FrameKind::Nameframe);
        assert_eq!(spec.attr("allow"), None);
        let name: Value = serde_json::from_str(spec.attr("name").unwrap()).unwrap();
        assert_eq!(name["creative"], "<p>ad</p>");
        assert_eq!(name["type"], "test");
    }

    #[test]
    fn test_iframe_get_rewrites_url() {
        let slot = SlotConfig::new("test", 320, 50);
        let spec = with_builder(&slot, |builder| {
            builder.iframe_get("https://ads.example/ad?slot=1").unwrap()
        });
        assert_eq!(
            spec.attr("src"),
            Some("https://ads.example/ad?slot=1&__amp_source_origin=https%3A%2F%2Fpublisher.example")
        );

        let err = with_builder(&slot, |builder| {
            builder
                .iframe_get("https://ads.example/ad?__amp_source_origin=x")
                .unwrap_err()
        });
        assert!(matches!(err, RenderError::SourceOriginPresent));
    }

    #[test]
    fn test_cross_domain_frames_carry_sandbox_and_csp() {
        let slot = SlotConfig::new("test", 320, 50);
        let specs = with_builder(&slot, |builder| {
            vec![
                builder.safeframe("1-0-40", "<p>ad</p>"),
                builder.nameframe("<p>ad</p>"),
                builder.iframe_get("https://ads.example/ad").unwrap(),
            ]
        });
        let sandbox = sandbox_attribute();
        for spec in &specs {
            assert_eq!(spec.attr("sandbox"), Some(sandbox.as_str()), "{:?}", spec.kind);
            let csp = spec.attr("csp").unwrap();
            assert_eq!(csp, CROSS_DOMAIN_CSP);
            assert!(csp.starts_with("script-src "));
        }
    }

    #[test]
    fn test_first_party_frame_has_no_cross_domain_policy() {
        let slot = SlotConfig::new("test", 320, 50);
        let spec = with_builder(&slot, |builder| builder.friendly());
        assert_eq!(spec.attr("csp"), None);
        assert_eq!(spec.attr("data-amp-3p-sentinel"), None);
    }

    #[test]
    fn test_secure_frame_document() {
        let slot = SlotConfig::new("test", 320, 50);
        let spec = with_builder(&slot, |builder| {
            builder.secure("<head><title>ad</title></head>", "<p>body</p>")
        });
        let srcdoc = spec.attr("srcdoc").unwrap();
        assert!(srcdoc.contains("Content-Security-Policy"));
        assert!(srcdoc.contains("<title>ad</title></head><body><p>body</p></body>"));
        assert!(spec.kind.is_first_party());
    }
}
