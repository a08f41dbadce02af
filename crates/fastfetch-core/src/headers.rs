//! Ad response header parsing.
//!
//! The ad server communicates rendering hints through response headers:
//!
//! | Header                  | Format                   | Effect                         |
//! |-------------------------|--------------------------|--------------------------------|
//! | `X-CreativeSize`        | `NUMBERxNUMBER`          | overrides the creative size    |
//! | `X-AmpAdRender`         | [`RenderMode`] value     | overrides the render mode      |
//! | `X-AmpSafeFrameVersion` | `[0-9-]+`                | selects the safeframe version  |
//! | `amp-ff-exps`           | `key=value,key=value`    | post-response experiments      |
//! | `amp-ff-empty-creative` | any                      | collapse the slot              |
//!
//! Malformed values are logged and ignored; header parsing never fails the
//! pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use http::{HeaderMap, HeaderName};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Creative size override header.
pub const CREATIVE_SIZE_HEADER: HeaderName = HeaderName::from_static("x-creativesize");
/// Cross-domain render mode header.
pub const RENDERING_TYPE_HEADER: HeaderName = HeaderName::from_static("x-ampadrender");
/// Safeframe version header.
pub const SAFEFRAME_VERSION_HEADER: HeaderName = HeaderName::from_static("x-ampsafeframeversion");
/// Post-response experiment features header.
pub const EXPERIMENT_FEATURE_HEADER: HeaderName = HeaderName::from_static("amp-ff-exps");
/// Marker header for an intentionally empty creative.
pub const EMPTY_CREATIVE_HEADER: HeaderName = HeaderName::from_static("amp-ff-empty-creative");
/// Creative signature header (`<service>:<kid>:<base64 signature>`).
pub const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("amp-fast-fetch-signature");

/// Experiment feature enabling price-neutral rendering.
pub const PREF_NEUTRAL_FEATURE: &str = "pref_neutral_enabled";

static SIZE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)x([0-9]+)$").expect("size regex is valid"));

static SAFEFRAME_VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9-]+$").expect("safeframe version regex is valid"));

/// Width and height of a creative in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreativeSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl CreativeSize {
    /// Creates a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for CreativeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How a creative that is not rendered first-party reaches the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Rendered from the client cache through the friendly embed.
    ClientCache,
    /// Cross-domain safeframe container with the creative in `name`.
    Safeframe,
    /// Cross-domain nameframe bootstrap with the creative in `name`.
    Nameframe,
    /// Cross-domain iframe whose `src` is the ad URL itself.
    IframeGet,
}

impl RenderMode {
    /// Returns the header value for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientCache => "client_cache",
            Self::Safeframe => "safeframe",
            Self::Nameframe => "nameframe",
            Self::IframeGet => "iframe_get",
        }
    }

    /// Returns `true` for modes that carry the creative in the frame name.
    #[must_use]
    pub const fn uses_name_attribute(self) -> bool {
        matches!(self, Self::Safeframe | Self::Nameframe)
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_cache" => Ok(Self::ClientCache),
            "safeframe" => Ok(Self::Safeframe),
            "nameframe" => Ok(Self::Nameframe),
            "iframe_get" => Ok(Self::IframeGet),
            other => Err(format!("unknown render mode '{other}'")),
        }
    }
}

/// Returns the header value as a string, ignoring non-visible-ASCII values.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Parses an `NUMBERxNUMBER` size string.
#[must_use]
pub fn parse_size(value: &str) -> Option<CreativeSize> {
    let captures = SIZE_PATTERN.captures(value)?;
    let width = captures[1].parse().ok()?;
    let height = captures[2].parse().ok()?;
    Some(CreativeSize::new(width, height))
}

/// Extracts the creative size from `X-CreativeSize`.
///
/// Returns `None` when the header is absent or malformed; malformed values
/// are logged.
#[must_use]
pub fn extract_size(headers: &HeaderMap) -> Option<CreativeSize> {
    let value = header_str(headers, &CREATIVE_SIZE_HEADER)?;
    let size = parse_size(value);
    if size.is_none() {
        warn!(header = %CREATIVE_SIZE_HEADER, value, "invalid creative size header");
    }
    size
}

/// Parses a comma separated list of `key=value` pairs.
///
/// The last occurrence of a key wins. Pairs without exactly one `=` or with
/// an empty key are skipped with a warning.
#[must_use]
pub fn parse_experiment_features(value: &str) -> BTreeMap<String, String> {
    let mut features = BTreeMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) if !key.trim().is_empty() => {
                features.insert(key.trim().to_string(), value.trim().to_string());
            },
            _ => warn!(pair, "invalid experiment feature pair"),
        }
    }
    features
}

/// Parses a render mode header value, logging unrecognized values.
#[must_use]
pub fn parse_render_mode(value: &str) -> Option<RenderMode> {
    match value.parse() {
        Ok(mode) => Some(mode),
        Err(reason) => {
            warn!(header = %RENDERING_TYPE_HEADER, value, %reason, "ignoring cross-origin render mode header");
            None
        },
    }
}

/// Returns `true` if `value` is a well-formed safeframe version.
#[must_use]
pub fn is_valid_safeframe_version(value: &str) -> bool {
    SAFEFRAME_VERSION_PATTERN.is_match(value)
}

/// Rendering hints extracted from the response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHints {
    /// The response carries the empty-creative marker.
    pub empty_creative: bool,
    /// Experiment features from `amp-ff-exps`.
    pub experiment_features: BTreeMap<String, String>,
    /// Render mode requested by the server.
    pub render_mode: Option<RenderMode>,
    /// Safeframe version to switch to, if it differs from the default.
    pub safeframe_version: Option<String>,
}

impl ResponseHints {
    /// Classifies response headers.
    ///
    /// Size extraction is left to the network adapter since networks may
    /// override it.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, default_safeframe_version: &str) -> Self {
        let experiment_features = header_str(headers, &EXPERIMENT_FEATURE_HEADER)
            .map(parse_experiment_features)
            .unwrap_or_default();
        let render_mode = header_str(headers, &RENDERING_TYPE_HEADER).and_then(parse_render_mode);
        let safeframe_version = header_str(headers, &SAFEFRAME_VERSION_HEADER)
            .filter(|version| {
                is_valid_safeframe_version(version) && *version != default_safeframe_version
            })
            .map(str::to_string);

        Self {
            empty_creative: headers.contains_key(&EMPTY_CREATIVE_HEADER),
            experiment_features,
            render_mode,
            safeframe_version,
        }
    }

    /// Returns `true` if the price-neutral experiment is enabled.
    #[must_use]
    pub fn pref_neutral_enabled(&self) -> bool {
        self.experiment_features
            .get(PREF_NEUTRAL_FEATURE)
            .is_some_and(|value| value == "true")
    }
}
