//! Configuration parsing and management.
//!
//! Two layers of configuration drive the engine:
//!
//! - [`EngineConfig`]: document-wide settings (error reporting mode,
//!   safeframe bootstrap, refresh grace delay, signing services).
//! - [`SlotConfig`]: per-slot settings that would otherwise be read from the
//!   slot element's attributes (network type, size, story-ad flag, RTC
//!   configuration, consent policy, ...).
//!
//! Both are plain `serde` structs loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::{CreativeSize, RenderMode};

/// Safeframe version used when the server does not request another one.
pub const DEFAULT_SAFEFRAME_VERSION: &str = "1-0-40";

/// Grace delay between showing the placeholder and re-layout on refresh.
pub const DEFAULT_REFRESH_GRACE_DELAY_MS: u64 = 1000;

/// Probability of escalating a reportable error in production mode.
pub const DEFAULT_ERROR_SAMPLE_RATE: f64 = 0.01;

/// Network type used by the local test creative.
pub const FAKE_NETWORK_TYPE: &str = "fake";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid TOML for the expected schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration parsed but holds invalid values.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Error reporting verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Errors are logged as warnings and escalated with low probability.
    #[default]
    Production,
    /// Every reportable error is logged at error level.
    Development,
}

/// Which creative validation flow the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFlow {
    /// Verify the creative signature against the signing keysets.
    #[default]
    Signed,
    /// Stream the creative and validate its `<head>` structurally.
    Trustless,
}

/// Document-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Error reporting verbosity.
    #[serde(default)]
    pub mode: EngineMode,

    /// Probability of escalating a reportable error in production mode.
    #[serde(default = "default_error_sample_rate")]
    pub error_sample_rate: f64,

    /// Creative validation flow.
    #[serde(default)]
    pub flow: ValidationFlow,

    /// Cross-domain frame bootstrap settings.
    #[serde(default)]
    pub safeframe: SafeframeConfig,

    /// Refresh settings.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Timeout applied to the whole RTC callout phase.
    #[serde(default)]
    pub rtc_timeout_ms: Option<u64>,

    /// Signature verification settings.
    #[serde(default)]
    pub verifier: VerifierConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            error_sample_rate: DEFAULT_ERROR_SAMPLE_RATE,
            flow: ValidationFlow::default(),
            safeframe: SafeframeConfig::default(),
            refresh: RefreshConfig::default(),
            rtc_timeout_ms: None,
            verifier: VerifierConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.error_sample_rate) {
            return Err(ConfigError::Validation(format!(
                "error_sample_rate must be within [0, 1], got {}",
                self.error_sample_rate
            )));
        }
        if !crate::headers::is_valid_safeframe_version(&self.safeframe.default_version) {
            return Err(ConfigError::Validation(format!(
                "safeframe.default_version '{}' must match [0-9-]+",
                self.safeframe.default_version
            )));
        }
        for service in &self.verifier.signing_services {
            if service.name.is_empty() || service.keyset_url.is_empty() {
                return Err(ConfigError::Validation(
                    "signing services need a name and a keyset_url".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Returns the RTC timeout, if configured.
    #[must_use]
    pub fn rtc_timeout(&self) -> Option<Duration> {
        self.rtc_timeout_ms.map(Duration::from_millis)
    }
}

fn default_error_sample_rate() -> f64 {
    DEFAULT_ERROR_SAMPLE_RATE
}

/// Cross-domain frame bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeframeConfig {
    /// Safeframe version used when no header overrides it.
    #[serde(default = "default_safeframe_version")]
    pub default_version: String,

    /// Base URL of the safeframe host; the version path is appended.
    #[serde(default = "default_safeframe_base_url")]
    pub base_url: String,

    /// Nameframe bootstrap URL.
    #[serde(default = "default_nameframe_url")]
    pub nameframe_url: String,
}

impl Default for SafeframeConfig {
    fn default() -> Self {
        Self {
            default_version: default_safeframe_version(),
            base_url: default_safeframe_base_url(),
            nameframe_url: default_nameframe_url(),
        }
    }
}

fn default_safeframe_version() -> String {
    DEFAULT_SAFEFRAME_VERSION.to_string()
}

fn default_safeframe_base_url() -> String {
    "https://tpc.googlesyndication.com/safeframe/".to_string()
}

fn default_nameframe_url() -> String {
    "https://3p.ampproject.net/current/nameframe.html".to_string()
}

/// Refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Delay between showing the loading placeholder and re-layout.
    #[serde(default = "default_grace_delay_ms")]
    pub grace_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: DEFAULT_REFRESH_GRACE_DELAY_MS,
        }
    }
}

impl RefreshConfig {
    /// Returns the grace delay.
    #[must_use]
    pub const fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }
}

fn default_grace_delay_ms() -> u64 {
    DEFAULT_REFRESH_GRACE_DELAY_MS
}

/// Signature verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Whether the platform can perform signature verification at all.
    #[serde(default = "default_true")]
    pub crypto_available: bool,

    /// Signing services whose keysets are loaded.
    #[serde(default)]
    pub signing_services: Vec<SigningServiceConfig>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            crypto_available: true,
            signing_services: Vec::new(),
        }
    }
}

/// One creative signing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningServiceConfig {
    /// Service name as it appears in the signature header.
    pub name: String,
    /// URL of the service's public keyset (JWK set).
    pub keyset_url: String,
}

const fn default_true() -> bool {
    true
}

/// A boolean-or-distance viewport setting.
///
/// `true` means "anywhere", `false` means "only when in the viewport", and a
/// number is a distance in viewports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ViewportSetting {
    /// Boolean form.
    Flag(bool),
    /// Distance in viewports.
    Viewports(f64),
}

impl Default for ViewportSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

/// Per-slot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Ad network type, used to pick the adapter and to tag errors.
    pub network_type: String,

    /// Slot width in pixels.
    pub width: u32,

    /// Slot height in pixels.
    pub height: u32,

    /// Fixed ad request URL for networks without a URL builder.
    #[serde(default)]
    pub ad_url: Option<String>,

    /// The slot is a single-page story ad (no cross-domain fallback).
    #[serde(default)]
    pub is_spsa: bool,

    /// Refuse cross-domain fallback rendering.
    #[serde(default)]
    pub disable_3p_fallback: bool,

    /// Delay the ad request until the slot is near the viewport.
    #[serde(default)]
    pub delay_request: ViewportSetting,

    /// Distance at which the slot may render outside the viewport.
    #[serde(default = "default_render_outside_viewport")]
    pub render_outside_viewport: ViewportSetting,

    /// Real-time config callout definition, if any.
    #[serde(default)]
    pub rtc_config: Option<serde_json::Value>,

    /// Geo groups in which RTC callouts are blocked.
    #[serde(default)]
    pub block_rtc: Vec<String>,

    /// Consent policy id, if the slot is consent gated.
    #[serde(default)]
    pub consent_policy: Option<String>,

    /// Element-level render mode override.
    #[serde(default)]
    pub render_mode_override: Option<RenderMode>,

    /// Allow synchronous XHR inside cross-domain frames.
    #[serde(default)]
    pub allow_sync_xhr: bool,

    /// Force signature checking for the `fake` network type.
    #[serde(default)]
    pub checksig: bool,

    /// Frame title.
    #[serde(default)]
    pub title: Option<String>,
}

fn default_render_outside_viewport() -> ViewportSetting {
    ViewportSetting::Viewports(3.0)
}

impl SlotConfig {
    /// Creates a slot configuration with defaults for everything but the
    /// network type and size.
    #[must_use]
    pub fn new(network_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            network_type: network_type.into(),
            width,
            height,
            ad_url: None,
            is_spsa: false,
            disable_3p_fallback: false,
            delay_request: ViewportSetting::default(),
            render_outside_viewport: default_render_outside_viewport(),
            rtc_config: None,
            block_rtc: Vec::new(),
            consent_policy: None,
            render_mode_override: None,
            allow_sync_xhr: false,
            checksig: false,
            title: None,
        }
    }

    /// Parse a slot configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Returns the configured slot size.
    #[must_use]
    pub const fn size(&self) -> CreativeSize {
        CreativeSize::new(self.width, self.height)
    }

    /// Returns `true` if the slot has a non-empty layout box.
    #[must_use]
    pub const fn has_layout_size(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Returns `true` if signature checking is skipped for this slot.
    #[must_use]
    pub fn is_unsigned_test_creative(&self) -> bool {
        self.network_type == FAKE_NETWORK_TYPE && !self.checksig
    }

    /// Returns `true` if cross-domain fallback is refused for this slot.
    #[must_use]
    pub const fn cross_domain_fallback_disabled(&self) -> bool {
        self.disable_3p_fallback || self.is_spsa
    }

    /// Returns the frame title.
    #[must_use]
    pub fn frame_title(&self) -> &str {
        self.title.as_deref().unwrap_or("3rd party ad content")
    }
}
