//! Creative metadata extraction for signed creatives.
//!
//! A signed creative embeds a JSON metadata block near the end of the
//! document:
//!
//! ```text
//! <html>...<script type="application/json" amp-ad-metadata>{...}</script></html>
//! ```
//!
//! The block starts at the *last* occurrence of the first marker variant
//! found (variants are tried in order) and ends at the *last* `</script>` in
//! the whole creative. Last-match semantics are kept for compatibility with
//! existing creatives even though a creative with trailing `</script>` tags
//! after the block will fail to parse.
//!
//! The JSON must carry `ampRuntimeUtf16CharOffsets: [start, end]`, a UTF-16
//! range of the creative (the runtime script) that is removed together with
//! the metadata block to produce [`CreativeMetadata::minified_creative`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Marker variants that open the metadata block, in lookup order.
pub const METADATA_MARKERS: [&str; 3] = [
    "<script amp-ad-metadata type=application/json>",
    "<script type=\"application/json\" amp-ad-metadata>",
    "<script type=application/json amp-ad-metadata>",
];

/// Closing tag of the metadata block.
pub const SCRIPT_END: &str = "</script>";

/// Maximum number of images preloaded from the metadata.
pub const MAX_PRELOAD_IMAGES: usize = 5;

/// Errors from metadata extraction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// The creative is not valid UTF-8.
    #[error("creative is not valid utf-8")]
    InvalidUtf8,
    /// No marker variant was found.
    #[error("could not locate start index for amp meta data")]
    MissingStart,
    /// No closing script tag follows the marker.
    #[error("could not locate closing script tag for amp meta data")]
    MissingEnd,
    /// The block is not valid JSON.
    #[error("invalid amp metadata json: {0}")]
    InvalidJson(String),
    /// `ampRuntimeUtf16CharOffsets` is missing or malformed.
    #[error("invalid runtime offsets")]
    InvalidRuntimeOffsets,
    /// `customElementExtensions` or `extensions` is malformed.
    #[error("invalid extensions")]
    InvalidExtensions,
    /// `customStylesheets` is malformed or not secure.
    #[error("invalid custom stylesheets")]
    InvalidCustomStylesheets,
    /// A story ad is missing `ctaType`.
    #[error("invalid story ad metadata: missing ctaType")]
    MissingCtaType,
}

/// A runtime extension script referenced by the creative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRef {
    /// Custom element name, e.g. `amp-carousel`.
    #[serde(rename = "custom-element")]
    pub custom_element: String,
    /// Script URL.
    pub src: String,
}

/// A custom stylesheet (font) referenced by the creative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stylesheet {
    /// Secure stylesheet URL.
    pub href: String,
}

/// Sanctioned data needed to render a validated creative first-party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeMetadata {
    /// Creative with the runtime script and metadata block removed.
    pub minified_creative: String,
    /// Custom elements the creative uses.
    pub custom_element_extensions: Vec<String>,
    /// Extension scripts with explicit URLs.
    pub extensions: Vec<ExtensionRef>,
    /// Custom stylesheets.
    pub custom_stylesheets: Vec<Stylesheet>,
    /// Images to preload, at most [`MAX_PRELOAD_IMAGES`].
    pub images: Option<Vec<String>>,
    /// Story ad call-to-action type.
    pub cta_type: Option<String>,
    /// Story ad call-to-action URL.
    pub cta_url: Option<String>,
}

impl CreativeMetadata {
    /// Returns every extension id the embed has to install.
    #[must_use]
    pub fn extension_ids(&self) -> Vec<String> {
        let mut ids = self.custom_element_extensions.clone();
        for extension in &self.extensions {
            if !ids.contains(&extension.custom_element) {
                ids.push(extension.custom_element.clone());
            }
        }
        ids
    }

    /// Returns the stylesheet URLs to hand to the embed as fonts.
    #[must_use]
    pub fn font_urls(&self) -> Vec<String> {
        self.custom_stylesheets
            .iter()
            .map(|sheet| sheet.href.clone())
            .collect()
    }
}

/// Extracts the metadata block from creative bytes.
///
/// # Errors
///
/// See [`extract_metadata`]; additionally fails with
/// [`MetadataError::InvalidUtf8`].
pub fn extract_metadata_from_bytes(
    creative: &[u8],
    is_spsa: bool,
) -> Result<CreativeMetadata, MetadataError> {
    let creative = std::str::from_utf8(creative).map_err(|_| MetadataError::InvalidUtf8)?;
    extract_metadata(creative, is_spsa)
}

/// Extracts the metadata block from a creative.
///
/// `is_spsa` enables the story-ad requirements (`ctaType` is mandatory).
///
/// # Errors
///
/// Returns a [`MetadataError`] describing the first structural violation.
pub fn extract_metadata(creative: &str, is_spsa: bool) -> Result<CreativeMetadata, MetadataError> {
    let (marker_start, marker) = METADATA_MARKERS
        .iter()
        .find_map(|marker| creative.rfind(marker).map(|start| (start, *marker)))
        .ok_or(MetadataError::MissingStart)?;
    let json_start = marker_start + marker.len();
    let metadata_end = creative.rfind(SCRIPT_END).ok_or(MetadataError::MissingEnd)?;
    if metadata_end < json_start {
        return Err(MetadataError::MissingEnd);
    }

    let object: Value = serde_json::from_str(&creative[json_start..metadata_end])
        .map_err(|err| MetadataError::InvalidJson(err.to_string()))?;
    let object = object
        .as_object()
        .ok_or_else(|| MetadataError::InvalidJson("metadata is not an object".to_string()))?;

    let (runtime_start, runtime_end) = runtime_offsets(object.get("ampRuntimeUtf16CharOffsets"))?;
    let runtime_start =
        utf16_to_byte_offset(creative, runtime_start).ok_or(MetadataError::InvalidRuntimeOffsets)?;
    let runtime_end =
        utf16_to_byte_offset(creative, runtime_end).ok_or(MetadataError::InvalidRuntimeOffsets)?;

    let custom_element_extensions = match object.get("customElementExtensions") {
        Some(value) if is_truthy(value) => string_array(value)?,
        _ => Vec::new(),
    };
    let extensions = match object.get("extensions") {
        Some(value) if is_truthy(value) => serde_json::from_value(value.clone())
            .map_err(|_| MetadataError::InvalidExtensions)?,
        _ => Vec::new(),
    };
    let custom_stylesheets = match object.get("customStylesheets") {
        Some(value) if is_truthy(value) => stylesheets(value)?,
        _ => Vec::new(),
    };
    let images = object.get("images").and_then(Value::as_array).map(|images| {
        images
            .iter()
            .take(MAX_PRELOAD_IMAGES)
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });

    let (cta_type, cta_url) = if is_spsa {
        let cta_type = object
            .get("ctaType")
            .and_then(Value::as_str)
            .filter(|cta| !cta.is_empty())
            .ok_or(MetadataError::MissingCtaType)?;
        let cta_url = object.get("ctaUrl").and_then(Value::as_str);
        (Some(cta_type.to_string()), cta_url.map(str::to_string))
    } else {
        (None, None)
    };

    let mut minified_creative = String::with_capacity(creative.len());
    minified_creative.push_str(&creative[..runtime_start]);
    if runtime_end < marker_start {
        minified_creative.push_str(&creative[runtime_end..marker_start]);
    }
    minified_creative.push_str(&creative[metadata_end + SCRIPT_END.len()..]);

    Ok(CreativeMetadata {
        minified_creative,
        custom_element_extensions,
        extensions,
        custom_stylesheets,
        images,
        cta_type,
        cta_url,
    })
}

/// Returns `true` if `url` is a secure resource URL.
///
/// `https:` URLs are secure, as are plain HTTP URLs on a loopback host.
#[must_use]
pub fn is_secure_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if parsed.scheme() == "https" {
        return true;
    }
    matches!(
        parsed.host_str(),
        Some(host) if host == "localhost" || host == "127.0.0.1" || host.ends_with(".localhost")
    )
}

/// Maps a UTF-16 code unit offset to a byte offset in `s`.
///
/// Returns `None` if the offset is past the end or splits a surrogate pair.
#[must_use]
pub fn utf16_to_byte_offset(s: &str, utf16_offset: usize) -> Option<usize> {
    let mut units = 0;
    for (index, ch) in s.char_indices() {
        if units == utf16_offset {
            return Some(index);
        }
        units += ch.len_utf16();
        if units > utf16_offset {
            return None;
        }
    }
    (units == utf16_offset).then_some(s.len())
}

fn runtime_offsets(value: Option<&Value>) -> Result<(usize, usize), MetadataError> {
    let offsets = value
        .and_then(Value::as_array)
        .filter(|offsets| offsets.len() == 2)
        .ok_or(MetadataError::InvalidRuntimeOffsets)?;
    let start = offsets[0]
        .as_u64()
        .ok_or(MetadataError::InvalidRuntimeOffsets)?;
    let end = offsets[1]
        .as_u64()
        .ok_or(MetadataError::InvalidRuntimeOffsets)?;
    let start = usize::try_from(start).map_err(|_| MetadataError::InvalidRuntimeOffsets)?;
    let end = usize::try_from(end).map_err(|_| MetadataError::InvalidRuntimeOffsets)?;
    Ok((start, end))
}

fn string_array(value: &Value) -> Result<Vec<String>, MetadataError> {
    value
        .as_array()
        .ok_or(MetadataError::InvalidExtensions)?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or(MetadataError::InvalidExtensions)
        })
        .collect()
}

fn stylesheets(value: &Value) -> Result<Vec<Stylesheet>, MetadataError> {
    value
        .as_array()
        .ok_or(MetadataError::InvalidCustomStylesheets)?
        .iter()
        .map(|sheet| {
            sheet
                .get("href")
                .and_then(Value::as_str)
                .filter(|href| !href.is_empty() && is_secure_url(href))
                .map(|href| Stylesheet {
                    href: href.to_string(),
                })
                .ok_or(MetadataError::InvalidCustomStylesheets)
        })
        .collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
