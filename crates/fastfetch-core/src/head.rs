//! Streaming `<head>` extraction for structural validation.
//!
//! The trustless flow never needs the whole creative to decide whether it
//! can render first-party: the decision is made from the `<head>` alone.
//! [`HeadStreamParser`] is fed response chunks as they arrive, locates the
//! first `<head ...>` through `</head>` (ASCII case-insensitive) and
//! tokenizes the elements inside it. Bytes after `</head>` are only counted.
//!
//! The parsed head is handed to a [`HeadSanitizer`], which either approves it
//! (returning the extensions and fonts to install plus the rebuilt head) or
//! rejects it.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

const HEAD_OPEN: &[u8] = b"<head";
const HEAD_CLOSE: &[u8] = b"</head>";

/// Elements whose content is raw text up to the matching end tag.
const RAW_TEXT_TAGS: [&str; 4] = ["script", "style", "title", "noscript"];

static TAG_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([a-zA-Z][a-zA-Z0-9-]*)").expect("tag name regex is valid"));

static ATTRIBUTE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute regex is valid")
});

static EXTENSION_SRC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://cdn\.ampproject\.org/v0/(amp-[a-z0-9-]+)-([0-9]+\.[0-9]+)\.js$")
        .expect("extension src regex is valid")
});

/// One element inside `<head>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadElement {
    /// Lowercase tag name.
    pub tag: String,
    /// Attributes in source order; valueless attributes have an empty value.
    pub attributes: Vec<(String, String)>,
    /// Raw text content of script, style, title and noscript elements.
    pub text: Option<String>,
}

impl HeadElement {
    /// Returns the value of attribute `name` (ASCII case-insensitive).
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if the element carries attribute `name`.
    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    fn to_html(&self) -> String {
        let mut html = format!("<{}", self.tag);
        for (key, value) in &self.attributes {
            if value.is_empty() {
                html.push_str(&format!(" {key}"));
            } else {
                html.push_str(&format!(" {key}=\"{}\"", value.replace('"', "&quot;")));
            }
        }
        html.push('>');
        if let Some(text) = &self.text {
            html.push_str(text);
            html.push_str(&format!("</{}>", self.tag));
        }
        html
    }
}

/// The `<head>` of a creative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedHead {
    /// Source text from `<head` through `</head>`.
    pub html: String,
    /// Elements inside the head.
    pub elements: Vec<HeadElement>,
}

/// Result of feeding a whole body through the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadParseResult {
    /// Total bytes seen.
    pub total_bytes: usize,
    /// The head, if a complete one was found.
    pub head: Option<ParsedHead>,
}

/// Incremental `<head>` locator.
///
/// Each chunk is scanned once: searches resume just before the end of the
/// previous chunk so a tag split across chunks is still found.
#[derive(Debug, Default)]
pub struct HeadStreamParser {
    buffer: Vec<u8>,
    total_bytes: usize,
    head_start: Option<usize>,
    scan_from: usize,
    head: Option<ParsedHead>,
    complete: bool,
}

impl HeadStreamParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len();
        if self.complete {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        let start = match self.head_start {
            Some(start) => start,
            None => {
                let Some(found) = find_head_open(&self.buffer[self.scan_from..]) else {
                    // `<head` plus the byte after it may straddle the next chunk.
                    self.scan_from = self.buffer.len().saturating_sub(HEAD_OPEN.len());
                    return;
                };
                let start = self.scan_from + found;
                self.head_start = Some(start);
                self.scan_from = start;
                start
            },
        };
        let Some(close) = find_ascii_ci(&self.buffer[self.scan_from..], HEAD_CLOSE) else {
            self.scan_from = self
                .buffer
                .len()
                .saturating_sub(HEAD_CLOSE.len() - 1)
                .max(start);
            return;
        };
        let end = self.scan_from + close + HEAD_CLOSE.len();
        self.complete = true;
        self.head = std::str::from_utf8(&self.buffer[start..end])
            .ok()
            .map(parse_head);
        self.buffer = Vec::new();
    }

    /// Returns `true` once the head has been located.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Total bytes fed so far.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Ends the stream.
    #[must_use]
    pub fn finish(self) -> HeadParseResult {
        HeadParseResult {
            total_bytes: self.total_bytes,
            head: self.head,
        }
    }
}

fn find_ascii_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

fn find_head_open(buffer: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = find_ascii_ci(&buffer[offset..], HEAD_OPEN) {
        let start = offset + found;
        match buffer.get(start + HEAD_OPEN.len()) {
            Some(b'>' | b' ' | b'\t' | b'\n' | b'\r' | b'/') => return Some(start),
            // `<header>` and friends.
            Some(_) => offset = start + HEAD_OPEN.len(),
            None => return None,
        }
    }
    None
}

/// Tokenizes the elements of a `<head>...</head>` fragment.
fn parse_head(html: &str) -> ParsedHead {
    let inner_start = html.find('>').map_or(html.len(), |i| i + 1);
    let inner_end = html.len() - HEAD_CLOSE.len();
    let mut elements = Vec::new();
    let mut rest = html.get(inner_start..inner_end).unwrap_or_default();

    while let Some(open) = rest.find('<') {
        rest = &rest[open..];
        if rest.starts_with("<!--") {
            rest = rest.find("-->").map_or("", |end| &rest[end + 3..]);
            continue;
        }
        let Some(name) = TAG_NAME_PATTERN.captures(rest).map(|c| c[1].to_ascii_lowercase())
        else {
            rest = &rest[1..];
            continue;
        };
        let Some(tag_end) = rest.find('>') else {
            break;
        };
        let attribute_source = &rest[1 + name.len()..tag_end];
        let attributes = ATTRIBUTE_PATTERN
            .captures_iter(attribute_source)
            .map(|captures| {
                let value = captures
                    .get(2)
                    .or_else(|| captures.get(3))
                    .or_else(|| captures.get(4))
                    .map_or("", |m| m.as_str());
                (captures[1].to_ascii_lowercase(), value.to_string())
            })
            .collect();
        rest = &rest[tag_end + 1..];

        let text = if RAW_TEXT_TAGS.contains(&name.as_str()) {
            let close = format!("</{name}");
            let end = find_ascii_ci(rest.as_bytes(), close.as_bytes()).unwrap_or(rest.len());
            let text = rest[..end].to_string();
            rest = &rest[end..];
            rest = rest.find('>').map_or("", |i| &rest[i + 1..]);
            Some(text)
        } else {
            None
        };
        elements.push(HeadElement {
            tag: name,
            attributes,
            text,
        });
    }

    ParsedHead {
        html: html.to_string(),
        elements,
    }
}

// =============================================================================
// Sanitizer
// =============================================================================

/// A runtime extension requested by the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadExtension {
    /// Extension id, e.g. `amp-carousel`.
    pub id: String,
    /// Extension version, e.g. `0.1`.
    pub version: String,
}

/// An approved head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedHead {
    /// Extensions to install.
    pub extensions: Vec<HeadExtension>,
    /// Font stylesheet URLs to install.
    pub fonts: Vec<String>,
    /// Sanitized head markup.
    pub head: String,
}

/// Boundary to the head sanitizer.
pub trait HeadSanitizer: Send + Sync {
    /// Approves or rejects a parsed head.
    fn process_head(&self, head: &ParsedHead) -> Option<ValidatedHead>;
}

/// Font stylesheet hosts accepted by [`AllowlistHeadSanitizer`].
pub const FONT_PROVIDER_HOSTS: [&str; 5] = [
    "cdn.materialdesignicons.com",
    "cloud.typography.com",
    "fast.fonts.net",
    "fonts.googleapis.com",
    "use.typekit.net",
];

/// Returns `true` for an `https:` URL on an allowlisted font host.
#[must_use]
pub fn is_allowed_font_url(href: &str) -> bool {
    Url::parse(href).is_ok_and(|url| {
        url.scheme() == "https"
            && url.port().is_none()
            && url
                .host_str()
                .is_some_and(|host| FONT_PROVIDER_HOSTS.contains(&host))
    })
}

const RUNTIME_SCRIPTS: [&str; 2] = [
    "https://cdn.ampproject.org/v0.js",
    "https://cdn.ampproject.org/amp4ads-v0.js",
];

/// A conservative allowlist sanitizer.
///
/// Accepts runtime and extension scripts from the AMP CDN, JSON data
/// scripts, `amp-custom` and boilerplate styles, allowlisted font
/// stylesheets, resource hints, titles and non-`http-equiv` meta tags.
/// Anything else rejects the head. The runtime script is dropped from the
/// rebuilt head since the embed installs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowlistHeadSanitizer;

impl HeadSanitizer for AllowlistHeadSanitizer {
    fn process_head(&self, head: &ParsedHead) -> Option<ValidatedHead> {
        let mut extensions = Vec::new();
        let mut seen = BTreeSet::new();
        let mut fonts = Vec::new();
        let mut kept = Vec::new();

        for element in &head.elements {
            match element.tag.as_str() {
                "meta" => {
                    if element.has_attr("http-equiv") {
                        return None;
                    }
                    kept.push(element);
                },
                "title" => kept.push(element),
                "style" => {
                    if !(element.has_attr("amp-custom") || element.has_attr("amp4ads-boilerplate"))
                    {
                        return None;
                    }
                    kept.push(element);
                },
                "link" => match element.attr("rel").map(str::to_ascii_lowercase).as_deref() {
                    Some("stylesheet") => {
                        let href = element.attr("href")?;
                        if !is_allowed_font_url(href) {
                            return None;
                        }
                        fonts.push(href.to_string());
                    },
                    Some("preconnect" | "dns-prefetch" | "icon") => kept.push(element),
                    _ => return None,
                },
                "script" => {
                    if element.attr("type") == Some("application/json") {
                        kept.push(element);
                        continue;
                    }
                    let src = element.attr("src")?;
                    if RUNTIME_SCRIPTS.contains(&src) {
                        continue;
                    }
                    let captures = EXTENSION_SRC_PATTERN.captures(src)?;
                    let id = captures[1].to_string();
                    let declared = element
                        .attr("custom-element")
                        .or_else(|| element.attr("custom-template"));
                    if declared != Some(id.as_str()) {
                        return None;
                    }
                    if seen.insert(id.clone()) {
                        extensions.push(HeadExtension {
                            id,
                            version: captures[2].to_string(),
                        });
                    }
                },
                _ => return None,
            }
        }

        let mut rebuilt = String::from("<head>");
        for element in kept {
            rebuilt.push_str(&element.to_html());
        }
        rebuilt.push_str("</head>");
        Some(ValidatedHead {
            extensions,
            fonts,
            head: rebuilt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &str = concat!(
        "<head><meta charset=\"utf-8\">",
        "<script async src=\"https://cdn.ampproject.org/amp4ads-v0.js\"></script>",
        "<script async custom-element=\"amp-carousel\" src=\"https://cdn.ampproject.org/v0/amp-carousel-0.2.js\"></script>",
        "<link rel=\"stylesheet\" href=\"https://fonts.googleapis.com/css?family=Lato\">",
        "<style amp4ads-boilerplate>body{visibility:hidden}</style>",
        "<style amp-custom>.a{color:red}</style>",
        "</head>",
    );

    fn parse_chunked(body: &str, chunk_size: usize) -> HeadParseResult {
        let mut parser = HeadStreamParser::new();
        for chunk in body.as_bytes().chunks(chunk_size) {
            parser.push(chunk);
        }
        parser.finish()
    }

    #[test]
    fn test_head_found_across_chunks() {
        let body = format!("<!doctype html><html amp4ads>{HEAD}<body><header>x</header></body></html>");
        for chunk_size in [1, 3, 7, 64, 4096] {
            let result = parse_chunked(&body, chunk_size);
            assert_eq!(result.total_bytes, body.len());
            let head = result.head.unwrap();
            assert_eq!(head.html, HEAD);
            assert_eq!(head.elements.len(), 6, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_elements_tokenized() {
        let head = parse_chunked(HEAD, 4096).head.unwrap();
        let tags: Vec<_> = head.elements.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, ["meta", "script", "script", "link", "style", "style"]);
        assert_eq!(head.elements[0].attr("charset"), Some("utf-8"));
        assert_eq!(head.elements[2].attr("custom-element"), Some("amp-carousel"));
        assert!(head.elements[1].has_attr("async"));
        assert_eq!(head.elements[5].text.as_deref(), Some(".a{color:red}"));
    }

    #[test]
    fn test_header_element_is_not_head() {
        let result = parse_chunked("<html><header>x</header><HEAD></HEAD></html>", 5);
        assert_eq!(result.head.unwrap().html, "<HEAD></HEAD>");
        assert!(parse_chunked("<html><header></header>", 4).head.is_none());
    }

    #[test]
    fn test_allowlist_sanitizer_accepts() {
        let head = parse_chunked(HEAD, 4096).head.unwrap();
        let validated = AllowlistHeadSanitizer.process_head(&head).unwrap();
        assert_eq!(
            validated.extensions,
            vec![HeadExtension {
                id: "amp-carousel".to_string(),
                version: "0.2".to_string(),
            }]
        );
        assert_eq!(
            validated.fonts,
            vec!["https://fonts.googleapis.com/css?family=Lato"]
        );
        assert!(validated.head.starts_with("<head><meta charset=\"utf-8\">"));
        assert!(!validated.head.contains("amp4ads-v0.js"));
        assert!(validated.head.contains("<style amp-custom>.a{color:red}</style>"));
    }

    #[test]
    fn test_font_url_host_must_match_exactly() {
        assert!(is_allowed_font_url("https://fonts.googleapis.com/css?family=Lato"));
        assert!(is_allowed_font_url("https://FONTS.googleapis.com/css"));
        assert!(!is_allowed_font_url("https://fonts.googleapis.com.evil.example/x.css"));
        assert!(!is_allowed_font_url("https://fonts.googleapis.comevil.example/x.css"));
        assert!(!is_allowed_font_url("https://evil.example/fonts.googleapis.com/x.css"));
        assert!(!is_allowed_font_url("https://fonts.googleapis.com@evil.example/x.css"));
        assert!(!is_allowed_font_url("http://fonts.googleapis.com/css"));
        assert!(!is_allowed_font_url("https://fonts.googleapis.com:8443/css"));
        assert!(!is_allowed_font_url("//fonts.googleapis.com/css"));
    }

    #[test]
    fn test_head_split_at_every_offset() {
        let body = format!("<html><header>x</header>{HEAD}<body></body></html>");
        for split in 0..=body.len() {
            let mut parser = HeadStreamParser::new();
            parser.push(&body.as_bytes()[..split]);
            parser.push(&body.as_bytes()[split..]);
            let head = parser.finish().head.unwrap_or_else(|| panic!("split {split}"));
            assert_eq!(head.html, HEAD, "split {split}");
        }
    }

    #[test]
    fn test_headless_body_scan_resumes() {
        let mut parser = HeadStreamParser::new();
        for _ in 0..10_000 {
            parser.push(b"<p>no head here</p>");
        }
        assert_eq!(parser.scan_from, parser.buffer.len() - HEAD_OPEN.len());
        parser.push(b"<head></he");
        parser.push(b"ad>");
        assert!(parser.is_complete());
        assert_eq!(parser.finish().head.unwrap().html, "<head></head>");
    }

    #[test]
    fn test_allowlist_sanitizer_rejects() {
        for bad in [
            "<head><script src=\"https://evil.example/x.js\"></script></head>",
            "<head><script>alert(1)</script></head>",
            "<head><meta http-equiv=\"refresh\" content=\"0\"></head>",
            "<head><link rel=\"stylesheet\" href=\"https://evil.example/a.css\"></head>",
            "<head><link rel=\"stylesheet\" href=\"https://fonts.googleapis.com.evil.example/x.css\"></head>",
            "<head><style>p{}</style></head>",
            "<head><base href=\"https://evil.example/\"></head>",
        ] {
            let head = parse_chunked(bad, 4096).head.unwrap();
            assert!(
                AllowlistHeadSanitizer.process_head(&head).is_none(),
                "accepted {bad}"
            );
        }
    }
}
