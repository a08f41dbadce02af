//! Error types for the ad lifecycle pipeline.
//!
//! Pipeline failures fall into three tiers:
//!
//! - **Signals** ([`Signal`]): control-flow markers that short-circuit the
//!   pipeline to a terminal state (collapse, GET-iframe fallback, retry).
//!   They are never reported.
//! - **Cancellation**: a stage observed a stale generation. Cancellation is
//!   propagated to the outer boundary and dropped without logging.
//! - **Reportable errors**: everything else. These are tagged and sampled by
//!   [`crate::report::ErrorReporter`] and then converted into a "no
//!   validated creative" result so cross-domain rendering can still run.

use std::fmt;

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::generation::Generation;
use crate::render::RenderError;
use crate::signature::VerifierError;
use crate::transport::TransportError;

/// Control-flow markers used to short-circuit the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The ad server returned no creative; the slot collapses.
    NoContent,
    /// The fetch failed; the caller may retry through a GET iframe.
    NetworkFailure,
    /// XHR is disallowed for the network; skip straight to the GET iframe.
    IframeGet,
}

impl Signal {
    /// Returns the stable wire name of the signal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoContent => "NO-CONTENT-RESPONSE",
            Self::NetworkFailure => "NETWORK-FAILURE",
            Self::IframeGet => "IFRAME-GET",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can terminate one pipeline generation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A control-flow signal, not a true failure.
    #[error("pipeline short-circuited: {0}")]
    Signal(Signal),

    /// The generation this stage belongs to is no longer current.
    #[error("generation {generation} cancelled")]
    Cancelled {
        /// The stale generation.
        generation: Generation,
    },

    /// A single-page story ad failed validation. Story ads have no
    /// cross-domain fallback so this is fatal for the slot.
    #[error("invalid single-page story ad response: {reason}")]
    InvalidSpsaResponse {
        /// Why the response was rejected.
        reason: String,
    },

    /// The network adapter failed to build the ad request URL.
    #[error("ad url builder failed: {0}")]
    UrlBuilder(#[from] AdapterError),

    /// Reading the response failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The signature verifier could not be used.
    #[error(transparent)]
    Verifier(#[from] VerifierError),

    /// Rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Creates a cancellation error for a stale generation.
    #[must_use]
    pub const fn cancelled(generation: Generation) -> Self {
        Self::Cancelled { generation }
    }

    /// Creates an invalid story-ad response error.
    #[must_use]
    pub fn invalid_spsa(reason: impl Into<String>) -> Self {
        Self::InvalidSpsaResponse {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error is a stale-generation cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the control-flow signal carried by this error, if any.
    #[must_use]
    pub const fn signal(&self) -> Option<Signal> {
        match self {
            Self::Signal(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Returns `true` if this error should go through error reporting.
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        !matches!(self, Self::Signal(_) | Self::Cancelled { .. })
    }
}

impl From<Signal> for PipelineError {
    fn from(signal: Signal) -> Self {
        Self::Signal(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_wire_names() {
        assert_eq!(Signal::NoContent.to_string(), "NO-CONTENT-RESPONSE");
        assert_eq!(Signal::NetworkFailure.to_string(), "NETWORK-FAILURE");
        assert_eq!(Signal::IframeGet.to_string(), "IFRAME-GET");
    }

    #[test]
    fn test_error_tiers() {
        let signal = PipelineError::from(Signal::NoContent);
        assert_eq!(signal.signal(), Some(Signal::NoContent));
        assert!(!signal.is_reportable());
        assert!(!signal.is_cancellation());

        let cancelled = PipelineError::cancelled(7);
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_reportable());
        assert_eq!(cancelled.to_string(), "generation 7 cancelled");

        let spsa = PipelineError::invalid_spsa("missing ctaType");
        assert!(spsa.is_reportable());
        assert_eq!(spsa.signal(), None);
    }
}
