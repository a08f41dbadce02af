//! Reportable error handling.
//!
//! Reportable errors are tagged with the network type and, when known, the
//! query string of the ad URL (truncated to [`MAX_QUERY_LENGTH`]
//! characters). In development mode every report is logged at error level.
//! In production it is logged as a warning and escalated as an "expected
//! error" with probability `error_sample_rate`.
//!
//! Signals and cancellations are never reported.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::{error, warn};

use crate::config::{EngineConfig, EngineMode};
use crate::error::PipelineError;

/// Maximum number of characters of the ad URL query kept in a report.
pub const MAX_QUERY_LENGTH: usize = 250;

/// Source of uniform samples in `[0, 1)`.
pub type Sampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// A tagged error report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// `fast-fetch: <network>: <error>`.
    pub message: String,
    /// Truncated ad URL query.
    pub ad_query: Option<String>,
    /// The report was escalated past the log.
    pub escalated: bool,
}

/// Tags, logs and samples reportable errors for one slot.
#[derive(Clone)]
pub struct ErrorReporter {
    network_type: String,
    mode: EngineMode,
    sample_rate: f64,
    sampler: Sampler,
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("network_type", &self.network_type)
            .field("mode", &self.mode)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl ErrorReporter {
    /// Creates a reporter sampling with the thread RNG.
    #[must_use]
    pub fn new(network_type: impl Into<String>, engine: &EngineConfig) -> Self {
        Self::with_sampler(
            network_type,
            engine,
            Arc::new(|| rand::thread_rng().r#gen::<f64>()),
        )
    }

    /// Creates a reporter with an explicit sampler.
    #[must_use]
    pub fn with_sampler(
        network_type: impl Into<String>,
        engine: &EngineConfig,
        sampler: Sampler,
    ) -> Self {
        Self {
            network_type: network_type.into(),
            mode: engine.mode,
            sample_rate: engine.error_sample_rate,
            sampler,
        }
    }

    /// Reports `err`. Returns `None` for signals and cancellations.
    pub fn report(&self, err: &PipelineError, ad_url: Option<&str>) -> Option<ErrorReport> {
        if !err.is_reportable() {
            return None;
        }
        let message = format!("fast-fetch: {}: {err}", self.network_type);
        let ad_query = ad_url.and_then(truncated_query);
        let escalated = match self.mode {
            EngineMode::Development => {
                error!(network = %self.network_type, ad_query = ?ad_query, "{message}");
                true
            },
            EngineMode::Production => {
                warn!(network = %self.network_type, ad_query = ?ad_query, "{message}");
                let escalated = (self.sampler)() < self.sample_rate;
                if escalated {
                    error!(network = %self.network_type, expected = true, "{message}");
                }
                escalated
            },
        };
        Some(ErrorReport {
            message,
            ad_query,
            escalated,
        })
    }
}

/// Returns the query of `ad_url` (after the first `?`), at most
/// [`MAX_QUERY_LENGTH`] characters long.
#[must_use]
pub fn truncated_query(ad_url: &str) -> Option<String> {
    let (_, query) = ad_url.split_once('?')?;
    Some(query.chars().take(MAX_QUERY_LENGTH).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Signal;

    fn engine(mode: EngineMode) -> EngineConfig {
        EngineConfig {
            mode,
            error_sample_rate: 0.01,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_signals_and_cancellation_not_reported() {
        let reporter = ErrorReporter::new("doubleclick", &engine(EngineMode::Development));
        assert!(reporter.report(&Signal::NoContent.into(), None).is_none());
        assert!(reporter.report(&PipelineError::cancelled(3), None).is_none());
    }

    #[test]
    fn test_tagging_and_truncation() {
        let reporter = ErrorReporter::new("doubleclick", &engine(EngineMode::Development));
        let url = format!("https://ads.example/ad?{}", "q".repeat(400));
        let report = reporter
            .report(&PipelineError::internal("boom"), Some(&url))
            .unwrap();
        assert_eq!(report.message, "fast-fetch: doubleclick: internal error: boom");
        assert_eq!(report.ad_query.map(|q| q.len()), Some(MAX_QUERY_LENGTH));
        assert!(report.escalated);
    }

    #[test]
    fn test_production_sampling() {
        let escalate = ErrorReporter::with_sampler(
            "test",
            &engine(EngineMode::Production),
            Arc::new(|| 0.001),
        );
        let drop = ErrorReporter::with_sampler(
            "test",
            &engine(EngineMode::Production),
            Arc::new(|| 0.5),
        );
        let err = PipelineError::internal("boom");
        assert!(escalate.report(&err, None).unwrap().escalated);
        assert!(!drop.report(&err, None).unwrap().escalated);
    }

    #[test]
    fn test_query_without_question_mark() {
        assert_eq!(truncated_query("https://ads.example/ad"), None);
        assert_eq!(truncated_query("https://a/?x=1?y").as_deref(), Some("x=1?y"));
    }
}
