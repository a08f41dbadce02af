//! Consent resolution ahead of the ad request.
//!
//! The gate asks the consent-policy service for four independent pieces of
//! information. Each one degrades on failure to a documented default so a
//! misbehaving consent provider never blocks the ad request:
//!
//! | Piece        | Default on failure        |
//! |--------------|---------------------------|
//! | state        | [`ConsentState::Unknown`] |
//! | string       | `None`                    |
//! | metadata     | `None`                    |
//! | shared data  | `None`                    |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::generation::GenerationToken;

/// Consent policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    /// Consent was granted.
    Sufficient,
    /// Consent was denied.
    Insufficient,
    /// Consent could not be determined.
    Unknown,
    /// Consent is unknown but not required for this user.
    UnknownNotRequired,
}

/// Consent metadata published by the consent provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentMetadata {
    /// Format of the consent string.
    #[serde(default)]
    pub consent_string_type: Option<u32>,
    /// Whether GDPR applies to this user.
    #[serde(default)]
    pub gdpr_applies: Option<bool>,
    /// Additional consent string.
    #[serde(default)]
    pub additional_consent: Option<String>,
}

/// Consent snapshot for one generation.
///
/// Created once by the [`ConsentGate`] and passed by value to the URL
/// builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsentTuple {
    /// Consent state; `None` when the slot has no consent policy.
    pub consent_state: Option<ConsentState>,
    /// Raw consent string.
    pub consent_string: Option<String>,
    /// Format of the consent string.
    pub consent_string_type: Option<u32>,
    /// Whether GDPR applies.
    pub gdpr_applies: Option<bool>,
    /// Additional consent string.
    pub additional_consent: Option<String>,
    /// Opaque data shared by the consent provider.
    pub consent_shared_data: Option<serde_json::Value>,
}

/// Errors reported by the consent-policy service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsentError {
    /// The consent request was cancelled (e.g. the document was unloaded).
    #[error("consent resolution cancelled")]
    Cancelled,
    /// The consent policy failed to resolve.
    #[error("consent policy '{policy_id}' failed: {reason}")]
    Failed {
        /// The policy id.
        policy_id: String,
        /// Why it failed.
        reason: String,
    },
}

/// Boundary to the consent-policy subsystem.
#[async_trait]
pub trait ConsentPolicyService: Send + Sync {
    /// Resolves the consent state for a policy.
    async fn consent_state(&self, policy_id: &str) -> Result<ConsentState, ConsentError>;

    /// Resolves the consent string for a policy.
    async fn consent_string(&self, policy_id: &str) -> Result<Option<String>, ConsentError>;

    /// Resolves the consent metadata for a policy.
    async fn consent_metadata(
        &self,
        policy_id: &str,
    ) -> Result<Option<ConsentMetadata>, ConsentError>;

    /// Resolves the shared data for a policy.
    async fn consent_shared_data(
        &self,
        policy_id: &str,
    ) -> Result<Option<serde_json::Value>, ConsentError>;
}

/// Resolves the [`ConsentTuple`] for a generation.
pub struct ConsentGate<'a> {
    service: Option<&'a dyn ConsentPolicyService>,
}

impl<'a> ConsentGate<'a> {
    /// Creates a gate over an optional consent-policy service.
    #[must_use]
    pub const fn new(service: Option<&'a dyn ConsentPolicyService>) -> Self {
        Self { service }
    }

    /// Resolves consent for `policy_id`.
    ///
    /// Without a policy id the tuple is empty and nothing is awaited. A
    /// missing service is treated like a service that fails every lookup.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if the generation went stale
    /// while consent was resolving.
    pub async fn resolve(
        &self,
        policy_id: Option<&str>,
        token: &GenerationToken,
    ) -> Result<ConsentTuple, PipelineError> {
        token.check()?;
        let Some(policy_id) = policy_id else {
            return Ok(ConsentTuple::default());
        };
        let Some(service) = self.service else {
            warn!(policy_id, "consent policy configured without a consent service");
            return Ok(ConsentTuple {
                consent_state: Some(ConsentState::Unknown),
                ..ConsentTuple::default()
            });
        };

        let (state, string, metadata, shared_data) = tokio::join!(
            service.consent_state(policy_id),
            service.consent_string(policy_id),
            service.consent_metadata(policy_id),
            service.consent_shared_data(policy_id),
        );
        token.check()?;

        let consent_state = degrade(state, "state", ConsentState::Unknown);
        let consent_string = degrade(string, "string", None);
        let metadata = degrade(metadata, "metadata", None);
        let consent_shared_data = degrade(shared_data, "shared data", None);

        let metadata = metadata.unwrap_or_default();
        Ok(ConsentTuple {
            consent_state: Some(consent_state),
            consent_string,
            consent_string_type: metadata.consent_string_type,
            gdpr_applies: metadata.gdpr_applies,
            additional_consent: metadata.additional_consent,
            consent_shared_data,
        })
    }
}

fn degrade<T>(result: Result<T, ConsentError>, what: &str, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(ConsentError::Cancelled) => fallback,
        Err(err) => {
            warn!(error = %err, "error determining consent {what}");
            fallback
        },
    }
}
