//! Creative validation.
//!
//! Decides whether a fetched creative may render first-party. Two flows
//! exist, selected by [`ValidationFlow`]:
//!
//! - **Signed**: the whole body is buffered, its signature is verified and
//!   the embedded metadata block is extracted.
//! - **Trustless**: the body is streamed through [`HeadStreamParser`] and the
//!   parsed `<head>` is approved or rejected by a [`HeadSanitizer`].
//!
//! Either way the raw body is retained so cross-domain rendering can still
//! run when validation rejects the creative.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::adapter::NetworkAdapter;
use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::config::{EngineConfig, SlotConfig, ValidationFlow};
use crate::error::{PipelineError, Signal};
use crate::generation::GenerationToken;
use crate::head::{HeadSanitizer, HeadStreamParser, ValidatedHead};
use crate::host::{HostDocument, Preconnector};
use crate::metadata::{CreativeMetadata, extract_metadata_from_bytes, is_secure_url};
use crate::signature::{SignatureVerifier, VerificationStatus};
use crate::transport::StreamingResponse;

/// A creative approved for first-party rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum ValidatedCreative {
    /// Signature-verified creative.
    Signed(CreativeMetadata),
    /// Structurally validated creative.
    Trustless {
        /// Sanitized head.
        head: ValidatedHead,
        /// Creative body.
        #[serde(skip)]
        body: Bytes,
    },
}

impl ValidatedCreative {
    /// Returns the signed metadata, if any.
    #[must_use]
    pub const fn metadata(&self) -> Option<&CreativeMetadata> {
        match self {
            Self::Signed(metadata) => Some(metadata),
            Self::Trustless { .. } => None,
        }
    }
}

/// Result of validation.
#[derive(Debug, Clone)]
pub struct ValidationOutput {
    /// The approved creative, `None` to fall back to cross-domain rendering.
    pub creative: Option<ValidatedCreative>,
    /// Raw body retained for cross-domain rendering.
    pub body: Bytes,
    /// Signature status, for the signed flow.
    pub status: Option<VerificationStatus>,
}

impl ValidationOutput {
    const fn fallback(body: Bytes, status: Option<VerificationStatus>) -> Self {
        Self {
            creative: None,
            body,
            status,
        }
    }
}

/// Validates one response.
pub struct CreativeValidator<'a> {
    /// Engine configuration.
    pub engine: &'a EngineConfig,
    /// Slot configuration.
    pub slot: &'a SlotConfig,
    /// Network adapter.
    pub adapter: &'a dyn NetworkAdapter,
    /// Hosting document.
    pub document: &'a dyn HostDocument,
    /// Signature verifier, for the signed flow.
    pub verifier: Option<&'a SignatureVerifier>,
    /// Head sanitizer, for the trustless flow.
    pub sanitizer: Option<&'a dyn HeadSanitizer>,
    /// Resource hints.
    pub preconnector: &'a dyn Preconnector,
    /// Analytics sink.
    pub analytics: &'a dyn AnalyticsSink,
}

impl CreativeValidator<'_> {
    /// Validates `response`.
    ///
    /// # Errors
    ///
    /// - [`Signal::NoContent`] for an empty body.
    /// - [`PipelineError::InvalidSpsaResponse`] when a story ad fails
    ///   validation.
    /// - [`PipelineError::Transport`] when reading the body fails.
    /// - [`PipelineError::Cancelled`] when the generation went stale.
    pub async fn validate(
        &self,
        response: StreamingResponse,
        token: &GenerationToken,
    ) -> Result<ValidationOutput, PipelineError> {
        token.check()?;
        self.analytics
            .trigger(&self.slot.network_type, AnalyticsEvent::AdResponseValidateStart);
        match self.engine.flow {
            ValidationFlow::Signed => self.validate_signed(response, token).await,
            ValidationFlow::Trustless => self.validate_streaming(response, token).await,
        }
    }

    async fn validate_signed(
        &self,
        response: StreamingResponse,
        token: &GenerationToken,
    ) -> Result<ValidationOutput, PipelineError> {
        let response = response.buffer().await?;
        token.check()?;
        if response.bytes.is_empty() {
            return Err(Signal::NoContent.into());
        }

        let status = if self.slot.is_unsigned_test_creative() {
            VerificationStatus::Ok
        } else if let Some(verifier) = self.verifier {
            verifier.load_keysets().await;
            token.check()?;
            let status = verifier.verify(&response.bytes, &response.headers).await;
            token.check()?;
            status
        } else {
            VerificationStatus::CryptoUnavailable
        };
        debug!(network = %self.slot.network_type, ?status, "signature verification finished");

        if self.slot.is_spsa && status != VerificationStatus::Ok {
            return Err(PipelineError::invalid_spsa(format!(
                "signature verification failed: {status:?}"
            )));
        }
        let accepted = match status {
            VerificationStatus::Ok => true,
            VerificationStatus::CryptoUnavailable => {
                self.adapter.supports_preferential_render_without_crypto()
            },
            VerificationStatus::ErrorKeyNotFound | VerificationStatus::ErrorSignatureMismatch => {
                error!(
                    network = %self.slot.network_type,
                    ?status,
                    "signature verification failed"
                );
                false
            },
            VerificationStatus::Unverified => false,
        };
        if !accepted {
            return Ok(ValidationOutput::fallback(response.bytes, Some(status)));
        }

        let metadata = match extract_metadata_from_bytes(&response.bytes, self.slot.is_spsa) {
            Ok(metadata) => metadata,
            Err(err) if self.slot.is_spsa => {
                return Err(PipelineError::invalid_spsa(err.to_string()));
            },
            Err(err) => {
                warn!(network = %self.slot.network_type, error = %err, "invalid creative metadata");
                return Ok(ValidationOutput::fallback(response.bytes, Some(status)));
            },
        };

        for extension in metadata.extension_ids() {
            self.preconnector.preload_extension(&extension);
        }
        for href in metadata.font_urls() {
            self.preconnector.preload(&href);
        }
        for image in metadata.images.iter().flatten() {
            if is_secure_url(image) {
                self.preconnector.preload(image);
            }
        }

        Ok(ValidationOutput {
            creative: Some(ValidatedCreative::Signed(metadata)),
            body: response.bytes,
            status: Some(status),
        })
    }

    async fn validate_streaming(
        &self,
        response: StreamingResponse,
        token: &GenerationToken,
    ) -> Result<ValidationOutput, PipelineError> {
        let sanitizer = match self.sanitizer {
            Some(sanitizer)
                if self.document.supports_secure_frames()
                    && !self.adapter.skip_client_side_validation(&response.headers) =>
            {
                sanitizer
            },
            _ => {
                debug!(network = %self.slot.network_type, "skipping streaming validation");
                let response = response.buffer().await?;
                token.check()?;
                if response.bytes.is_empty() {
                    return Err(Signal::NoContent.into());
                }
                return Ok(ValidationOutput::fallback(response.bytes, None));
            },
        };

        let mut parser = HeadStreamParser::new();
        let mut buffer = BytesMut::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            token.check()?;
            let chunk = chunk?;
            parser.push(&chunk);
            buffer.extend_from_slice(&chunk);
        }
        token.check()?;

        let parsed = parser.finish();
        if parsed.total_bytes == 0 {
            return Err(Signal::NoContent.into());
        }
        let body = buffer.freeze();
        let Some(head) = parsed.head.and_then(|head| sanitizer.process_head(&head)) else {
            debug!(network = %self.slot.network_type, "head rejected by sanitizer");
            return Ok(ValidationOutput::fallback(body, None));
        };

        for extension in &head.extensions {
            self.preconnector.preload_extension(&extension.id);
        }
        for font in &head.fonts {
            self.preconnector.preload(font);
        }
        Ok(ValidationOutput {
            creative: Some(ValidatedCreative::Trustless {
                head,
                body: body.clone(),
            }),
            body,
            status: None,
        })
    }
}
