//! Creative signature verification.
//!
//! Signed creatives carry an `AMP-Fast-Fetch-Signature` header of the form
//! `<service>:<kid>:<base64 signature>`. The signature is an Ed25519
//! signature over the raw creative bytes, checked against the public keyset
//! published by the named signing service.
//!
//! # Keyset Cache
//!
//! [`SignatureVerifier`] is constructed once per hosting document and shared
//! by every slot on it. Keysets are fetched on first use through
//! [`SignatureVerifier::load_keysets`], which is idempotent and may be
//! started before the ad request so the fetch overlaps the network round
//! trip. A key id missing from a loaded keyset triggers a single refetch of
//! that service's keyset (key rotation).
//!
//! # Status Mapping
//!
//! | Condition                              | Status                   |
//! |----------------------------------------|--------------------------|
//! | crypto unavailable on the platform     | `CryptoUnavailable`      |
//! | no signature header                    | `Unverified`             |
//! | unknown signing service                | `ErrorKeyNotFound`       |
//! | keyset could not be loaded             | `Unverified`             |
//! | key id unknown after refetch           | `ErrorKeyNotFound`       |
//! | malformed header or bad signature      | `ErrorSignatureMismatch` |
//! | valid signature                        | `Ok`                     |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::Verifier as _;
use ed25519_dalek::{Signature, VerifyingKey};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::config::{SigningServiceConfig, VerifierConfig};
use crate::headers::{SIGNATURE_HEADER, header_str};

// =============================================================================
// Types
// =============================================================================

/// Outcome of verifying one creative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// The signature is valid.
    Ok,
    /// The platform cannot verify signatures.
    CryptoUnavailable,
    /// The signing service or key id is unknown.
    ErrorKeyNotFound,
    /// The signature does not match the creative.
    ErrorSignatureMismatch,
    /// Verification was not possible.
    Unverified,
}

/// Errors from keyset handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    /// The keyset could not be fetched.
    #[error("failed to fetch keyset for '{service}': {reason}")]
    Fetch {
        /// Signing service name.
        service: String,
        /// Why the fetch failed.
        reason: String,
    },

    /// The keyset document is malformed.
    #[error("invalid keyset: {0}")]
    InvalidKeyset(String),
}

impl VerifierError {
    /// Creates a fetch error.
    #[must_use]
    pub fn fetch(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

/// Boundary for downloading keyset documents.
#[async_trait]
pub trait KeysetFetcher: Send + Sync {
    /// Returns the raw JWK set published by `service`.
    async fn fetch_keyset(&self, service: &SigningServiceConfig) -> Result<Vec<u8>, VerifierError>;
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    x: Option<String>,
}

/// Public keys of one signing service, by key id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyset {
    keys: HashMap<String, VerifyingKey>,
}

impl Keyset {
    /// Parses a JWK set, keeping the Ed25519 (`OKP`/`Ed25519`) keys.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::InvalidKeyset`] if the document is not a JWK
    /// set or an Ed25519 key is malformed.
    pub fn from_jwks(document: &[u8]) -> Result<Self, VerifierError> {
        let set: JwkSet = serde_json::from_slice(document)
            .map_err(|err| VerifierError::InvalidKeyset(err.to_string()))?;
        let mut keys = HashMap::new();
        for jwk in set.keys {
            if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
                debug!(kty = %jwk.kty, "skipping non-ed25519 key");
                continue;
            }
            let (Some(kid), Some(x)) = (jwk.kid, jwk.x) else {
                return Err(VerifierError::InvalidKeyset(
                    "ed25519 key without kid or x".to_string(),
                ));
            };
            let raw = URL_SAFE_NO_PAD
                .decode(x.trim_end_matches('='))
                .map_err(|err| VerifierError::InvalidKeyset(format!("key '{kid}': {err}")))?;
            let raw: [u8; 32] = raw.try_into().map_err(|_| {
                VerifierError::InvalidKeyset(format!("key '{kid}': expected 32 bytes"))
            })?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|err| VerifierError::InvalidKeyset(format!("key '{kid}': {err}")))?;
            keys.insert(kid, key);
        }
        Ok(Self { keys })
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(kid)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the keyset has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signing service name.
    pub service: String,
    /// Key id.
    pub kid: String,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    /// Parses `<service>:<kid>:<base64 signature>`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(3, ':');
        let service = parts.next().filter(|part| !part.is_empty())?;
        let kid = parts.next().filter(|part| !part.is_empty())?;
        let signature = STANDARD.decode(parts.next()?).ok()?;
        Some(Self {
            service: service.to_string(),
            kid: kid.to_string(),
            signature,
        })
    }
}

// =============================================================================
// SignatureVerifier
// =============================================================================

/// Verifies creative signatures against cached keysets.
pub struct SignatureVerifier {
    config: VerifierConfig,
    fetcher: Arc<dyn KeysetFetcher>,
    /// `None` marks a service whose keyset failed to load.
    keysets: RwLock<HashMap<String, Option<Keyset>>>,
    loaded: OnceCell<()>,
}

impl SignatureVerifier {
    /// Creates a verifier; no keyset is fetched until first use.
    #[must_use]
    pub fn new(config: VerifierConfig, fetcher: Arc<dyn KeysetFetcher>) -> Self {
        Self {
            config,
            fetcher,
            keysets: RwLock::new(HashMap::new()),
            loaded: OnceCell::new(),
        }
    }

    /// Returns `true` if the platform can verify signatures.
    #[must_use]
    pub const fn crypto_available(&self) -> bool {
        self.config.crypto_available
    }

    /// Fetches every configured keyset once.
    ///
    /// Concurrent and repeated calls share the first load.
    pub async fn load_keysets(&self) {
        if !self.config.crypto_available {
            return;
        }
        self.loaded
            .get_or_init(|| async {
                for service in &self.config.signing_services {
                    let keyset = self.fetch(service).await;
                    self.keysets
                        .write()
                        .await
                        .insert(service.name.clone(), keyset);
                }
            })
            .await;
    }

    /// Verifies `creative` against the signature in `headers`.
    pub async fn verify(&self, creative: &[u8], headers: &HeaderMap) -> VerificationStatus {
        if !self.config.crypto_available {
            return VerificationStatus::CryptoUnavailable;
        }
        let Some(value) = header_str(headers, &SIGNATURE_HEADER) else {
            debug!("creative has no signature header");
            return VerificationStatus::Unverified;
        };
        let Some(header) = SignatureHeader::parse(value) else {
            warn!(value, "malformed signature header");
            return VerificationStatus::ErrorSignatureMismatch;
        };
        let Some(service) = self
            .config
            .signing_services
            .iter()
            .find(|service| service.name == header.service)
        else {
            warn!(service = %header.service, "unknown signing service");
            return VerificationStatus::ErrorKeyNotFound;
        };

        self.load_keysets().await;
        let key = match self.lookup(&header.service, &header.kid).await {
            Lookup::Found(key) => key,
            Lookup::Unavailable => return VerificationStatus::Unverified,
            Lookup::MissingKid => {
                info!(service = %header.service, kid = %header.kid, "unknown key id, refetching keyset");
                let keyset = self.fetch(service).await;
                self.keysets
                    .write()
                    .await
                    .insert(header.service.clone(), keyset);
                match self.lookup(&header.service, &header.kid).await {
                    Lookup::Found(key) => key,
                    Lookup::Unavailable => return VerificationStatus::Unverified,
                    Lookup::MissingKid => return VerificationStatus::ErrorKeyNotFound,
                }
            },
        };

        let Ok(signature) = Signature::from_slice(&header.signature) else {
            return VerificationStatus::ErrorSignatureMismatch;
        };
        match key.verify(creative, &signature) {
            Ok(()) => VerificationStatus::Ok,
            Err(_) => VerificationStatus::ErrorSignatureMismatch,
        }
    }

    async fn lookup(&self, service: &str, kid: &str) -> Lookup {
        let keysets = self.keysets.read().await;
        match keysets.get(service) {
            Some(Some(keyset)) => keyset
                .get(kid)
                .copied()
                .map_or(Lookup::MissingKid, Lookup::Found),
            Some(None) | None => Lookup::Unavailable,
        }
    }

    async fn fetch(&self, service: &SigningServiceConfig) -> Option<Keyset> {
        let result = self
            .fetcher
            .fetch_keyset(service)
            .await
            .and_then(|document| Keyset::from_jwks(&document));
        match result {
            Ok(keyset) => {
                debug!(service = %service.name, keys = keyset.len(), "loaded keyset");
                Some(keyset)
            },
            Err(err) => {
                warn!(service = %service.name, error = %err, "keyset unavailable");
                None
            },
        }
    }
}

enum Lookup {
    Found(VerifyingKey),
    MissingKid,
    Unavailable,
}
