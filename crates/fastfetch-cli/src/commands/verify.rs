//! `fastfetch verify`: check a creative signature against a local keyset.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Args;
use fastfetch_core::config::{SigningServiceConfig, VerifierConfig};
use fastfetch_core::headers::SIGNATURE_HEADER;
use fastfetch_core::signature::{
    KeysetFetcher, SignatureVerifier, VerificationStatus, VerifierError,
};
use http::{HeaderMap, HeaderValue};
use serde::Serialize;

use super::{FORMATS, print_json};

/// Arguments for `fastfetch verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// JWK set file of the signing service
    #[arg(long)]
    pub keyset: PathBuf,

    /// Signing service name
    #[arg(long, default_value = "google")]
    pub service: String,

    /// Creative file
    #[arg(long)]
    pub creative: PathBuf,

    /// Signature header value (`<service>:<kid>:<base64>`)
    #[arg(long)]
    pub signature: String,

    /// Output format (`text` or `json`)
    #[arg(long, default_value = "text", value_parser = FORMATS)]
    pub format: String,
}

/// Serves a keyset from a file.
struct FileKeysetFetcher {
    path: PathBuf,
}

#[async_trait]
impl KeysetFetcher for FileKeysetFetcher {
    async fn fetch_keyset(&self, service: &SigningServiceConfig) -> Result<Vec<u8>, VerifierError> {
        std::fs::read(&self.path)
            .map_err(|err| VerifierError::fetch(&service.name, err.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    service: String,
    status: VerificationStatus,
}

/// Runs the command. Fails unless the signature verifies.
pub async fn run(args: &VerifyArgs) -> Result<()> {
    let creative = std::fs::read(&args.creative)
        .with_context(|| format!("failed to read {}", args.creative.display()))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&args.signature).context("signature is not a valid header value")?,
    );

    let config = VerifierConfig {
        crypto_available: true,
        signing_services: vec![SigningServiceConfig {
            name: args.service.clone(),
            keyset_url: format!("file://{}", args.keyset.display()),
        }],
    };
    let fetcher = Arc::new(FileKeysetFetcher {
        path: args.keyset.clone(),
    });
    let verifier = SignatureVerifier::new(config, fetcher);
    let status = verifier.verify(&creative, &headers).await;

    let report = VerifyReport {
        service: args.service.clone(),
        status,
    };
    if args.format == "json" {
        print_json(&report)?;
    } else {
        println!("{}: {:?}", report.service, report.status);
    }
    if status != VerificationStatus::Ok {
        bail!("signature verification failed: {status:?}");
    }
    Ok(())
}
