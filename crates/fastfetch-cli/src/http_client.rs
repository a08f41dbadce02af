//! HTTP implementations of the engine's network boundaries.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fastfetch_core::config::SigningServiceConfig;
use fastfetch_core::signature::{KeysetFetcher, VerifierError};
use fastfetch_core::transport::{
    BodyStream, FetchRequest, FetchResponse, Transport, TransportError,
};
use futures::StreamExt;
use tracing::debug;

/// User agent sent with every request.
const USER_AGENT: &str = concat!("fastfetch/", env!("CARGO_PKG_VERSION"));

fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")
}

/// Ad request transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        debug!(url = %request.url, with_credentials = request.with_credentials, "sending ad request");
        let response = self
            .client
            .get(&request.url)
            .send()
            .await
            .map_err(|err| TransportError::request(&request.url, err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body: BodyStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Body(err.to_string())))
            .boxed();
        Ok(FetchResponse {
            status,
            headers,
            body: Some(body),
        })
    }
}

/// Fetches signing keysets over HTTP.
#[derive(Debug, Clone)]
pub struct HttpKeysetFetcher {
    client: reqwest::Client,
}

impl HttpKeysetFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
        })
    }
}

#[async_trait]
impl KeysetFetcher for HttpKeysetFetcher {
    async fn fetch_keyset(&self, service: &SigningServiceConfig) -> Result<Vec<u8>, VerifierError> {
        let fail = |err: reqwest::Error| VerifierError::fetch(&service.name, err.to_string());
        let response = self
            .client
            .get(&service.keyset_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fail)?;
        let bytes = response.bytes().await.map_err(fail)?;
        Ok(bytes.to_vec())
    }
}
