//! HTTP transport to peer banks and the oracle

use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Header carrying the bank-level API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Whatever came back from an HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

impl HttpReply {
    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POSTs JSON documents. An `Err` means no HTTP response was obtained.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// POST `body` to `url`, authenticating with `api_key` when given
    async fn post(&self, url: &str, api_key: Option<&str>, body: String) -> Result<HttpReply>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    /// Client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn post(&self, url: &str, api_key: Option<&str>, body: String) -> Result<HttpReply> {
        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: reading body: {}", url, e)))?;

        Ok(HttpReply { status, body })
    }
}
