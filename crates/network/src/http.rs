//! [`Transport`] over HTTP and JSON.

use crate::error::{NetworkError, Result};
use crate::message::{
    BlockAnnouncement, ChainSummary, Handshake, PeerList, TransactionAnnouncement,
};
use crate::transport::Transport;
use async_trait::async_trait;
use powchain_core::Block;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to the `/p2p/*` routes of other nodes.
#[derive(Clone)]
pub struct HttpTransport {
    /// HTTP client (reusable connection pool).
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Fails when the TLS backend or system resolver cannot be initialised.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(NetworkError::ClientSetup)?;
        Ok(Self { client })
    }

    fn url(addr: &str, path: &str) -> String {
        let addr = addr.trim_end_matches('/');
        if addr.starts_with("http://") || addr.starts_with("https://") {
            format!("{addr}{path}")
        } else {
            format!("http://{addr}{path}")
        }
    }

    fn map_send_error(addr: &str, operation: &'static str, err: reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::Timeout {
                operation,
                addr: addr.to_string(),
            }
        } else if err.is_connect() {
            NetworkError::ConnectionRefused(addr.to_string())
        } else {
            NetworkError::Protocol(format!("{operation} with {addr}: {err}"))
        }
    }

    async fn check_status(
        addr: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(NetworkError::Incompatible(body));
        }
        Err(NetworkError::UnexpectedStatus {
            addr: addr.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(
        addr: &str,
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T> {
        let response = Self::check_status(addr, response).await?;
        response
            .json()
            .await
            .map_err(|e| NetworkError::Protocol(format!("invalid {operation} response from {addr}: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, addr: &str, path: &str, operation: &'static str) -> Result<T> {
        let response = self
            .client
            .get(Self::url(addr, path))
            .send()
            .await
            .map_err(|e| Self::map_send_error(addr, operation, e))?;
        Self::decode(addr, operation, response).await
    }

    async fn post<B: serde::Serialize + ?Sized>(
        &self,
        addr: &str,
        path: &str,
        operation: &'static str,
        body: &B,
    ) -> Result<reqwest::Response> {
        self.client
            .post(Self::url(addr, path))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(addr, operation, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn handshake(&self, addr: &str, hello: &Handshake) -> Result<Handshake> {
        let response = self.post(addr, "/p2p/handshake", "handshake", hello).await?;
        Self::decode(addr, "handshake", response).await
    }

    async fn request_range(&self, addr: &str, from: u64, to: u64) -> Result<Vec<Block>> {
        let path = format!("/p2p/blocks?from={from}&to={to}");
        self.get(addr, &path, "range request").await
    }

    async fn send_block(&self, addr: &str, message: &BlockAnnouncement) -> Result<()> {
        let response = self.post(addr, "/p2p/block", "block relay", message).await?;
        Self::check_status(addr, response).await.map(|_| ())
    }

    async fn send_transaction(&self, addr: &str, message: &TransactionAnnouncement) -> Result<()> {
        let response = self
            .post(addr, "/p2p/transaction", "transaction relay", message)
            .await?;
        Self::check_status(addr, response).await.map(|_| ())
    }

    async fn status(&self, addr: &str) -> Result<ChainSummary> {
        self.get(addr, "/p2p/status", "status probe").await
    }

    async fn peers(&self, addr: &str) -> Result<Vec<String>> {
        let list: PeerList = self.get(addr, "/p2p/peers", "peer exchange").await?;
        Ok(list.peers)
    }
}
