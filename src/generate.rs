//! The tile-generation capability and its remote-node implementation.
//!
//! The request router does not care whether a miss is produced by the local
//! worker pool or a remote dispatcher node; both sides of the topology
//! implement [`TileGenerator`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::tile::TileCoord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Present(Bytes),
    Empty,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerateError {
    /// The per-request budget elapsed. Surfaces as 503.
    #[error("generation timed out")]
    Timeout,
    /// No worker slot is ready to take the request. Surfaces as 503.
    #[error("no worker available")]
    Unavailable,
    /// The backend answered, but with an error. Surfaces as 500.
    #[error("backend error: {0}")]
    Backend(String),
    /// The backend went away mid-request. Surfaces as 500.
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait TileGenerator: Send + Sync {
    async fn generate(&self, coord: &TileCoord) -> Result<GenerateOutcome, GenerateError>;
}

/// A remote dispatcher node addressed by the `(host, port)` of a descriptor.
pub struct RemoteNode {
    base: String,
    client: Client,
    timeout: Duration,
}

impl RemoteNode {
    pub fn new(host: &str, port: u16, client: Client, timeout: Duration) -> Self {
        Self {
            base: format!("http://{host}:{port}"),
            client,
            timeout,
        }
    }

    /// Enqueue or run a pyramid build on the remote node.
    pub async fn pyramid(&self, datasource_id: &str) -> Result<(), GenerateError> {
        let url = format!("{}/api/pyramid", self.base);
        debug!("Forwarding pyramid for {datasource_id} to {}", self.base);
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&json!({ "datasource_id": datasource_id }))
            .send()
            .await
            .map_err(classify)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GenerateError::Backend(format!(
                "remote node answered {}",
                response.status()
            )))
        }
    }
}

fn classify(e: reqwest::Error) -> GenerateError {
    if e.is_timeout() {
        GenerateError::Timeout
    } else {
        GenerateError::Transport(e.to_string())
    }
}

#[async_trait]
impl TileGenerator for RemoteNode {
    async fn generate(&self, coord: &TileCoord) -> Result<GenerateOutcome, GenerateError> {
        let url = format!("{}{}", self.base, coord.uri_path());
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(GenerateOutcome::Empty),
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(classify)?;
                if bytes.is_empty() {
                    Ok(GenerateOutcome::Empty)
                } else {
                    Ok(GenerateOutcome::Present(bytes))
                }
            }
            status => Err(GenerateError::Backend(format!(
                "remote node answered {status}"
            ))),
        }
    }
}
