//! Upstream tool-server seam
//!
//! Spawning, pooling, and wire framing of real MCP servers live outside the
//! enforcement core; the enforcer only needs something that can execute a
//! permitted request.

use async_trait::async_trait;

use aegis_core::error::{Error, Result};
use aegis_core::request::InboundRequest;

/// A tool server on the far side of the proxy
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Execute a permitted request and return its response payload
    async fn call(&self, req: &InboundRequest) -> Result<serde_json::Value>;
}

/// Forwards requests to an HTTP backend as JSON
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUpstream {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("upstream client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, req: &InboundRequest) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        let resp = resp
            .error_for_status()
            .map_err(|e| Error::upstream(e.to_string()))?;

        resp.json()
            .await
            .map_err(|e| Error::upstream(format!("invalid upstream response: {}", e)))
    }
}

/// Echoes the request back; used for dry runs without a backend
pub struct EchoUpstream;

#[async_trait]
impl Upstream for EchoUpstream {
    async fn call(&self, req: &InboundRequest) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "echo": true,
            "method": req.method.as_str(),
            "name": req.name,
            "uri": req.uri,
        }))
    }
}
