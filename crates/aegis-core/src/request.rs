//! Normalized inbound request

use serde::{Deserialize, Serialize};

/// MCP methods the proxy mediates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpMethod {
    #[serde(rename = "tools/list")]
    ToolsList,

    #[serde(rename = "tools/call")]
    ToolsCall,

    #[serde(rename = "resources/list")]
    ResourcesList,

    #[serde(rename = "resources/read")]
    ResourcesRead,
}

impl McpMethod {
    /// The verb namespace used as the context action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
        }
    }
}

/// A request normalized by the transport adapter before enforcement
///
/// The wire framing (stdio, streamable HTTP) is the adapter's concern; by the
/// time a request reaches the enforcer it has this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRequest {
    /// MCP method being invoked
    pub method: McpMethod,

    /// Tool name for `tools/call`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Resource URI for `resources/read`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Tool arguments for `tools/call`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,

    /// Caller identity
    pub agent_id: String,

    /// Session the request belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Request id echoed back on errors for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Caller classification, if the adapter knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,

    /// Caller trust score in [0, 1], if assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,

    /// Chain of agents this request was delegated through, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation_chain: Vec<String>,

    /// Emergency override flag
    #[serde(default)]
    pub emergency: bool,

    /// Client IP as seen by the transport adapter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl InboundRequest {
    /// Create a minimal `tools/call` request
    pub fn tool_call(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            method: McpMethod::ToolsCall,
            name: Some(name.into()),
            uri: None,
            arguments: None,
            agent_id: agent_id.into(),
            session_id: None,
            request_id: None,
            agent_type: None,
            trust_score: None,
            delegation_chain: Vec::new(),
            emergency: false,
            client_ip: None,
        }
    }

    /// Create a minimal `resources/read` request
    pub fn resource_read(agent_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: McpMethod::ResourcesRead,
            name: None,
            uri: Some(uri.into()),
            arguments: None,
            agent_id: agent_id.into(),
            session_id: None,
            request_id: None,
            agent_type: None,
            trust_score: None,
            delegation_chain: Vec::new(),
            emergency: false,
            client_ip: None,
        }
    }

    /// Set tool arguments
    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Set the client IP
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Set the delegation chain
    pub fn with_delegation_chain(mut self, chain: Vec<String>) -> Self {
        self.delegation_chain = chain;
        self
    }
}
