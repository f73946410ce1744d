//! Bridge from MCP server descriptors to registry executors.
//!
//! The wire protocol to a server is not implemented here: hosts bind an
//! `McpTransport` per transport kind. The `mock` transport is always bound and
//! echoes what it receives, which is enough for wiring tests and demos.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::util::BoxCloneSyncService;
use tower::BoxError;
use tracing::{info, warn};

use super::{ToolDef, ToolError, ToolRegistry, ToolSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Http,
    Stdio,
    Mock,
}

/// A tool advertised by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transport: McpTransportKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tool_definitions: Vec<McpToolDefinition>,
}

impl McpServerConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.server_id
        } else {
            &self.name
        }
    }
}

/// Moves one tool call to an MCP server and back.
pub trait McpTransport: Send + Sync + 'static {
    fn call_tool(
        &self,
        server: &McpServerConfig,
        tool: &str,
        arguments: Value,
    ) -> BoxFuture<'static, Result<Value, BoxError>>;
}

/// Echoes the call instead of contacting a server.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockTransport;

impl McpTransport for MockTransport {
    fn call_tool(
        &self,
        server: &McpServerConfig,
        tool: &str,
        arguments: Value,
    ) -> BoxFuture<'static, Result<Value, BoxError>> {
        let result = json!({
            "server_id": server.server_id,
            "tool_name": tool,
            "arguments": arguments,
            "transport": "mock",
        });
        Box::pin(async move { Ok(result) })
    }
}

/// Registers the tools of MCP servers into a `ToolRegistry`.
#[derive(Clone)]
pub struct McpBridge {
    transports: HashMap<McpTransportKind, Arc<dyn McpTransport>>,
}

impl Default for McpBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl McpBridge {
    pub fn new() -> Self {
        let mut transports: HashMap<McpTransportKind, Arc<dyn McpTransport>> = HashMap::new();
        transports.insert(McpTransportKind::Mock, Arc::new(MockTransport));
        Self { transports }
    }

    pub fn with_transport(mut self, kind: McpTransportKind, transport: Arc<dyn McpTransport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    /// Register every tool of `server`; returns how many were added.
    ///
    /// Disabled servers and servers whose transport is not bound contribute
    /// nothing. A tool whose name is already registered keeps the existing
    /// (local) definition.
    pub fn register_server(
        &self,
        registry: &ToolRegistry,
        server: &McpServerConfig,
    ) -> Result<usize, ToolError> {
        if !server.enabled {
            return Ok(0);
        }
        let Some(transport) = self.transports.get(&server.transport).cloned() else {
            warn!(
                server_id = %server.server_id,
                transport = ?server.transport,
                "no transport bound for MCP server; its tools are not offered"
            );
            return Ok(0);
        };

        let shared = Arc::new(server.clone());
        let mut added = 0;
        for definition in &server.tool_definitions {
            let name = definition.name.trim();
            if name.is_empty() {
                continue;
            }
            if registry.contains(name) {
                warn!(tool = name, server_id = %server.server_id, "MCP tool shadowed by an existing tool");
                continue;
            }
            let def = bridged_tool(name, definition, shared.clone(), transport.clone());
            match registry.register(def) {
                Ok(()) => added += 1,
                // lost a race with a concurrent registration of the same name
                Err(ToolError::Duplicate(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        info!(server_id = %server.server_id, tools = added, "MCP server registered");
        Ok(added)
    }
}

fn bridged_tool(
    name: &str,
    definition: &McpToolDefinition,
    server: Arc<McpServerConfig>,
    transport: Arc<dyn McpTransport>,
) -> ToolDef {
    let description = definition
        .description
        .clone()
        .unwrap_or_else(|| format!("MCP tool from {}", server.display_name()));
    let parameters = definition
        .parameters
        .clone()
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
    let tool_name = name.to_string();
    let timeout = Duration::from_secs(server.timeout_secs.max(1));
    let source = ToolSource::Mcp {
        server_id: server.server_id.clone(),
    };
    let svc = tower::service_fn(move |arguments: Value| {
        transport.call_tool(&server, &tool_name, arguments)
    });
    ToolDef::new(name, description, parameters, BoxCloneSyncService::new(svc))
        .with_timeout(timeout)
        .with_source(source)
}
