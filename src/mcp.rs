//! Remote MCP tool servers: HTTP JSON-RPC client, tool wrapper and the
//! registration service that attaches manifest-declared servers to an agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::agent::ChatAgent;
use crate::auth::TokenProvider;
use crate::chat::ChatClient;
use crate::config::{McpServer, ToolingManifest};
use crate::error::{Error, Result};
use crate::protocol::{
    ClientInfo, McpRequest, McpResponse, ToolCallResult, ToolDefinition, ToolsListResult,
    PROTOCOL_VERSION,
};
use crate::tools::{Tool, ToolRegistry};

const SESSION_HEADER: &str = "mcp-session-id";

// =============================================================================
// Client
// =============================================================================

/// JSON-RPC client for one MCP server reached over HTTP.
pub struct McpClient {
    name: String,
    url: String,
    http: reqwest::Client,
    auth_token: Option<String>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http: reqwest::Client::new(),
            auth_token,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, request: &McpRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(session) = self.session_id.read().await.as_ref() {
            builder = builder.header(SESSION_HEADER, session);
        }
        Ok(builder.send().await?)
    }

    /// Send a request and return its `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = McpRequest::new(id, method, params);
        debug!(server = self.name.as_str(), method, id, "Sending MCP request");

        let response = self.post(&request).await?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        let status = response.status();
        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "{} returned HTTP {status}: {body}",
                self.name
            )));
        }

        let response = if is_stream {
            parse_event_stream(&body, id)?
        } else {
            serde_json::from_str::<McpResponse>(&body)?
        };
        response.into_result()
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&self) -> Result<()> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": ClientInfo::default(),
                }),
            )
            .await?;
        debug!(
            server = self.name.as_str(),
            version = ?result.get("protocolVersion"),
            "MCP server initialized"
        );

        let response = self
            .post(&McpRequest::notification("notifications/initialized"))
            .await?;
        if !response.status().is_success() {
            warn!(
                server = self.name.as_str(),
                status = %response.status(),
                "initialized notification was not accepted"
            );
        }
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.request("tools/list", json!({})).await?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Pick the JSON-RPC response for `id` out of a server-sent event stream body.
pub fn parse_event_stream(body: &str, id: u64) -> Result<McpResponse> {
    let mut data = String::new();
    let mut found = None;

    let mut flush = |data: &mut String| {
        if data.is_empty() {
            return;
        }
        if let Ok(response) = serde_json::from_str::<McpResponse>(data) {
            if response.id.as_ref().and_then(Value::as_u64) == Some(id) {
                found = Some(response);
            }
        }
        data.clear();
    };

    for line in body.lines() {
        if let Some(chunk) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(chunk.trim_start());
        } else if line.is_empty() {
            flush(&mut data);
        }
    }
    flush(&mut data);

    found.ok_or_else(|| Error::Protocol(format!("no response for request {id} in event stream")))
}

// =============================================================================
// Tool wrapper
// =============================================================================

/// One remote tool, exposed to the model as `{server}_{tool}`.
pub struct RemoteTool {
    exposed_name: String,
    definition: ToolDefinition,
    client: Arc<McpClient>,
}

impl RemoteTool {
    pub fn new(server_name: &str, definition: ToolDefinition, client: Arc<McpClient>) -> Self {
        Self {
            exposed_name: format!("{}_{}", server_name, definition.name),
            definition,
            client,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.definition.name
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.exposed_name.clone(),
            ..self.definition.clone()
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolCallResult> {
        self.client.call_tool(&self.definition.name, arguments).await
    }
}

// =============================================================================
// Registration service
// =============================================================================

/// How MCP requests are authenticated.
#[derive(Clone)]
pub enum McpAuth {
    /// Delegated identity: a token per server scope from the provider, or
    /// none when no provider is available.
    Agentic(Option<Arc<dyn TokenProvider>>),
    /// Static bearer token sent to every server.
    Bearer(String),
}

/// Scope to request for a server, qualified with its audience.
pub fn server_scope(server: &McpServer) -> String {
    let audience = server.audience.trim_end_matches('/');
    let scope = if server.scope.is_empty() {
        ".default"
    } else {
        server.scope.as_str()
    };
    if audience.is_empty() || scope.starts_with(audience) || scope.contains("://") {
        scope.to_string()
    } else {
        format!("{audience}/{scope}")
    }
}

/// Attaches manifest-declared tool servers to a chat agent.
pub struct McpToolRegistrationService {
    servers: Vec<McpServer>,
    server_host: String,
    clients: Mutex<Vec<Arc<McpClient>>>,
}

impl McpToolRegistrationService {
    /// `server_host` resolves relative server URLs.
    pub fn new(manifest: &ToolingManifest, server_host: impl Into<String>) -> Self {
        Self {
            servers: manifest.mcp_servers.clone(),
            server_host: server_host.into(),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn resolve_url(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        if self.server_host.is_empty() {
            return Err(Error::Config(format!(
                "relative MCP server url {url} requires MCP_SERVER_HOST"
            )));
        }
        Ok(format!(
            "{}/{}",
            self.server_host.trim_end_matches('/'),
            url.trim_start_matches('/')
        ))
    }

    async fn connect(&self, server: &McpServer, auth: &McpAuth) -> Result<Vec<Arc<dyn Tool>>> {
        let url = self.resolve_url(&server.url)?;
        let token = match auth {
            McpAuth::Bearer(token) if !token.is_empty() => Some(token.clone()),
            McpAuth::Bearer(_) => None,
            McpAuth::Agentic(Some(provider)) => {
                Some(provider.acquire_token(&[server_scope(server)]).await?)
            }
            McpAuth::Agentic(None) => None,
        };

        let client = Arc::new(McpClient::new(&server.mcp_server_name, url, token));
        client.initialize().await?;
        let tools = client.list_tools().await?;
        info!(
            server = server.mcp_server_unique_name.as_str(),
            tools = tools.len(),
            "Connected to MCP server"
        );

        self.clients.lock().await.push(client.clone());
        Ok(tools
            .into_iter()
            .map(|def| {
                Arc::new(RemoteTool::new(&server.mcp_server_name, def, client.clone()))
                    as Arc<dyn Tool>
            })
            .collect())
    }

    /// Connect every declared server and build an agent carrying
    /// `initial_tools` plus all discovered remote tools. Servers that fail
    /// to connect are skipped.
    pub async fn add_tool_servers_to_agent(
        &self,
        chat_client: Arc<dyn ChatClient>,
        agent_instructions: &str,
        initial_tools: Vec<Arc<dyn Tool>>,
        auth: McpAuth,
    ) -> Result<ChatAgent> {
        let connections = join_all(self.servers.iter().map(|s| self.connect(s, &auth))).await;

        let mut registry = ToolRegistry::with_tools(initial_tools);
        for (server, connection) in self.servers.iter().zip(connections) {
            match connection {
                Ok(tools) => {
                    for tool in tools {
                        registry.register(tool);
                    }
                }
                Err(e) => warn!(
                    server = server.mcp_server_unique_name.as_str(),
                    "Skipping MCP server: {}", e
                ),
            }
        }

        info!(tools = registry.len(), "Tool servers attached to agent");
        Ok(ChatAgent::new(chat_client, agent_instructions).with_tools(registry))
    }

    /// Drop all server connections.
    pub async fn cleanup(&self) {
        let mut clients = self.clients.lock().await;
        for client in clients.iter() {
            debug!(server = client.name(), "Closing MCP connection");
        }
        clients.clear();
    }

    pub async fn connected(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! In-process MCP server answering the handshake, `tools/list` and
    //! `tools/call` (the latter as an event stream).

    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::{PROTOCOL_VERSION, SESSION_HEADER};

    pub const SESSION_ID: &str = "session-1";

    /// One received JSON-RPC message and the headers it carried.
    #[derive(Debug, Clone)]
    pub struct Received {
        pub method: String,
        pub session: Option<String>,
        pub authorization: Option<String>,
    }

    #[derive(Clone, Default)]
    pub struct Recorder(Arc<Mutex<Vec<Received>>>);

    impl Recorder {
        pub fn received(&self) -> Vec<Received> {
            self.0.lock().unwrap().clone()
        }

        pub fn count(&self, method: &str) -> usize {
            self.received().iter().filter(|r| r.method == method).count()
        }
    }

    fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    async fn handle(
        State(recorder): State<Recorder>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        let method = body["method"].as_str().unwrap_or_default().to_string();
        recorder.0.lock().unwrap().push(Received {
            method: method.clone(),
            session: header_value(&headers, SESSION_HEADER),
            authorization: header_value(&headers, "authorization"),
        });

        let id = body["id"].clone();
        match method.as_str() {
            "initialize" => (
                [(SESSION_HEADER, SESSION_ID)],
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "mail", "version": "1.0.0" }
                    }
                })),
            )
                .into_response(),
            "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
            "tools/list" => Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [{
                        "name": "send",
                        "description": "Send mail",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "to": { "type": "string" } }
                        }
                    }]
                }
            }))
            .into_response(),
            "tools/call" => {
                let to = body["params"]["arguments"]["to"].as_str().unwrap_or("nobody");
                let payload = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": format!("sent to {to}") }],
                        "isError": false
                    }
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    format!("event: message\ndata: {payload}\n\n"),
                )
                    .into_response()
            }
            _ => Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "unknown method" }
            }))
            .into_response(),
        }
    }

    /// Serve on an ephemeral port and return the endpoint URL.
    pub async fn spawn() -> (String, Recorder) {
        let recorder = Recorder::default();
        let app = Router::new()
            .route("/mcp", post(handle))
            .with_state(recorder.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}/mcp"), recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    struct NoopChat;

    #[async_trait]
    impl ChatClient for NoopChat {
        fn model(&self) -> &str {
            "noop"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatMessage> {
            Ok(ChatMessage::assistant("ok"))
        }
    }

    /// Hands out a token naming the scope it was requested for.
    struct ScopeToken;

    #[async_trait]
    impl TokenProvider for ScopeToken {
        async fn acquire_token(&self, scopes: &[String]) -> Result<String> {
            Ok(format!("token-for-{}", scopes.join(" ")))
        }
    }

    fn server(scope: &str, audience: &str) -> McpServer {
        McpServer {
            mcp_server_name: "mail".into(),
            mcp_server_unique_name: "mcp_mail".into(),
            url: "/mcp/mail".into(),
            scope: scope.into(),
            audience: audience.into(),
        }
    }

    #[test]
    fn test_remote_tool_name_is_prefixed() {
        let client = Arc::new(McpClient::new("mail", "http://127.0.0.1:1", None));
        let tool = RemoteTool::new(
            "mail",
            ToolDefinition {
                name: "send".into(),
                description: "Send mail".into(),
                input_schema: json!({ "type": "object" }),
            },
            client,
        );
        assert_eq!(tool.definition().name, "mail_send");
        assert_eq!(tool.definition().description, "Send mail");
        assert_eq!(tool.remote_name(), "send");
    }

    #[test]
    fn test_server_scope_qualification() {
        assert_eq!(server_scope(&server("Mail.Read", "api://mail")), "api://mail/Mail.Read");
        assert_eq!(server_scope(&server("", "api://mail/")), "api://mail/.default");
        assert_eq!(
            server_scope(&server("api://mail/Mail.Read", "api://mail")),
            "api://mail/Mail.Read"
        );
        assert_eq!(server_scope(&server("Mail.Read", "")), "Mail.Read");
    }

    #[test]
    fn test_resolve_url() {
        let manifest = ToolingManifest { mcp_servers: vec![server("", "")] };
        let service = McpToolRegistrationService::new(&manifest, "https://host.example/");
        assert_eq!(
            service.resolve_url("/mcp/mail").unwrap(),
            "https://host.example/mcp/mail"
        );
        assert_eq!(
            service.resolve_url("https://other/x").unwrap(),
            "https://other/x"
        );

        let bare = McpToolRegistrationService::new(&manifest, "");
        assert!(bare.resolve_url("/mcp/mail").is_err());
    }

    #[test]
    fn test_parse_event_stream_matches_id() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"tools\":[]}}\n\n";
        let response = parse_event_stream(body, 7).unwrap();
        assert_eq!(response.into_result().unwrap(), json!({ "tools": [] }));

        assert!(parse_event_stream(body, 8).is_err());
    }

    #[tokio::test]
    async fn test_client_handshake_replays_session() {
        let (url, recorder) = test_server::spawn().await;
        let client = McpClient::new("mail", &url, Some("secret-token".into()));

        client.initialize().await.unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "send");
        assert_eq!(tools[0].input_schema["properties"]["to"]["type"], "string");

        let result = client
            .call_tool("send", json!({ "to": "a@b.c" }))
            .await
            .unwrap();
        assert_eq!(result.text(), "sent to a@b.c");

        let received = recorder.received();
        let methods: Vec<_> = received.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(
            methods,
            ["initialize", "notifications/initialized", "tools/list", "tools/call"]
        );
        assert!(received[0].session.is_none());
        for request in &received[1..] {
            assert_eq!(request.session.as_deref(), Some(test_server::SESSION_ID));
        }
        assert!(received
            .iter()
            .all(|r| r.authorization.as_deref() == Some("Bearer secret-token")));
    }

    #[tokio::test]
    async fn test_remote_tools_reach_agent() {
        let (url, recorder) = test_server::spawn().await;
        let mut mail = server("Mail.Read", "api://mail");
        mail.url = url;
        let manifest = ToolingManifest { mcp_servers: vec![mail] };
        let service = McpToolRegistrationService::new(&manifest, "");

        let agent = service
            .add_tool_servers_to_agent(
                Arc::new(NoopChat),
                "be brief",
                Vec::new(),
                McpAuth::Agentic(Some(Arc::new(ScopeToken))),
            )
            .await
            .unwrap();

        let names: Vec<_> = agent
            .tools()
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["mail_send"]);
        assert_eq!(service.connected().await, 1);
        assert_eq!(
            recorder.received()[0].authorization.as_deref(),
            Some("Bearer token-for-api://mail/Mail.Read")
        );

        let result = agent
            .tools()
            .execute("mail_send", json!({ "to": "x@y.z" }))
            .await
            .unwrap();
        assert_eq!(result.text(), "sent to x@y.z");

        service.cleanup().await;
        assert_eq!(service.connected().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_servers_are_skipped() {
        // Relative URL with no host fails before any network access.
        let manifest = ToolingManifest { mcp_servers: vec![server("", "")] };
        let service = McpToolRegistrationService::new(&manifest, "");
        let agent = service
            .add_tool_servers_to_agent(
                Arc::new(NoopChat),
                "be brief",
                Vec::new(),
                McpAuth::Bearer(String::new()),
            )
            .await
            .unwrap();

        assert!(agent.tools().is_empty());
        assert_eq!(service.connected().await, 0);
    }
}
