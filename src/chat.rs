//! Chat-completion client for an Azure OpenAI deployment.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::protocol::ToolDefinition;

const COGNITIVE_SERVICES_RESOURCE: &str = "https://cognitiveservices.azure.com";

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the OpenAI chat-completions schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "null_as_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<ToolCall>, D::Error> {
    Ok(Option::<Vec<ToolCall>>::deserialize(d)?.unwrap_or_default())
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Result of a tool invocation, answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

/// Function name plus JSON-encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl FunctionCall {
    /// Decode the argument string; empty arguments decode to `{}`.
    pub fn parsed_arguments(&self) -> Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

/// Abstraction over a chat-completion backend.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Deployment or model identifier, for logging.
    fn model(&self) -> &str;

    /// Run one completion and return the assistant message.
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolDefinition])
        -> Result<ChatMessage>;
}

/// How requests to Azure OpenAI are authenticated.
#[derive(Debug, Clone)]
pub enum AzureCredential {
    /// Static `api-key` header.
    ApiKey(String),
    /// Bearer token from the signed-in Azure CLI.
    AzureCli,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_on: i64,
}

/// Azure OpenAI chat-completions client bound to one deployment.
pub struct AzureOpenAiChatClient {
    http: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    credential: AzureCredential,
    cli_token: Mutex<Option<CachedToken>>,
}

impl AzureOpenAiChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
        credential: AzureCredential,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            deployment: deployment.into(),
            api_version: api_version.into(),
            credential,
            cli_token: Mutex::new(None),
        }
    }

    /// Build from agent configuration: `api-key` when configured, Azure CLI otherwise.
    pub fn from_config(config: &AgentConfig) -> Self {
        let credential = match &config.api_key {
            Some(key) => AzureCredential::ApiKey(key.clone()),
            None => AzureCredential::AzureCli,
        };
        Self::new(
            &config.endpoint,
            &config.deployment,
            &config.api_version,
            credential,
        )
    }

    /// Full chat-completions URL for the bound deployment.
    pub fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    async fn cli_access_token(&self) -> Result<String> {
        let mut cached = self.cli_token.lock().await;
        let now = chrono::Utc::now().timestamp();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_on - 300 > now) {
            return Ok(token.token.clone());
        }

        debug!("Requesting access token from Azure CLI");
        let output = tokio::process::Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                COGNITIVE_SERVICES_RESOURCE,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| Error::Auth(format!("failed to run az: {e}")))?;

        if !output.status.success() {
            return Err(Error::Auth(format!(
                "az get-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token: CliToken = serde_json::from_slice(&output.stdout)?;
        let expires_on = token.expires_on.unwrap_or(now + 3600);
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_on,
        });
        Ok(token.access_token)
    }
}

#[derive(Deserialize)]
struct CliToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    expires_on: Option<i64>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec<'a>>,
}

#[derive(Serialize)]
struct ToolSpec<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec<'a>,
}

#[derive(Serialize)]
struct FunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// Pull the first choice's message out of a chat-completions response body.
pub fn parse_completion(body: &str) -> Result<ChatMessage> {
    let response: CompletionResponse = serde_json::from_str(body)?;
    response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| Error::Provider("response contained no choices".into()))
}

#[async_trait]
impl ChatClient for AzureOpenAiChatClient {
    fn model(&self) -> &str {
        &self.deployment
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage> {
        let payload = CompletionRequest {
            messages,
            tools: tools
                .iter()
                .map(|t| ToolSpec {
                    kind: "function",
                    function: FunctionSpec {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.input_schema,
                    },
                })
                .collect(),
        };

        info!(
            deployment = self.deployment.as_str(),
            messages = messages.len(),
            tools = tools.len(),
            "Sending chat completion request"
        );

        let request = self.http.post(self.completions_url()).json(&payload);
        let request = match &self.credential {
            AzureCredential::ApiKey(key) => request.header("api-key", key),
            AzureCredential::AzureCli => request.bearer_auth(self.cli_access_token().await?),
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Provider(format!("HTTP {status}: {body}")));
        }

        debug!("Received chat completion response");
        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completions_url() {
        let client = AzureOpenAiChatClient::new(
            "https://example.openai.azure.com/",
            "gpt-4o",
            "2024-02-15-preview",
            AzureCredential::ApiKey("k".into()),
        );
        assert_eq!(
            client.completions_url(),
            "https://example.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-02-15-preview"
        );
    }

    #[test]
    fn test_parse_text_completion() {
        let body = json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hello!" } }]
        })
        .to_string();
        let message = parse_completion(&body).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content.as_deref(), Some("Hello!"));
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn test_null_tool_calls_read_as_empty() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi","tool_calls":null}}]}"#;
        assert!(parse_completion(body).unwrap().tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_completion() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "mail_send", "arguments": "{\"to\":\"a@b.c\"}" }
                    }]
                }
            }]
        })
        .to_string();
        let message = parse_completion(&body).unwrap();
        assert!(message.content.is_none());
        let call = &message.tool_calls[0];
        assert_eq!(call.function.name, "mail_send");
        assert_eq!(call.function.parsed_arguments().unwrap()["to"], "a@b.c");
    }

    #[test]
    fn test_no_choices_is_provider_error() {
        let err = parse_completion(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn test_tool_message_serialization() {
        let value = serde_json::to_value(ChatMessage::tool("call_1", "done")).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn test_empty_arguments_parse_as_object() {
        let call = FunctionCall { name: "x".into(), arguments: String::new() };
        assert!(call.parsed_arguments().unwrap().is_object());
    }
}
