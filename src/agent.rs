//! Chat agent and the hosted agent wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::Authorization;
use crate::chat::{AzureOpenAiChatClient, ChatClient, ChatMessage};
use crate::config::{AgentConfig, AuthConfig};
use crate::error::{Error, Result};
use crate::mcp::{McpAuth, McpToolRegistrationService};
use crate::tools::ToolRegistry;
use crate::turn::TurnContext;

/// Returned instead of an error when a message arrives before `initialize`.
pub const NOT_INITIALIZED: &str = "Agent not initialized";

/// Upper bound on model/tool round trips per message.
pub const MAX_TOOL_ROUNDS: usize = 8;

// =============================================================================
// ChatAgent
// =============================================================================

/// A chat client paired with system instructions and a tool set.
#[derive(Clone)]
pub struct ChatAgent {
    chat_client: Arc<dyn ChatClient>,
    instructions: String,
    tools: ToolRegistry,
}

impl ChatAgent {
    pub fn new(chat_client: Arc<dyn ChatClient>, instructions: impl Into<String>) -> Self {
        Self {
            chat_client,
            instructions: instructions.into(),
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Answer `message`, executing any tool calls the model requests.
    pub async fn run(&self, message: &str) -> Result<String> {
        let definitions = self.tools.definitions();
        let mut messages = vec![
            ChatMessage::system(&self.instructions),
            ChatMessage::user(message),
        ];

        for round in 0..MAX_TOOL_ROUNDS {
            let reply = self.chat_client.complete(&messages, &definitions).await?;
            if reply.tool_calls.is_empty() {
                return Ok(reply.content.unwrap_or_default());
            }

            debug!(round, calls = reply.tool_calls.len(), "Model requested tool calls");
            let calls = reply.tool_calls.clone();
            messages.push(reply);

            for call in calls {
                let output = match call.function.parsed_arguments() {
                    Ok(args) => match self.tools.execute(&call.function.name, args).await {
                        Ok(result) if result.is_error => {
                            format!("Error: {}", or_placeholder(result.text()))
                        }
                        Ok(result) => or_placeholder(result.text()),
                        Err(e) => {
                            warn!(tool = call.function.name.as_str(), "Tool call failed: {}", e);
                            format!("Error: {}", e)
                        }
                    },
                    Err(e) => format!("Error: invalid arguments: {}", e),
                };
                messages.push(ChatMessage::tool(call.id, output));
            }
        }

        Err(Error::Internal(format!(
            "no answer after {MAX_TOOL_ROUNDS} tool rounds"
        )))
    }
}

fn or_placeholder(text: String) -> String {
    if text.is_empty() {
        "(no output)".to_string()
    } else {
        text
    }
}

// =============================================================================
// AgentInterface
// =============================================================================

/// Contract between the HTTP host and an agent implementation.
#[async_trait]
pub trait AgentInterface: Send + Sync {
    /// Prepare clients and services. Called once at host startup.
    async fn initialize(&self) -> Result<()>;

    /// Produce the reply text for one user message.
    async fn process_user_message(
        &self,
        message: &str,
        auth: &Authorization,
        auth_handler_name: &str,
        context: &TurnContext,
    ) -> Result<String>;

    /// Release resources. Called at host shutdown.
    async fn cleanup(&self) -> Result<()>;
}

// =============================================================================
// Agent365Agent
// =============================================================================

/// Azure OpenAI chat agent with lazily attached MCP tool servers.
pub struct Agent365Agent {
    config: AgentConfig,
    auth: AuthConfig,
    chat_client: RwLock<Option<Arc<dyn ChatClient>>>,
    agent: RwLock<Option<ChatAgent>>,
    tool_service: RwLock<Option<Arc<McpToolRegistrationService>>>,
    mcp_initialized: Mutex<bool>,
}

impl Agent365Agent {
    pub fn new(config: AgentConfig, auth: AuthConfig) -> Self {
        if config.enable_observability {
            info!(
                "✅ Observability enabled (OTEL: {}, A365 Exporter: {})",
                config.enable_otel, config.enable_a365_observability_exporter
            );
        }

        Self {
            config,
            auth,
            chat_client: RwLock::new(None),
            agent: RwLock::new(None),
            tool_service: RwLock::new(None),
            mcp_initialized: Mutex::new(false),
        }
    }

    /// Configuration and credentials from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AgentConfig::from_env()?, AuthConfig::from_env()))
    }

    /// Use `client` instead of constructing an Azure OpenAI client.
    pub fn with_chat_client(self, client: Arc<dyn ChatClient>) -> Self {
        Self {
            chat_client: RwLock::new(Some(client)),
            ..self
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.agent.read().await.is_some()
    }

    pub async fn mcp_initialized(&self) -> bool {
        *self.mcp_initialized.lock().await
    }

    /// Attach declared tool servers on first use.
    async fn setup_mcp(&self, authorization: &Authorization, handler_name: &str) -> Result<()> {
        if !self.config.enable_mcp {
            return Ok(());
        }
        let Some(service) = self.tool_service.read().await.clone() else {
            return Ok(());
        };

        let mut initialized = self.mcp_initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let auth = if self.auth.use_agentic_auth {
            info!("Using agentic authentication for MCP");
            McpAuth::Agentic(authorization.token_provider(handler_name))
        } else {
            info!("Using bearer token authentication for MCP");
            McpAuth::Bearer(self.auth.bearer_token.clone())
        };

        let chat_client = self
            .chat_client
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)?;
        let agent = service
            .add_tool_servers_to_agent(chat_client, &self.config.instructions, Vec::new(), auth)
            .await?;

        *self.agent.write().await = Some(agent);
        *initialized = true;
        info!("✅ MCP servers configured");
        Ok(())
    }

    async fn process_message(
        &self,
        message: &str,
        authorization: &Authorization,
        handler_name: &str,
    ) -> Result<String> {
        if !self.is_initialized().await {
            return Ok(NOT_INITIALIZED.to_string());
        }

        self.setup_mcp(authorization, handler_name).await?;

        if self.config.enable_sensitive_data {
            info!("📨 Processing: {}", message);
        } else {
            info!(chars = message.chars().count(), "📨 Processing message");
        }

        let agent = self
            .agent
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)?;
        agent.run(message).await
    }
}

#[async_trait]
impl AgentInterface for Agent365Agent {
    async fn initialize(&self) -> Result<()> {
        let chat_client = {
            let mut slot = self.chat_client.write().await;
            slot.get_or_insert_with(|| {
                Arc::new(AzureOpenAiChatClient::from_config(&self.config)) as Arc<dyn ChatClient>
            })
            .clone()
        };

        *self.agent.write().await = Some(ChatAgent::new(chat_client, &self.config.instructions));

        if self.config.enable_mcp {
            let manifest = self.config.tooling_manifest.clone().unwrap_or_default();
            let service = McpToolRegistrationService::new(&manifest, &self.config.mcp_server_host);
            if self.config.tooling_manifest.is_some() {
                info!(
                    "✅ MCP tool service initialized ({} servers)",
                    service.server_count()
                );
            } else {
                info!("✅ MCP tool service initialized (no servers)");
            }
            *self.tool_service.write().await = Some(Arc::new(service));
        }

        info!("✅ Agent365Agent initialized");
        Ok(())
    }

    async fn process_user_message(
        &self,
        message: &str,
        auth: &Authorization,
        auth_handler_name: &str,
        context: &TurnContext,
    ) -> Result<String> {
        debug!(
            handler = auth_handler_name,
            conversation = context.activity().conversation_id(),
            "Dispatching user message"
        );
        self.process_message(message, auth, auth_handler_name).await
    }

    async fn cleanup(&self) -> Result<()> {
        if let Some(service) = self.tool_service.read().await.as_ref() {
            service.cleanup().await;
        }
        info!("Agent cleanup completed");
        Ok(())
    }
}
