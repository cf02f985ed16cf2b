//! HTTP host binding an agent to the bot-framework messaging endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn, Instrument, Level};

use crate::agent::AgentInterface;
use crate::auth::{
    anonymous_claims, jwt_authorization, AgentAuthConfiguration, Authorization, ClaimsIdentity,
    ClientCredentialsTokenProvider, JwtValidator, TokenProvider,
};
use crate::config::{AuthConfig, HostConfig};
use crate::error::{Error, Result};
use crate::telemetry::Telemetry;
use crate::token_cache::AgenticTokenCache;
use crate::turn::TurnContext;

/// Name under which the client-credentials handler is registered.
pub const AUTH_HANDLER_NAME: &str = "AGENTIC";

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Builds the agent instance at startup.
pub type AgentFactory = Arc<dyn Fn() -> Result<Arc<dyn AgentInterface>> + Send + Sync>;

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Message text for logs; only the length when sensitive data is off.
fn loggable(text: &str, max_chars: usize, sensitive: bool) -> String {
    if sensitive {
        format!("{}...", preview(text, max_chars))
    } else {
        format!("<{} chars>", text.chars().count())
    }
}

/// Port to fall back to when `port` is taken.
fn next_port(port: u16) -> Result<u16> {
    port.checked_add(1)
        .ok_or_else(|| Error::Config(format!("port {port} is in use and has no successor")))
}

/// Hosts one agent behind `/api/messages`.
pub struct AgentHost {
    agent_name: String,
    factory: AgentFactory,
    agent_instance: RwLock<Option<Arc<dyn AgentInterface>>>,
    config: HostConfig,
    auth_handler_name: String,
    auth_config: Option<AgentAuthConfiguration>,
    authorization: Authorization,
    jwt: Option<Arc<JwtValidator>>,
    telemetry: Telemetry,
}

impl AgentHost {
    pub fn new(
        agent_name: impl Into<String>,
        factory: AgentFactory,
        config: HostConfig,
        auth: &AuthConfig,
    ) -> Self {
        let tokens = AgenticTokenCache::new();
        let telemetry = if config.enable_observability {
            Telemetry::configure(&config.service_name, &config.service_namespace, tokens)
        } else {
            Telemetry::disabled(tokens)
        };

        let auth_config = Self::create_auth_configuration(auth);
        let mut authorization = Authorization::anonymous();
        let jwt = match &auth_config {
            Some(cfg) => {
                authorization.add(
                    AUTH_HANDLER_NAME,
                    Arc::new(ClientCredentialsTokenProvider::new(cfg.clone())),
                );
                info!("✅ Registered authentication handler: {}", AUTH_HANDLER_NAME);
                Some(Arc::new(JwtValidator::new(cfg)))
            }
            None => {
                warn!("⚠️ No authentication - running in anonymous mode");
                None
            }
        };

        Self {
            agent_name: agent_name.into(),
            factory,
            agent_instance: RwLock::new(None),
            config,
            auth_handler_name: AUTH_HANDLER_NAME.into(),
            auth_config,
            authorization,
            jwt,
            telemetry,
        }
    }

    /// Replace the token provider behind the registered auth handler.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.authorization.add(self.auth_handler_name.clone(), provider);
        self
    }

    fn create_auth_configuration(auth: &AuthConfig) -> Option<AgentAuthConfiguration> {
        if let Some(cfg) = AgentAuthConfiguration::from_auth(auth) {
            info!("🔒 Using Client Credentials authentication");
            return Some(cfg);
        }

        if !auth.bearer_token.is_empty() {
            info!("🔑 Anonymous dev mode with bearer token");
        } else {
            warn!("⚠️ No auth env vars; running anonymous mode");
        }
        None
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_config.is_some()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub async fn is_initialized(&self) -> bool {
        self.agent_instance.read().await.is_some()
    }

    /// Create and initialize the agent if not done yet.
    pub async fn initialize_agent(&self) -> Result<()> {
        let mut instance = self.agent_instance.write().await;
        if instance.is_none() {
            let agent = (self.factory)()?;
            agent.initialize().await?;
            *instance = Some(agent);
        }
        Ok(())
    }

    pub async fn cleanup(&self) {
        if let Some(agent) = self.agent_instance.read().await.as_ref() {
            if let Err(e) = agent.cleanup().await {
                error!("Agent cleanup failed: {}", e);
            }
        }
    }

    fn greeting(&self) -> String {
        format!(
            "👋 **Hi there!** I'm **{}**, your AI assistant.\n\nHow can I help you today?",
            self.agent_name
        )
    }

    // =========================================================================
    // Turn handling
    // =========================================================================

    /// Route one inbound activity to its handler.
    pub async fn on_turn(&self, context: &TurnContext) -> Result<()> {
        let activity = context.activity();

        let is_help = activity
            .text
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("/help"));
        let greets = activity.is_conversation_update() && !activity.members_added.is_empty();

        if !(greets || activity.is_message()) {
            debug!(kind = activity.kind.as_str(), "Ignoring activity");
            return Ok(());
        }

        if let Err(e) = self.authorize_turn().await {
            warn!("Auth handler {} failed: {}", self.auth_handler_name, e);
            context
                .send_activity(format!("Sorry, I encountered an error: {e}"))
                .await;
            return Ok(());
        }

        if greets || (activity.is_message() && is_help) {
            context.send_activity(self.greeting()).await;
        } else {
            self.process_message(context).await;
        }
        Ok(())
    }

    /// With credentials configured, handlers only run once the auth handler
    /// can produce a token.
    async fn authorize_turn(&self) -> Result<()> {
        let Some(cfg) = &self.auth_config else {
            return Ok(());
        };
        self.authorization
            .exchange_token(&cfg.scopes, &self.auth_handler_name)
            .await
            .map(|_| ())
    }

    async fn process_message(&self, context: &TurnContext) {
        if let Err(e) = self.try_process_message(context).await {
            error!("❌ Error processing message: {}", e);
            context
                .send_activity(format!("Sorry, I encountered an error: {e}"))
                .await;
        }
    }

    async fn try_process_message(&self, context: &TurnContext) -> Result<()> {
        let Some((tenant_id, agent_id, agent)) = self.validate_agent_and_setup_context(context).await
        else {
            return Ok(());
        };

        let user_message = context.activity().text.clone().unwrap_or_default();
        info!(
            "📨 Processing message: {}",
            loggable(&user_message, 50, self.config.enable_sensitive_data)
        );

        let trimmed = user_message.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("/help") {
            return Ok(());
        }

        let span = self
            .telemetry
            .baggage()
            .tenant_id(&tenant_id)
            .agent_id(&agent_id)
            .build();

        async {
            let response = agent
                .process_user_message(
                    &user_message,
                    &self.authorization,
                    &self.auth_handler_name,
                    context,
                )
                .await?;
            info!(
                "✅ Sending response: {}",
                loggable(&response, 50, self.config.enable_sensitive_data)
            );
            context.send_activity(response).await;
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await
    }

    async fn validate_agent_and_setup_context(
        &self,
        context: &TurnContext,
    ) -> Option<(String, String, Arc<dyn AgentInterface>)> {
        let tenant_id = context.activity().recipient_tenant_id().to_string();
        let agent_id = context.activity().recipient_agentic_app_id().to_string();

        info!(
            "🔍 Validating context - tenant_id: {}, agent_id: {}",
            if tenant_id.is_empty() { "N/A" } else { tenant_id.as_str() },
            if agent_id.is_empty() { "N/A" } else { agent_id.as_str() },
        );

        let Some(agent) = self.agent_instance.read().await.clone() else {
            error!("❌ Agent instance not available");
            context
                .send_activity("❌ Sorry, the agent is not available.")
                .await;
            return None;
        };

        if !tenant_id.is_empty() && !agent_id.is_empty() && self.auth_config.is_some() {
            self.setup_observability_token(&tenant_id, &agent_id).await;
        }

        Some((tenant_id, agent_id, agent))
    }

    /// Exchange and cache the exporter token; failures only reach debug logs.
    async fn setup_observability_token(&self, tenant_id: &str, agent_id: &str) {
        match self
            .authorization
            .exchange_token(
                std::slice::from_ref(&self.config.observability_scope),
                &self.auth_handler_name,
            )
            .await
        {
            Ok(token) => self
                .telemetry
                .tokens()
                .cache_agentic_token(tenant_id, agent_id, token),
            Err(e) => debug!("Failed to cache observability token: {}", e),
        }
    }

    // =========================================================================
    // HTTP surface
    // =========================================================================

    /// Router with `/api/messages`, `/api/health` and middleware.
    pub fn router(self: Arc<Self>) -> Router {
        let mut app = Router::new()
            .route(
                "/api/messages",
                post(messages_handler).get(|| async { StatusCode::OK }),
            )
            .route("/api/health", get(health_handler))
            .with_state(self.clone());

        app = match &self.jwt {
            Some(validator) => app.layer(middleware::from_fn_with_state(
                validator.clone(),
                jwt_authorization,
            )),
            None => app.layer(middleware::from_fn(anonymous_claims)),
        };

        app.layer(middleware::from_fn_with_state(self, request_logger))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until Ctrl-C / SIGTERM. An occupied port is replaced by the next one.
    pub async fn run(self: Arc<Self>, port: Option<u16>) -> Result<()> {
        let mut port = port.unwrap_or(self.config.port);
        if port_in_use(&self.config.host, port).await {
            port = next_port(port)?;
        }

        let host = self.config.host.clone();
        println!("{}", "=".repeat(80));
        println!("{}", self.agent_name);
        println!("{}", "=".repeat(80));
        println!("Server: {}:{}", host, port);
        println!("Endpoint: http://{}:{}/api/messages", host, port);
        println!("Health: http://{}:{}/api/health\n", host, port);

        let listener = TcpListener::bind((host.as_str(), port)).await?;
        self.initialize_agent().await?;
        info!(%host, port, "Agent host ready");

        let served = axum::serve(listener, self.clone().router())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.cleanup().await;
        served.map_err(Error::Io)
    }
}

async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(500), TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn messages_handler(
    State(host): State<Arc<AgentHost>>,
    identity: Option<Extension<ClaimsIdentity>>,
    body: Bytes,
) -> Response {
    if let Some(Extension(identity)) = &identity {
        debug!(
            authenticated = identity.is_authenticated,
            kind = identity.authentication_type.as_str(),
            "Activity caller identity"
        );
    }

    let activity = match serde_json::from_slice(&body) {
        Ok(activity) => activity,
        Err(e) => {
            warn!("Rejecting malformed activity: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let context = TurnContext::new(activity);
    if let Err(e) = host.on_turn(&context).await {
        error!("Turn failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let replies = context.take_replies();
    if replies.is_empty() {
        StatusCode::ACCEPTED.into_response()
    } else {
        Json(json!({ "activities": replies })).into_response()
    }
}

async fn health_handler(State(host): State<Arc<AgentHost>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "agent": host.agent_name,
        "initialized": host.is_initialized().await,
    }))
}

async fn request_logger(
    State(host): State<Arc<AgentHost>>,
    req: Request,
    next: Next,
) -> Response {
    info!("📥 Incoming request: {} {}", req.method(), req.uri().path());

    let req = if req.method() == Method::POST && tracing::enabled!(Level::DEBUG) {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
        };
        debug!(
            "Request body: {}",
            loggable(
                &String::from_utf8_lossy(&bytes),
                200,
                host.config.enable_sensitive_data
            )
        );
        Request::from_parts(parts, Body::from(bytes))
    } else {
        req
    };

    let response = next.run(req).await;
    info!("📤 Response status: {}", response.status());
    response
}
