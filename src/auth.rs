//! Inbound request authentication and outbound token acquisition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// OpenID metadata for tokens issued by the bot-framework channel service.
pub const BOT_FRAMEWORK_OPENID_METADATA: &str =
    "https://login.botframework.com/v1/.well-known/openidconfiguration";

/// Issuer of tokens minted by the bot-framework channel service.
pub const BOT_FRAMEWORK_ISSUER: &str = "https://api.botframework.com";

/// Minimum time between signing key refreshes triggered by unknown `kid`s.
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const AUDIENCE_CLAIM: &str = "aud";
pub const APP_ID_CLAIM: &str = "appid";

// =============================================================================
// Claims
// =============================================================================

/// Identity attached to each inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimsIdentity {
    pub claims: HashMap<String, Value>,
    pub is_authenticated: bool,
    pub authentication_type: String,
}

impl ClaimsIdentity {
    /// Identity used when the host runs without credentials.
    pub fn anonymous() -> Self {
        let claims = HashMap::from([
            (AUDIENCE_CLAIM.to_string(), Value::from("anonymous")),
            (APP_ID_CLAIM.to_string(), Value::from("anonymous-app")),
        ]);
        Self {
            claims,
            is_authenticated: false,
            authentication_type: "Anonymous".into(),
        }
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

// =============================================================================
// Handler configuration
// =============================================================================

/// Client-credentials configuration for the registered auth handler.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentAuthConfiguration {
    pub client_id: String,
    pub tenant_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

impl AgentAuthConfiguration {
    /// Only a complete `CLIENT_ID`/`TENANT_ID`/`CLIENT_SECRET` triple yields a
    /// configuration; anything less means anonymous mode.
    pub fn from_auth(auth: &AuthConfig) -> Option<Self> {
        if !auth.has_client_credentials() {
            return None;
        }
        Some(Self {
            client_id: auth.client_id.clone(),
            tenant_id: auth.tenant_id.clone(),
            client_secret: auth.client_secret.clone(),
            scopes: vec![crate::config::DEFAULT_SCOPE.to_string()],
        })
    }
}

// =============================================================================
// Outbound tokens
// =============================================================================

/// Source of access tokens for outbound calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a token valid for `scopes`.
    async fn acquire_token(&self, scopes: &[String]) -> Result<String>;
}

#[derive(Debug, Clone)]
struct IssuedToken {
    token: String,
    expires_at: i64,
}

/// Client-credentials grant against the Microsoft identity platform.
pub struct ClientCredentialsTokenProvider {
    http: reqwest::Client,
    authority: String,
    config: AgentAuthConfiguration,
    cache: Mutex<HashMap<String, IssuedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(config: AgentAuthConfiguration) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority: "https://login.microsoftonline.com".into(),
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Override the authority host.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority, self.config.tenant_id
        )
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn acquire_token(&self, scopes: &[String]) -> Result<String> {
        let scope = scopes.join(" ");
        let now = chrono::Utc::now().timestamp();

        let mut cache = self.cache.lock().await;
        if let Some(issued) = cache.get(&scope).filter(|t| t.expires_at - 60 > now) {
            return Ok(issued.token.clone());
        }

        debug!(scope = scope.as_str(), "Requesting client credentials token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];
        let response = self.http.post(self.token_url()).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let issued: TokenResponse = response.json().await?;
        cache.insert(
            scope,
            IssuedToken {
                token: issued.access_token.clone(),
                expires_at: now + issued.expires_in.unwrap_or(3600),
            },
        );
        Ok(issued.access_token)
    }
}

// =============================================================================
// Authorization
// =============================================================================

/// Named auth handlers available to turn processing.
#[derive(Clone, Default)]
pub struct Authorization {
    handlers: HashMap<String, Arc<dyn TokenProvider>>,
}

impl Authorization {
    /// No handlers: every exchange fails, agentic MCP calls go without a token.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, provider: Arc<dyn TokenProvider>) {
        self.handlers.insert(name.into(), provider);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn token_provider(&self, handler_id: &str) -> Option<Arc<dyn TokenProvider>> {
        self.handlers.get(handler_id).cloned()
    }

    /// Exchange the handler's credentials for a token valid for `scopes`.
    pub async fn exchange_token(&self, scopes: &[String], handler_id: &str) -> Result<String> {
        let provider = self
            .handlers
            .get(handler_id)
            .ok_or_else(|| Error::Auth(format!("no auth handler named {handler_id}")))?;
        provider.acquire_token(scopes).await
    }
}

// =============================================================================
// Inbound JWT validation
// =============================================================================

#[derive(Deserialize)]
struct OpenIdMetadata {
    jwks_uri: String,
}

/// Validates bearer tokens on inbound activities.
pub struct JwtValidator {
    http: reqwest::Client,
    metadata_url: String,
    audience: Vec<String>,
    issuer: Vec<String>,
    keys: RwLock<Option<JwkSet>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl JwtValidator {
    pub fn new(config: &AgentAuthConfiguration) -> Self {
        Self::with_metadata(config, BOT_FRAMEWORK_OPENID_METADATA)
    }

    pub fn with_metadata(config: &AgentAuthConfiguration, metadata_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            metadata_url: metadata_url.into(),
            audience: vec![config.client_id.clone()],
            issuer: vec![BOT_FRAMEWORK_ISSUER.to_string()],
            keys: RwLock::new(None),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = vec![issuer.into()];
        self
    }

    /// Seed the key set directly instead of discovering it.
    pub fn with_keys(mut self, keys: JwkSet) -> Self {
        self.keys = RwLock::new(Some(keys));
        self
    }

    async fn fetch_keys(&self) -> Result<JwkSet> {
        let metadata: OpenIdMetadata = self
            .http
            .get(&self.metadata_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let keys: JwkSet = self
            .http
            .get(&metadata.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(keys = keys.keys.len(), "Fetched signing keys");
        Ok(keys)
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(keys) = self.keys.read().await.as_ref() {
            if let Some(jwk) = keys.find(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|e| Error::Auth(e.to_string()));
            }
        }

        // Unknown kid: keys may have rotated. Refresh at most once per interval.
        {
            let mut last = self.last_refresh.lock().await;
            if last.is_some_and(|at| at.elapsed() < KEY_REFRESH_INTERVAL) {
                return Err(Error::Auth(format!("no signing key for kid {kid}")));
            }
            *last = Some(Instant::now());
        }

        let fresh = self.fetch_keys().await?;
        let key = fresh
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()
            .map_err(|e| Error::Auth(e.to_string()))?
            .ok_or_else(|| Error::Auth(format!("no signing key for kid {kid}")))?;
        *self.keys.write().await = Some(fresh);
        Ok(key)
    }

    /// Validate signature, expiry, audience and issuer of `token`.
    pub async fn validate(&self, token: &str) -> Result<ClaimsIdentity> {
        let header = decode_header(token).map_err(|e| Error::Auth(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(Error::Auth(format!("unsupported algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::Auth("token has no kid".into()))?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(self.audience.as_slice());
        validation.set_issuer(self.issuer.as_slice());
        let data = decode::<HashMap<String, Value>>(token, &key, &validation)
            .map_err(|e| Error::Auth(e.to_string()))?;

        Ok(ClaimsIdentity {
            claims: data.claims,
            is_authenticated: true,
            authentication_type: "Bearer".into(),
        })
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Requires a valid bearer token on POST requests; GET endpoints stay open.
pub async fn jwt_authorization(
    State(validator): State<Arc<JwtValidator>>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(&req).map(str::to_owned) else {
        warn!("Rejecting request without bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match validator.validate(&token).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => {
            warn!("Rejecting request: {}", e);
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Attaches anonymous claims when the host has no auth configuration.
pub async fn anonymous_claims(mut req: Request, next: Next) -> Response {
    if req.extensions().get::<ClaimsIdentity>().is_none() {
        req.extensions_mut().insert(ClaimsIdentity::anonymous());
    }
    next.run(req).await
}
