//! Environment-driven configuration for the agent, its credentials and the host.
//!
//! Every `from_env` constructor has a `from_lookup` twin that takes a variable
//! lookup function, so precedence rules can be exercised without mutating the
//! process environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default Azure OpenAI API version.
pub const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

/// Default system instructions for the chat agent.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant.";

/// Default scope requested for the agent's service connection.
pub const DEFAULT_SCOPE: &str = "5a807f24-c9de-44ee-a3a7-329e88a00ffc/.default";

/// Default scope for the observability exporter token exchange.
pub const DEFAULT_OBSERVABILITY_SCOPE: &str = "https://api.powerplatform.com/.default";

/// Default manifest file name, resolved against the working directory.
pub const MANIFEST_FILE: &str = "ToolingManifest.json";

const CONNECTION_PREFIX: &str = "CONNECTIONS__SERVICE_CONNECTION__SETTINGS__";

/// Reads a variable, treating empty values as unset.
fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.is_empty())
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    non_empty(lookup, key).unwrap_or_else(|| default.to_string())
}

/// A flag is on only when its lower-cased value is exactly `true`.
fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(v) => v.to_lowercase() == "true",
        None => default,
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// =============================================================================
// Tooling manifest
// =============================================================================

/// A remote MCP tool server declared in the tooling manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    /// Display name, also used to prefix exposed tool names.
    pub mcp_server_name: String,
    /// Unique server identifier.
    pub mcp_server_unique_name: String,
    /// Server endpoint (absolute, or relative to `MCP_SERVER_HOST`).
    pub url: String,
    /// OAuth scope required to call the server.
    pub scope: String,
    /// Token audience for the server.
    pub audience: String,
}

/// Declared set of remote tool servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolingManifest {
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
}

impl ToolingManifest {
    /// Load the manifest from `path`, or `ToolingManifest.json` when `None`.
    ///
    /// A missing file is not an error: a warning is logged and an empty
    /// manifest returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(MANIFEST_FILE));

        if !path.exists() {
            warn!("{} not found at {}", MANIFEST_FILE, path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&content)?;
        debug!(
            path = %path.display(),
            servers = manifest.mcp_servers.len(),
            "Loaded tooling manifest"
        );
        Ok(manifest)
    }
}

// =============================================================================
// Agent configuration
// =============================================================================

/// Chat agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    /// Key for `api-key` authentication; Azure CLI credential is used when absent.
    pub api_key: Option<String>,
    pub instructions: String,
    pub enable_observability: bool,
    pub enable_otel: bool,
    pub enable_a365_observability_exporter: bool,
    pub enable_sensitive_data: bool,
    pub enable_mcp: bool,
    pub mcp_server_host: String,
    pub mcp_platform_endpoint: String,
    pub environment: String,
    /// Only populated when MCP is enabled.
    pub tooling_manifest: Option<ToolingManifest>,
}

impl AgentConfig {
    /// Build from the process environment, reading the manifest from the
    /// working directory.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup, None)
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        manifest_path: Option<&Path>,
    ) -> Result<Self> {
        let endpoint = non_empty(&lookup, "AZURE_OPENAI_ENDPOINT");
        let deployment = non_empty(&lookup, "AZURE_OPENAI_DEPLOYMENT");
        let (endpoint, deployment) = match (endpoint, deployment) {
            (Some(e), Some(d)) => (e, d),
            _ => {
                return Err(Error::Config(
                    "AZURE_OPENAI_ENDPOINT and AZURE_OPENAI_DEPLOYMENT required".into(),
                ))
            }
        };

        let enable_mcp = flag(&lookup, "ENABLE_MCP", false);
        let tooling_manifest = if enable_mcp {
            Some(ToolingManifest::load(manifest_path)?)
        } else {
            None
        };

        let environment = non_empty(&lookup, "ENVIRONMENT")
            .or_else(|| non_empty(&lookup, "PYTHON_ENVIRONMENT"))
            .unwrap_or_else(|| "development".into());

        Ok(Self {
            endpoint,
            deployment,
            api_version: string_or(&lookup, "AZURE_OPENAI_API_VERSION", DEFAULT_API_VERSION),
            api_key: non_empty(&lookup, "AZURE_OPENAI_API_KEY"),
            instructions: string_or(&lookup, "AGENT_INSTRUCTIONS", DEFAULT_INSTRUCTIONS),
            enable_observability: flag(&lookup, "ENABLE_OBSERVABILITY", true),
            enable_otel: flag(&lookup, "ENABLE_OTEL", true),
            enable_a365_observability_exporter: flag(
                &lookup,
                "ENABLE_A365_OBSERVABILITY_EXPORTER",
                false,
            ),
            enable_sensitive_data: flag(&lookup, "ENABLE_SENSITIVE_DATA", true),
            enable_mcp,
            mcp_server_host: lookup("MCP_SERVER_HOST").unwrap_or_default(),
            mcp_platform_endpoint: lookup("MCP_PLATFORM_ENDPOINT").unwrap_or_default(),
            environment,
            tooling_manifest,
        })
    }

    /// Number of declared MCP servers, zero when MCP is off.
    pub fn mcp_server_count(&self) -> usize {
        self.tooling_manifest
            .as_ref()
            .map_or(0, |m| m.mcp_servers.len())
    }
}

// =============================================================================
// Auth configuration
// =============================================================================

/// Credentials used for the service connection and MCP authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthConfig {
    pub env_id: String,
    pub bearer_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub use_agentic_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            env_id: String::new(),
            bearer_token: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: String::new(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            use_agentic_auth: true,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    /// Direct variables (`CLIENT_ID`, ...) win over the
    /// `CONNECTIONS__SERVICE_CONNECTION__SETTINGS__*` forms.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefixed = |direct: &str, suffix: &str| {
            non_empty(&lookup, direct)
                .or_else(|| lookup(&format!("{CONNECTION_PREFIX}{suffix}")))
                .unwrap_or_default()
        };

        let client_id = prefixed("CLIENT_ID", "CLIENTID");
        let client_secret = prefixed("CLIENT_SECRET", "CLIENTSECRET");
        let tenant_id = prefixed("TENANT_ID", "TENANTID");

        let scopes = match non_empty(&lookup, &format!("{CONNECTION_PREFIX}SCOPES")) {
            Some(s) => s.split(',').map(|s| s.trim().to_string()).collect(),
            None => vec![DEFAULT_SCOPE.to_string()],
        };

        Self {
            env_id: lookup("ENV_ID").unwrap_or_default(),
            bearer_token: lookup("BEARER_TOKEN").unwrap_or_default(),
            client_id,
            client_secret,
            tenant_id,
            scopes,
            use_agentic_auth: flag(&lookup, "USE_AGENTIC_AUTH", true),
        }
    }

    /// Whether a full client-credentials triple is present.
    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty() && !self.tenant_id.is_empty()
    }
}

// =============================================================================
// Host configuration
// =============================================================================

/// HTTP host configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub port: u16,
    pub host: String,
    pub service_name: String,
    pub service_namespace: String,
    pub enable_observability: bool,
    /// When off, message contents never reach the logs.
    pub enable_sensitive_data: bool,
    pub observability_scope: String,
    /// Manifest location override.
    pub manifest_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 3978,
            host: "localhost".into(),
            service_name: "agent365-service".into(),
            service_namespace: "agent-monitoring".into(),
            enable_observability: true,
            enable_sensitive_data: true,
            observability_scope: DEFAULT_OBSERVABILITY_SCOPE.into(),
            manifest_path: None,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let port = match non_empty(&lookup, "PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT: {p}")))?,
            None => defaults.port,
        };

        Ok(Self {
            port,
            host: string_or(&lookup, "HOST", &defaults.host),
            service_name: string_or(&lookup, "OBSERVABILITY_SERVICE_NAME", &defaults.service_name),
            service_namespace: string_or(
                &lookup,
                "OBSERVABILITY_SERVICE_NAMESPACE",
                &defaults.service_namespace,
            ),
            enable_observability: flag(&lookup, "ENABLE_OBSERVABILITY", true),
            enable_sensitive_data: flag(&lookup, "ENABLE_SENSITIVE_DATA", true),
            observability_scope: string_or(
                &lookup,
                "OBSERVABILITY_SCOPE",
                &defaults.observability_scope,
            ),
            manifest_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_agent_config_requires_endpoint_and_deployment() {
        let err = AgentConfig::from_lookup(vars(&[("AZURE_OPENAI_ENDPOINT", "https://x")]), None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = AgentConfig::from_lookup(
            vars(&[("AZURE_OPENAI_ENDPOINT", ""), ("AZURE_OPENAI_DEPLOYMENT", "gpt")]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::from_lookup(
            vars(&[
                ("AZURE_OPENAI_ENDPOINT", "https://example.openai.azure.com"),
                ("AZURE_OPENAI_DEPLOYMENT", "gpt-4o"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(config.api_version, DEFAULT_API_VERSION);
        assert_eq!(config.instructions, DEFAULT_INSTRUCTIONS);
        assert!(config.enable_observability);
        assert!(config.enable_otel);
        assert!(!config.enable_a365_observability_exporter);
        assert!(config.enable_sensitive_data);
        assert!(!config.enable_mcp);
        assert!(config.tooling_manifest.is_none());
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn test_flags_only_accept_true() {
        let config = AgentConfig::from_lookup(
            vars(&[
                ("AZURE_OPENAI_ENDPOINT", "https://x"),
                ("AZURE_OPENAI_DEPLOYMENT", "d"),
                ("ENABLE_OTEL", "yes"),
                ("ENABLE_OBSERVABILITY", "FALSE"),
                ("ENABLE_SENSITIVE_DATA", "1"),
                ("ENABLE_A365_OBSERVABILITY_EXPORTER", "True"),
            ]),
            None,
        )
        .unwrap();

        assert!(!config.enable_otel);
        assert!(!config.enable_observability);
        assert!(!config.enable_sensitive_data);
        assert!(config.enable_a365_observability_exporter);
    }

    #[test]
    fn test_mcp_enabled_loads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ToolingManifest.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"mcpServers":[{{"mcpServerName":"mail","mcpServerUniqueName":"mcp_mail","url":"https://mcp.example/mail","scope":"Mail.Read","audience":"api://mail"}}]}}"#
        )
        .unwrap();

        let config = AgentConfig::from_lookup(
            vars(&[
                ("AZURE_OPENAI_ENDPOINT", "https://x"),
                ("AZURE_OPENAI_DEPLOYMENT", "d"),
                ("ENABLE_MCP", "true"),
            ]),
            Some(&path),
        )
        .unwrap();

        assert_eq!(config.mcp_server_count(), 1);
        let server = &config.tooling_manifest.unwrap().mcp_servers[0];
        assert_eq!(server.mcp_server_unique_name, "mcp_mail");
        assert_eq!(server.audience, "api://mail");
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ToolingManifest::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert!(manifest.mcp_servers.is_empty());
    }

    #[test]
    fn test_malformed_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ToolingManifest.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ToolingManifest::load(Some(&path)),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_auth_direct_vars_override_prefixed() {
        let auth = AuthConfig::from_lookup(vars(&[
            ("CLIENT_ID", "direct-id"),
            ("CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTID", "prefixed-id"),
            ("CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTSECRET", "prefixed-secret"),
            ("TENANT_ID", ""),
            ("CONNECTIONS__SERVICE_CONNECTION__SETTINGS__TENANTID", "prefixed-tenant"),
        ]));

        assert_eq!(auth.client_id, "direct-id");
        assert_eq!(auth.client_secret, "prefixed-secret");
        assert_eq!(auth.tenant_id, "prefixed-tenant");
        assert!(auth.has_client_credentials());
    }

    #[test]
    fn test_auth_defaults() {
        let auth = AuthConfig::from_lookup(vars(&[]));
        assert_eq!(auth, AuthConfig::default());
        assert_eq!(auth.scopes, vec![DEFAULT_SCOPE.to_string()]);
        assert!(auth.use_agentic_auth);
        assert!(!auth.has_client_credentials());
    }

    #[test]
    fn test_auth_scopes_split_on_comma() {
        let auth = AuthConfig::from_lookup(vars(&[
            ("CONNECTIONS__SERVICE_CONNECTION__SETTINGS__SCOPES", "a/.default,b/.default"),
            ("USE_AGENTIC_AUTH", "false"),
        ]));
        assert_eq!(auth.scopes, vec!["a/.default", "b/.default"]);
        assert!(!auth.use_agentic_auth);
    }

    #[test]
    fn test_host_config() {
        let config = HostConfig::from_lookup(vars(&[
            ("PORT", "4000"),
            ("OBSERVABILITY_SERVICE_NAME", "svc"),
        ]))
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.service_name, "svc");
        assert_eq!(config.service_namespace, "agent-monitoring");
        assert!(config.enable_sensitive_data);
        assert_eq!(config.observability_scope, DEFAULT_OBSERVABILITY_SCOPE);

        let config = HostConfig::from_lookup(vars(&[
            ("ENABLE_SENSITIVE_DATA", "false"),
            ("OBSERVABILITY_SCOPE", "api://obs/.default"),
        ]))
        .unwrap();
        assert!(!config.enable_sensitive_data);
        assert_eq!(config.observability_scope, "api://obs/.default");

        tokio_test::assert_err!(HostConfig::from_lookup(vars(&[("PORT", "http")])));
    }
}
