//! Logging setup, service-level tracing context and per-turn baggage.

use tracing::{info, info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

use crate::token_cache::AgenticTokenCache;

/// Install the global subscriber. `RUST_LOG` overrides `log_level`.
///
/// Logs go to stderr.
pub fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Service identity plus the token store the exporter reads from.
#[derive(Debug, Clone)]
pub struct Telemetry {
    service_name: String,
    service_namespace: String,
    tokens: AgenticTokenCache,
    enabled: bool,
}

impl Telemetry {
    /// Record the service identity. Turn spans are parented under it.
    pub fn configure(
        service_name: impl Into<String>,
        service_namespace: impl Into<String>,
        tokens: AgenticTokenCache,
    ) -> Self {
        let telemetry = Self {
            service_name: service_name.into(),
            service_namespace: service_namespace.into(),
            tokens,
            enabled: true,
        };
        info!(
            service.name = telemetry.service_name.as_str(),
            service.namespace = telemetry.service_namespace.as_str(),
            "Observability configured"
        );
        telemetry
    }

    /// Telemetry with no service identity; turn spans are still created.
    pub fn disabled(tokens: AgenticTokenCache) -> Self {
        Self {
            service_name: String::new(),
            service_namespace: String::new(),
            tokens,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tokens(&self) -> &AgenticTokenCache {
        &self.tokens
    }

    /// Token the exporter would attach for spans of this tenant/agent.
    pub fn exporter_token(&self, tenant_id: &str, agent_id: &str) -> Option<String> {
        if tenant_id.is_empty() || agent_id.is_empty() {
            return None;
        }
        self.tokens.get_cached_agentic_token(tenant_id, agent_id)
    }

    pub fn baggage(&self) -> BaggageBuilder<'_> {
        BaggageBuilder {
            telemetry: self,
            tenant_id: String::new(),
            agent_id: String::new(),
        }
    }
}

/// Builds the span that carries tenant/agent identifiers for one turn.
pub struct BaggageBuilder<'a> {
    telemetry: &'a Telemetry,
    tenant_id: String,
    agent_id: String,
}

impl BaggageBuilder<'_> {
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn build(self) -> Span {
        let exporter_auth = self
            .telemetry
            .exporter_token(&self.tenant_id, &self.agent_id)
            .is_some();
        info_span!(
            "agent_turn",
            service.name = self.telemetry.service_name.as_str(),
            service.namespace = self.telemetry.service_namespace.as_str(),
            tenant_id = self.tenant_id.as_str(),
            agent_id = self.agent_id.as_str(),
            exporter_auth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_token_reads_shared_store() {
        let tokens = AgenticTokenCache::new();
        let telemetry = Telemetry::configure("svc", "ns", tokens.clone());
        assert!(telemetry.exporter_token("t", "a").is_none());

        tokens.cache_agentic_token("t", "a", "tok");
        assert_eq!(telemetry.exporter_token("t", "a").as_deref(), Some("tok"));
        assert!(telemetry.exporter_token("", "a").is_none());
    }

    #[test]
    fn test_baggage_builds_turn_span() {
        let telemetry = Telemetry::disabled(AgenticTokenCache::new());
        assert!(!telemetry.is_enabled());

        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = telemetry.baggage().tenant_id("t").agent_id("a").build();
            let metadata = span.metadata().expect("span is enabled");
            assert_eq!(metadata.name(), "agent_turn");
            for field in ["tenant_id", "agent_id", "exporter_auth"] {
                assert!(metadata.fields().field(field).is_some(), "missing {field}");
            }
        });
    }
}
