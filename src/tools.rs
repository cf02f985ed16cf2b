//! Tools callable by the chat agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};

/// Tool trait for anything the model may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolCallResult>;
}

/// Registry of available tools, keyed by exposed name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `tools`.
    pub fn with_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    /// Get all tool definitions, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::InvalidParams(format!("unknown tool: {}", name)))?;

        tool.execute(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentItem;
    use serde_json::json;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echo the input".into(),
                input_schema: json!({ "type": "object" }),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolCallResult> {
            Ok(ToolCallResult {
                content: vec![ContentItem::text(arguments.to_string())],
                is_error: false,
            })
        }
    }

    #[tokio::test]
    async fn test_registry_executes_by_name() {
        let registry = ToolRegistry::with_tools([Arc::new(EchoTool) as Arc<dyn Tool>]);
        assert_eq!(registry.len(), 1);

        let result = registry.execute("echo", json!({ "a": 1 })).await.unwrap();
        assert_eq!(result.text(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let registry = ToolRegistry::new();
        let err = registry.execute("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }
}
