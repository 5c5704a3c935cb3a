//! Tool server contract: discovery, invocation, and allowed-set filtering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A discovered tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// The tool server contract.
///
/// `discover` is called once at startup; `invoke` returns the string body
/// appended as the tool message's content.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn discover(&self) -> Result<HashMap<String, ToolDef>>;

    async fn invoke(&self, name: &str, args: &Value) -> Result<String>;
}

/// Filter a plan's tool requirements against the discovered set.
///
/// Unknown names are dropped silently; a plan may name tools the session
/// does not provide.
pub fn filter_allowed(requested: &[String], available: &HashMap<String, ToolDef>) -> Vec<ToolDef> {
    requested
        .iter()
        .filter_map(|name| available.get(name).cloned())
        .collect()
}

type ToolHandler = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// In-process registry backed by plain handler functions.
///
/// Used by tests and embedders that expose local capabilities without an
/// external tool server.
#[derive(Clone, Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, (ToolDef, ToolHandler)>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, def: ToolDef, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        self.tools
            .insert(def.name.clone(), (def, Arc::new(handler)));
        self
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn discover(&self) -> Result<HashMap<String, ToolDef>> {
        Ok(self
            .tools
            .iter()
            .map(|(name, (def, _))| (name.clone(), def.clone()))
            .collect())
    }

    async fn invoke(&self, name: &str, args: &Value) -> Result<String> {
        let (_, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| Error::tool(name, "unknown tool"))?;
        handler(args)
    }
}

/// A registry with no tools. The default when an embedder provides none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolRegistry for NoTools {
    async fn discover(&self) -> Result<HashMap<String, ToolDef>> {
        Ok(HashMap::new())
    }

    async fn invoke(&self, name: &str, _args: &Value) -> Result<String> {
        Err(Error::tool(name, "no tool registry configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> StaticToolRegistry {
        StaticToolRegistry::new()
            .register(
                ToolDef::new("echo", "echo args back", json!({"type": "object"})),
                |args| Ok(args.to_string()),
            )
            .register(
                ToolDef::new("fail", "always fails", json!({"type": "object"})),
                |_| Err(Error::tool("fail", "nope")),
            )
    }

    #[tokio::test]
    async fn test_discover_and_invoke() {
        let registry = registry();
        let discovered = registry.discover().await.unwrap();
        assert_eq!(discovered.len(), 2);
        assert!(discovered.contains_key("echo"));

        let out = registry.invoke("echo", &json!({"x": 1})).await.unwrap();
        assert!(out.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = registry();
        let err = registry.invoke("missing", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[tokio::test]
    async fn test_handler_errors_propagate() {
        let registry = registry();
        assert!(registry.invoke("fail", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_filter_allowed_drops_unknown() {
        let registry = registry();
        let available = registry.discover().await.unwrap();
        let filtered = filter_allowed(
            &["echo".to_string(), "missing".to_string()],
            &available,
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");
    }

    #[tokio::test]
    async fn test_no_tools_registry() {
        let none = NoTools;
        assert!(none.discover().await.unwrap().is_empty());
        assert!(none.invoke("anything", &json!({})).await.is_err());
    }
}
