//! Tool abstractions for the tool-calling sub-loop.
//!
//! Tools are registered externally; the core consumes their schemas
//! and results. A [`ToolRegistry`] maps names to implementations and
//! renders the function-schema list offered to the model.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::error::{OrchestratorError, Result};

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, as offered in the schema list.
    fn name(&self) -> &str;

    /// Description telling the model how/when/why to use the tool.
    fn description(&self) -> &str;

    /// JSON Schema of the accepted arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// Execute the tool with parsed arguments.
    async fn invoke(&self, args: Value) -> Result<Value>;
}

/// Type alias for a boxed synchronous tool function.
pub type ToolFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Concrete tool wrapping a plain function.
#[derive(Clone)]
pub struct FnTool {
    tool_name: String,
    tool_description: String,
    tool_parameters: Value,
    func: ToolFn,
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.tool_name)
            .field("description", &self.tool_description)
            .finish_non_exhaustive()
    }
}

impl FnTool {
    /// Tool wrapping `func`.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: ToolFn,
    ) -> Self {
        Self {
            tool_name: name.into(),
            tool_description: description.into(),
            tool_parameters: json!({"type": "object", "properties": {}}),
            func,
        }
    }

    /// Builder method to set the parameter schema.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.tool_parameters = schema;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.tool_description
    }

    fn parameters(&self) -> Value {
        self.tool_parameters.clone()
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        (self.func)(args)
    }
}

/// Named tool collection with schema rendering and dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.clone())
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function schemas for a subset of tools, in the given order.
    /// Unknown names are skipped.
    pub fn schemas_for(&self, names: &[String]) -> Vec<Value> {
        names
            .iter()
            .filter_map(|name| self.get(name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Schemas for every registered tool, name-sorted for stability.
    pub fn all_schemas(&self) -> Vec<Value> {
        let mut names: Vec<String> = self.tools.iter().map(|t| t.key().clone()).collect();
        names.sort();
        self.schemas_for(&names)
    }

    /// Dispatch a tool call. Unknown names and tool-internal failures
    /// both surface as [`OrchestratorError::ToolDispatch`]; the
    /// sub-loop feeds them back to the model as tool results.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let Some(tool) = self.get(name) else {
            return Err(OrchestratorError::ToolDispatch {
                tool: name.to_string(),
                message: "unknown tool".to_string(),
            });
        };
        tool.invoke(args).await.map_err(|e| match e {
            err @ OrchestratorError::ToolDispatch { .. } => err,
            other => OrchestratorError::ToolDispatch {
                tool: name.to_string(),
                message: other.to_string(),
            },
        })
    }
}

/// Build a tool from a closure over a `HashMap` argument view.
pub fn tool_from_fn<F>(
    name: impl Into<String>,
    description: impl Into<String>,
    func: F,
) -> Arc<dyn Tool>
where
    F: Fn(HashMap<String, Value>) -> Result<Value> + Send + Sync + 'static,
{
    let wrapped: ToolFn = Arc::new(move |args: Value| {
        let map: HashMap<String, Value> = match args {
            Value::Object(obj) => obj.into_iter().collect(),
            Value::Null => HashMap::new(),
            other => {
                return Err(OrchestratorError::ToolDispatch {
                    tool: "<args>".to_string(),
                    message: format!("expected object arguments, got {other}"),
                })
            }
        };
        func(map)
    });
    Arc::new(FnTool::new(name, description, wrapped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_name_tool() -> Arc<dyn Tool> {
        tool_from_fn("lookup_name", "Look up a character name", |args| {
            let hint = args
                .get("hint")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Ok(json!(match hint {
                "hero" => "Aria",
                "villain" => "Morwen",
                _ => "Nameless",
            }))
        })
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let registry = ToolRegistry::new();
        registry.register(lookup_name_tool());

        let result = registry
            .dispatch("lookup_name", json!({"hint": "hero"}))
            .await
            .unwrap();
        assert_eq!(result, json!("Aria"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_dispatch_error() {
        let registry = ToolRegistry::new();
        let err = registry.dispatch("absent", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ToolDispatch { ref tool, .. } if tool == "absent"
        ));
    }

    #[tokio::test]
    async fn test_tool_internal_error_wrapped() {
        let registry = ToolRegistry::new();
        registry.register(tool_from_fn("boom", "always fails", |_| {
            Err(OrchestratorError::Template("inner failure".into()))
        }));
        let err = registry.dispatch("boom", json!({})).await.unwrap_err();
        match err {
            OrchestratorError::ToolDispatch { tool, message } => {
                assert_eq!(tool, "boom");
                assert!(message.contains("inner failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_schema_rendering() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(
            FnTool::new("t1", "first tool", Arc::new(|_| Ok(json!(null)))).with_parameters(
                json!({
                    "type": "object",
                    "properties": {"hint": {"type": "string"}},
                    "required": ["hint"]
                }),
            ),
        ));

        let schemas = registry.schemas_for(&["t1".to_string(), "missing".to_string()]);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "t1");
        assert_eq!(schemas[0]["function"]["parameters"]["required"][0], "hint");
    }

    #[test]
    fn test_all_schemas_sorted() {
        let registry = ToolRegistry::new();
        registry.register(tool_from_fn("zeta", "z", |_| Ok(json!(null))));
        registry.register(tool_from_fn("alpha", "a", |_| Ok(json!(null))));
        let schemas = registry.all_schemas();
        assert_eq!(schemas[0]["function"]["name"], "alpha");
        assert_eq!(schemas[1]["function"]["name"], "zeta");
    }

    #[test]
    fn test_replacement_registration() {
        let registry = ToolRegistry::new();
        registry.register(tool_from_fn("t", "old", |_| Ok(json!("old"))));
        registry.register(tool_from_fn("t", "new", |_| Ok(json!("new"))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("t").unwrap().description(), "new");
    }
}
