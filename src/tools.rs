use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Represents a tool call requested by the model in its response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String, // e.g., "function"
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: JsonValue,
}

/// Defines the structure for a tool that can be provided to an AI model.
/// This is the "schema" for a single function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String, // Should always be "function" for now
    pub function: FunctionDefinition,
}

/// The definition of the function, including its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue, // JSON Schema object
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: JsonValue) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Synchronous tool body. Runs on the blocking thread pool.
pub type BlockingToolFn = Arc<dyn Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Asynchronous tool body, for tools that call back into async services.
pub type AsyncToolFn =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue, String>> + Send + Sync>;

/// A self-contained, executable tool including its definition and function.
///
/// Tools report failure as an `Err(String)` which the orchestrator hands back
/// to the model verbatim; they never abort a turn.
#[derive(Clone)]
pub enum Tool {
    Blocking {
        definition: ToolDefinition,
        function: BlockingToolFn,
    },
    Async {
        definition: ToolDefinition,
        function: AsyncToolFn,
    },
}

impl Tool {
    /// A helper method to get the definition from any tool variant.
    pub fn definition(&self) -> &ToolDefinition {
        match self {
            Tool::Blocking { definition, .. } => definition,
            Tool::Async { definition, .. } => definition,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition().function.name
    }
}

/// A collection of executable tools, searchable by name, to be passed to the Orchestra.
pub type ToolLibrary = HashMap<String, Tool>;

/// Renders a tool's JSON result as the string handed back to the model.
/// Plain strings are passed through without JSON quoting.
pub fn render_tool_output(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
