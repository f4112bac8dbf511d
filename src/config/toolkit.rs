use crate::retrieval::{render_snippets, RetrievalEngine, TopicFilter};
use crate::sandbox::CodeExecutor;
use crate::tools::{Tool, ToolDefinition, ToolLibrary};

use futures::future::{BoxFuture, FutureExt};
use log::debug;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

pub const RETRIEVE_TOOL: &str = "retrieve_financial_info";
pub const CODE_TOOL: &str = "execute_code";

/// Largest `n_results` the model may ask for.
const MAX_RESULTS: u64 = 10;

/// Builds the knowledge-base search tool.
///
/// `enforced` is the topic filter the caller chose. A specific topic there
/// overrides whatever topic the model passes; with `All`, the model's own
/// topic argument is honoured.
pub fn retrieval_tool(engine: Arc<RetrievalEngine>, enforced: TopicFilter, top_k: usize) -> Tool {
    let definition = ToolDefinition::function(
        RETRIEVE_TOOL,
        "Retrieve financial concepts, definitions, and insights from the knowledge base.",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to search the knowledge base for."
                },
                "topic": {
                    "type": "string",
                    "description": "Restrict the search to one financial topic, or \"All\"."
                },
                "n_results": {
                    "type": "integer",
                    "description": "How many snippets to return."
                }
            },
            "required": ["query"]
        }),
    );

    let function = Arc::new(move |args: JsonValue| -> BoxFuture<'static, Result<JsonValue, String>> {
        let engine = Arc::clone(&engine);
        let enforced = enforced.clone();
        async move {
            let query = args["query"]
                .as_str()
                .filter(|q| !q.trim().is_empty())
                .ok_or("Missing 'query' in arguments")?
                .to_string();
            let filter = match enforced {
                TopicFilter::All => TopicFilter::parse(args["topic"].as_str()),
                topic => topic,
            };
            let n = args["n_results"]
                .as_u64()
                .map_or(top_k, |n| n.clamp(1, MAX_RESULTS) as usize);

            debug!("{}: query={:?} filter={} n={}", RETRIEVE_TOOL, query, filter, n);
            let hits = engine.query(&query, &filter, n).await;
            Ok::<_, String>(JsonValue::String(render_snippets(&hits)))
        }
        .boxed()
    });

    Tool::Async { definition, function }
}

/// Builds the calculation tool backed by the sandboxed interpreter.
pub fn code_tool(executor: CodeExecutor) -> Tool {
    let definition = ToolDefinition::function(
        CODE_TOOL,
        "Execute a short calculation snippet to perform calculations or data analysis. \
         Use print() to return results.",
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The snippet to run."
                }
            },
            "required": ["code"]
        }),
    );

    let function = Arc::new(move |args: JsonValue| -> Result<JsonValue, String> {
        let code = args["code"].as_str().ok_or("Missing 'code' in arguments")?;
        Ok(JsonValue::String(executor.execute(code)))
    });

    Tool::Blocking { definition, function }
}

/// The two tools the financial agent exposes for a single request.
pub fn build_tool_library(
        engine: Arc<RetrievalEngine>,
        enforced: TopicFilter,
        top_k: usize,
        executor: CodeExecutor,
    ) -> ToolLibrary {
    let mut tool_library = ToolLibrary::new();
    for tool in [retrieval_tool(engine, enforced, top_k), code_tool(executor)] {
        tool_library.insert(tool.name().to_string(), tool);
    }
    tool_library
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_tool_runs_snippets() {
        let tool = code_tool(CodeExecutor::default());
        let Tool::Blocking { function, definition } = tool else {
            panic!("code tool should be blocking");
        };
        assert_eq!(definition.function.name, CODE_TOOL);
        assert_eq!(function(json!({"code": "print(1 + 1)"})).unwrap(), json!("2\n"));
        assert!(function(json!({})).is_err());
    }
}
