use crate::datam::{Choice, Message, ResponsePayload, Usage};
use crate::embed::EmbedMode;
use crate::error::FinRagError;
use crate::tools::{FunctionCall, ToolCall, ToolDefinition};

use super::{json_headers, ProviderAdapter, ResponseParser};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Adapter for the Google Gemini API.
pub struct GoogleAdapter;

/// Parser for the Google Gemini API response.
pub struct GoogleParser;

/// Title attached to documents embedded in retrieval-document mode.
const DOCUMENT_TITLE: &str = "Financial Document";

static THINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<think>(.*)</think>").unwrap());

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Serialize)]
struct GeminiFunctionResponse {
    name: String,
    response: JsonValue,
}

#[derive(Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: JsonValue,
}

impl GeminiPart {
    fn text(text: String) -> Self {
        Self { text: Some(text), function_call: None, function_response: None }
    }
}

/// Gemini wants function responses as JSON objects. Tool results are strings,
/// so anything that is not already an object gets wrapped.
fn function_response_body(text: &str) -> JsonValue {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(value @ JsonValue::Object(_)) => value,
        _ => json!({ "content": text }),
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn get_provider_name(&self) -> &str {
        "Google"
    }

    fn prepare_request_payload(
            &self,
            _model_tag: &str,
            messages: Vec<Message>,
            temperature: f32,
            tools: Option<&[ToolDefinition]>,
        ) -> JsonValue {
        let mut system_prompt = String::new();
        let mut contents: Vec<GeminiContent> = Vec::new();

        for msg in messages {
            if msg.role == "system" {
                if let Some(content) = msg.content {
                    system_prompt.push_str(&content);
                    system_prompt.push('\n');
                }
                continue;
            }

            let role = match msg.role.as_str() {
                "assistant" => "model",
                _ => "user",
            };

            let mut parts = Vec::new();
            if let Some(tool_calls) = &msg.tool_calls {
                if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                    parts.push(GeminiPart::text(text.clone()));
                }
                for tool_call in tool_calls {
                    let args = if tool_call.function.arguments.is_object() {
                        tool_call.function.arguments.clone()
                    } else {
                        json!({})
                    };
                    parts.push(GeminiPart {
                        text: None,
                        function_call: Some(GeminiFunctionCall {
                            name: tool_call.function.name.clone(),
                            args,
                        }),
                        function_response: None,
                    });
                }
            } else if msg.role == "tool" {
                let text = msg.content.unwrap_or_default();
                parts.push(GeminiPart {
                    text: None,
                    function_call: None,
                    function_response: Some(GeminiFunctionResponse {
                        name: msg.name.unwrap_or_default(),
                        response: function_response_body(&text),
                    }),
                });
            } else if let Some(text) = msg.content.filter(|t| !t.is_empty()) {
                parts.push(GeminiPart::text(text));
            }

            if parts.is_empty() {
                continue;
            }

            // Parallel tool results must travel together in one turn.
            match contents.last_mut() {
                Some(last) if msg.role == "tool" && last.role == role
                    && last.parts.iter().all(|p| p.function_response.is_some()) =>
                {
                    last.parts.extend(parts);
                }
                _ => contents.push(GeminiContent { role: role.to_string(), parts }),
            }
        }

        let mut payload = json!({
            "contents": contents,
            "generationConfig": { "temperature": temperature },
        });

        if !system_prompt.is_empty() {
            payload["systemInstruction"] = json!({
                "parts": [{ "text": system_prompt.trim() }]
            });
        }

        if let Some(tools) = tools {
            let function_declarations: Vec<_> = tools.iter().map(|t| &t.function).collect();
            payload["tools"] = json!([{ "function_declarations": function_declarations }]);
        }

        payload
    }

    fn prepare_embedding_request(
            &self,
            model_tag: &str,
            texts: &[String],
            mode: EmbedMode,
        ) -> JsonValue {
        let requests: Vec<JsonValue> = texts
            .iter()
            .map(|text| {
                let mut request = json!({
                    "model": format!("models/{}", model_tag),
                    "content": { "parts": [{ "text": text }] },
                });
                match mode {
                    EmbedMode::Document => {
                        request["taskType"] = json!("RETRIEVAL_DOCUMENT");
                        request["title"] = json!(DOCUMENT_TITLE);
                    }
                    EmbedMode::Query => {
                        request["taskType"] = json!("RETRIEVAL_QUERY");
                    }
                }
                request
            })
            .collect();
        json!({ "requests": requests })
    }

    fn get_request_url(&self, base_url: &str, model_tag: &str) -> String {
        format!("{}/{}:generateContent", base_url.trim_end_matches('/'), model_tag)
    }

    fn get_embedding_url(&self, base_url: &str, model_tag: &str) -> String {
        format!("{}/{}:batchEmbedContents", base_url.trim_end_matches('/'), model_tag)
    }

    // The key travels in a header so it never shows up in URLs echoed by errors.
    fn get_request_headers(&self, api_key: &str) -> Result<header::HeaderMap, FinRagError> {
        let mut headers = json_headers();
        let value = header::HeaderValue::from_str(api_key)
            .map_err(|e| FinRagError::Config(format!("Invalid Google API key: {}", e)))?;
        headers.insert("x-goog-api-key", value);
        Ok(headers)
    }

    fn supports_tools(&self, _model_tag: &str) -> bool {
        true
    }

    fn supports_embeddings(&self, model_tag: &str) -> bool {
        model_tag.contains("embedding")
    }
}

// --- Response Structs ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentResponse>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiEmbeddingResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl ResponseParser for GoogleParser {
    fn parse_response(
            &self,
            raw_response_text: &str,
            input_price: f32,
            output_price: f32,
        ) -> Result<ResponsePayload, FinRagError> {
        let gemini_response: GeminiResponse = serde_json::from_str(raw_response_text)?;

        let first_candidate = gemini_response.candidates.into_iter().next().ok_or_else(|| {
            FinRagError::ResponseParse("Gemini response did not contain any candidates".to_string())
        })?;

        let parts = match first_candidate.content {
            Some(content) => content.parts,
            None => {
                return Err(FinRagError::ResponseParse(format!(
                    "Gemini candidate had no content (finish reason: {})",
                    first_candidate.finish_reason.as_deref().unwrap_or("unknown")
                )))
            }
        };

        let mut text_parts: Vec<String> = Vec::new();
        let mut reasoning_content: Option<String> = None;
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        for part in parts {
            if let Some(text) = part.text {
                if part.thought {
                    reasoning_content = Some(text);
                } else {
                    text_parts.push(text);
                }
            }
            if let Some(fc) = part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("gemini-tool-{}", uuid::Uuid::new_v4()),
                    tool_type: "function".to_string(),
                    function: FunctionCall {
                        name: fc.name,
                        arguments: if fc.args.is_null() { json!({}) } else { fc.args },
                    },
                });
            }
        }

        let mut content = if text_parts.is_empty() { None } else { Some(text_parts.concat()) };
        if let Some(c) = &mut content {
            if let Some(captures) = THINK_RE.captures(c) {
                if let Some(thought) = captures.get(1) {
                    reasoning_content = Some(thought.as_str().trim().to_string());
                }
                *c = THINK_RE.replace(c, "").trim().to_string();
            }
        }

        Ok(ResponsePayload {
            id: format!("gemini-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            model: "gemini".to_string(),
            choices: vec![Choice {
                message: Message {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    reasoning_content,
                    ..Default::default()
                },
            }],
            usage: gemini_response.usage_metadata.map(|meta| {
                let mut usage = Usage {
                    prompt_tokens: meta.prompt_token_count,
                    completion_tokens: meta.candidates_token_count,
                    total_tokens: meta.total_token_count,
                    ..Default::default()
                };
                usage.price(input_price, output_price);
                usage
            }),
        })
    }

    fn parse_embedding_response(
            &self,
            raw_response_text: &str,
        ) -> Result<Vec<Vec<f32>>, FinRagError> {
        let response: GeminiEmbeddingResponse = serde_json::from_str(raw_response_text)?;
        Ok(response.embeddings.into_iter().map(|e| e.values).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datam::{format_system_message, format_tool_message, format_user_message};

    #[test]
    fn system_messages_become_system_instruction() {
        let payload = GoogleAdapter.prepare_request_payload(
            "gemini-2.5-flash",
            vec![
                format_system_message("Be terse.".to_string()),
                format_user_message("Hi".to_string()),
            ],
            0.1,
            None,
        );
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "Be terse.");
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
        assert_eq!(payload["contents"][0]["role"], "user");
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn parallel_tool_results_share_one_turn() {
        let call = |id: &str, name: &str| ToolCall {
            id: id.to_string(),
            tool_type: "function".to_string(),
            function: FunctionCall { name: name.to_string(), arguments: json!({"q": 1}) },
        };
        let assistant = Message {
            role: "assistant".to_string(),
            tool_calls: Some(vec![call("a", "one"), call("b", "two")]),
            ..Default::default()
        };
        let payload = GoogleAdapter.prepare_request_payload(
            "gemini-2.5-flash",
            vec![
                format_user_message("Hi".to_string()),
                assistant,
                format_tool_message("first".to_string(), "a".to_string(), "one".to_string()),
                format_tool_message("{\"ok\":true}".to_string(), "b".to_string(), "two".to_string()),
            ],
            0.1,
            None,
        );
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"].as_array().unwrap().len(), 2);
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["response"]["content"], "first");
        assert_eq!(contents[2]["parts"][1]["functionResponse"]["response"]["ok"], true);
    }

    #[test]
    fn parses_function_calls_and_text() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [
                {"text": "Let me look that up."},
                {"functionCall": {"name": "retrieve_financial_info", "args": {"query": "tail dependence"}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15}
        }"#;
        let payload = GoogleParser.parse_response(raw, 0.3, 2.5).unwrap();
        let message = &payload.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Let me look that up."));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "retrieve_financial_info");
        assert_eq!(calls[0].function.arguments["query"], "tail dependence");
        assert_eq!(payload.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn missing_candidates_is_an_error() {
        assert!(GoogleParser.parse_response(r#"{"candidates": []}"#, 0.0, 0.0).is_err());
    }

    #[test]
    fn embedding_request_carries_task_type() {
        let texts = vec!["a".to_string()];
        let doc = GoogleAdapter.prepare_embedding_request("text-embedding-004", &texts, EmbedMode::Document);
        assert_eq!(doc["requests"][0]["taskType"], "RETRIEVAL_DOCUMENT");
        assert_eq!(doc["requests"][0]["title"], DOCUMENT_TITLE);
        let query = GoogleAdapter.prepare_embedding_request("text-embedding-004", &texts, EmbedMode::Query);
        assert_eq!(query["requests"][0]["taskType"], "RETRIEVAL_QUERY");
        assert!(query["requests"][0].get("title").is_none());
    }

    #[test]
    fn parses_embedding_response() {
        let raw = r#"{"embeddings": [{"values": [0.1, 0.2]}, {"values": [0.3, 0.4]}]}"#;
        let vectors = GoogleParser.parse_embedding_response(raw).unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }
}
