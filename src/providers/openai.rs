use crate::datam::{Message, ResponsePayload};
use crate::embed::EmbedMode;
use crate::error::FinRagError;
use crate::tools::ToolDefinition;

use super::{json_headers, ProviderAdapter, ResponseParser};
use reqwest::header;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

/// Adapter for the OpenAI API.
pub struct OpenAIAdapter;

/// Parser for the OpenAI API response.
pub struct OpenAIParser;

impl ProviderAdapter for OpenAIAdapter {
    fn get_provider_name(&self) -> &str {
        "OpenAI"
    }

    fn prepare_request_payload(
            &self,
            model_tag: &str,
            messages: Vec<Message>,
            temperature: f32,
            tools: Option<&[ToolDefinition]>,
        ) -> JsonValue {
        // OpenAI expects tool_call arguments to be a string. We must re-serialize
        // our internal JSON object representation before sending it back.
        let processed_messages: Vec<JsonValue> = messages
            .into_iter()
            .map(|mut msg| {
                msg.reasoning_content = None;
                if let Some(tool_calls) = &mut msg.tool_calls {
                    for call in tool_calls {
                        if !call.function.arguments.is_string() {
                            call.function.arguments = json!(call.function.arguments.to_string());
                        }
                    }
                }
                serde_json::to_value(msg).unwrap_or(JsonValue::Null)
            })
            .collect();

        let mut payload = json!({
            "model": model_tag,
            "messages": processed_messages,
            "temperature": temperature,
        });

        if let Some(tools) = tools {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }

        payload
    }

    fn prepare_embedding_request(
            &self,
            model_tag: &str,
            texts: &[String],
            _mode: EmbedMode,
        ) -> JsonValue {
        // OpenAI embeddings are symmetric; there is no document/query switch.
        json!({ "model": model_tag, "input": texts })
    }

    fn get_request_url(&self, base_url: &str, _model_tag: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn get_request_headers(&self, api_key: &str) -> Result<header::HeaderMap, FinRagError> {
        let mut headers = json_headers();
        let value = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| FinRagError::Config(format!("Invalid OpenAI API key: {}", e)))?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(headers)
    }

    fn supports_tools(&self, _model_tag: &str) -> bool {
        true
    }

    fn supports_embeddings(&self, model_tag: &str) -> bool {
        model_tag.starts_with("text-embedding")
    }
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl ResponseParser for OpenAIParser {
    fn parse_response(
        &self,
        raw_response_text: &str,
        input_price: f32,
        output_price: f32,
    ) -> Result<ResponsePayload, FinRagError> {
        let mut payload: ResponsePayload = serde_json::from_str(raw_response_text)?;

        if let Some(choice) = payload.choices.get_mut(0) {
            // OpenAI returns tool arguments as a stringified JSON. We must parse it.
            if let Some(tool_calls) = &mut choice.message.tool_calls {
                for call in tool_calls {
                    if let Some(args_str) = call.function.arguments.as_str() {
                        // Empty or malformed argument strings become an empty object.
                        call.function.arguments =
                            serde_json::from_str(args_str).unwrap_or_else(|_| json!({}));
                    }
                }
            }
        }

        if let Some(usage) = &mut payload.usage {
            usage.price(input_price, output_price);
        }

        Ok(payload)
    }

    fn parse_embedding_response(
            &self,
            raw_response_text: &str,
        ) -> Result<Vec<Vec<f32>>, FinRagError> {
        let mut response: OpenAIEmbeddingResponse = serde_json::from_str(raw_response_text)?;
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datam::format_user_message;

    #[test]
    fn tools_are_attached_with_auto_choice() {
        let tools = vec![ToolDefinition::function("ping", "Ping.", json!({"type": "object", "properties": {}}))];
        let payload = OpenAIAdapter.prepare_request_payload(
            "gpt-4o-mini",
            vec![format_user_message("hi".to_string())],
            0.1,
            Some(tools.as_slice()),
        );
        assert_eq!(payload["tools"][0]["function"]["name"], "ping");
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["messages"][0]["role"], "user");
    }

    #[test]
    fn stringified_arguments_are_parsed() {
        let raw = r#"{
            "id": "chatcmpl-1", "object": "chat.completion", "created": 1, "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "execute_code", "arguments": "{\"code\": \"print(1)\"}"}},
                {"id": "call_2", "type": "function", "function": {"name": "execute_code", "arguments": ""}}
            ]}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }"#;
        let payload = OpenAIParser.parse_response(raw, 0.15, 0.6).unwrap();
        let calls = payload.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments["code"], "print(1)");
        assert_eq!(calls[1].function.arguments, json!({}));
        assert!(payload.usage.unwrap().cost_usd.is_some());
    }
}
