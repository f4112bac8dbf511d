use crate::datam::{Message, ResponsePayload};
use crate::embed::EmbedMode;
use crate::error::FinRagError;
use crate::tools::ToolDefinition;

use reqwest::header;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// A trait for provider-specific payload adjustments and request building.
///
/// Each provider (OpenAI, Google) has its own implementation of this trait to
/// handle its unique API format.
pub trait ProviderAdapter: Send + Sync {
    /// Returns the friendly name of the provider (e.g., "OpenAI").
    fn get_provider_name(&self) -> &str;

    /// Prepares the chat request payload specific to the provider's API.
    fn prepare_request_payload(
        &self,
        model_tag: &str,
        messages: Vec<Message>,
        temperature: f32,
        tools: Option<&[ToolDefinition]>,
    ) -> JsonValue;

    /// Prepares the payload for an embedding request.
    fn prepare_embedding_request(
            &self,
            _model_tag: &str,
            _texts: &[String],
            _mode: EmbedMode,
        ) -> JsonValue {
        json!({ "error": "Embeddings not supported by this provider." })
    }

    /// Returns the full, provider-specific chat request URL.
    fn get_request_url(&self, base_url: &str, model_tag: &str) -> String;

    /// Returns the full URL for an embedding request.
    fn get_embedding_url(&self, base_url: &str, _model_tag: &str) -> String {
        // A sensible default that works for OpenAI-like APIs.
        format!("{}/embeddings", base_url.trim_end_matches('/'))
    }

    /// Returns the provider-specific request headers, including authentication.
    fn get_request_headers(&self, api_key: &str) -> Result<header::HeaderMap, FinRagError>;

    /// Returns `true` if the provider supports native tool calling for a given model.
    fn supports_tools(&self, model_tag: &str) -> bool;

    /// Returns `true` if the provider supports embeddings for a given model.
    fn supports_embeddings(&self, _model_tag: &str) -> bool {
        false
    }
}

/// A trait for provider-specific response parsing.
///
/// Each provider converts its unique response format into our standardized
/// `ResponsePayload`.
pub trait ResponseParser: Send + Sync {
    /// Parses a raw JSON response string into a standardized `ResponsePayload`.
    fn parse_response(
            &self,
            raw_response_text: &str,
            input_price: f32,
            output_price: f32,
        ) -> Result<ResponsePayload, FinRagError>;

    /// Parses the response from an embedding call into a list of vectors.
    fn parse_embedding_response(
            &self,
            _raw_response_text: &str,
        ) -> Result<Vec<Vec<f32>>, FinRagError> {
        Err(FinRagError::ResponseParse(
            "Embedding parsing not supported by this provider.".to_string(),
        ))
    }
}

/// Resolves the adapter/parser pair for a provider named in `models.json`.
pub fn resolve(
        provider_name: &str,
    ) -> Result<(Arc<dyn ProviderAdapter>, Arc<dyn ResponseParser>), FinRagError> {
    match provider_name {
        "Google" => Ok((Arc::new(gemini::GoogleAdapter), Arc::new(gemini::GoogleParser))),
        "OpenAI" => Ok((Arc::new(openai::OpenAIAdapter), Arc::new(openai::OpenAIParser))),
        other => Err(FinRagError::Config(format!(
            "Provider '{}' is not supported.",
            other
        ))),
    }
}

pub(crate) fn json_headers() -> header::HeaderMap {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers
}

pub mod gemini;
pub mod openai;
