// Shared fakes for the integration tests: a deterministic embedder and a
// chat backend that replays a script.
#![allow(dead_code)]

use async_trait::async_trait;
use finrag_core::datam::{Choice, Message, ResponsePayload, Usage};
use finrag_core::embed::{EmbedMode, EmbeddingProvider};
use finrag_core::error::FinRagError;
use finrag_core::ingest::RawRecord;
use finrag_core::orchestra::ChatBackend;
use finrag_core::retrieval::{RetrievalEngine, RetrievalSettings};
use finrag_core::tools::{FunctionCall, ToolCall, ToolDefinition};
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const DIMS: usize = 64;

/// Bag-of-words hashing embedder. Texts that share words land close together.
#[derive(Default)]
pub struct HashingEmbedder {
    pub documents: Mutex<Vec<String>>,
    pub queries: Mutex<Vec<String>>,
    /// Any batch containing this marker fails to embed.
    pub fail_marker: Option<String>,
}

impl HashingEmbedder {
    pub fn failing_on(marker: &str) -> Self {
        Self { fail_marker: Some(marker.to_string()), ..Default::default() }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        // A constant component keeps every vector non-zero.
        v[0] = 0.1;
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let slot = 1 + (hasher.finish() as usize) % (DIMS - 1);
            v[slot] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>, FinRagError> {
        if let Some(marker) = &self.fail_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(FinRagError::Retrieval("embedding service unavailable".into()));
            }
        }
        let log = match mode {
            EmbedMode::Document => &self.documents,
            EmbedMode::Query => &self.queries,
        };
        log.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

pub fn settings(dir: &Path) -> RetrievalSettings {
    RetrievalSettings {
        collection_dir: dir.join("finance_knowledge"),
        max_records: None,
        batch_size: 2,
        corpus_sources: Vec::new(),
    }
}

pub fn open_engine(dir: &Path, embedder: Arc<HashingEmbedder>) -> RetrievalEngine {
    RetrievalEngine::open(settings(dir), embedder).expect("engine opens")
}

pub fn record(prompt: &str, scratchpad: &str, response: &str, topic: &str) -> RawRecord {
    RawRecord {
        prompt: prompt.to_string(),
        scratchpad: scratchpad.to_string(),
        response: response.to_string(),
        reference_texts: "[]".to_string(),
        topic: topic.to_string(),
    }
}

/// A small corpus spanning three topics.
pub fn sample_corpus() -> Vec<RawRecord> {
    vec![
        record(
            "How does tail dependence affect portfolio risk?",
            "Copulas capture joint extreme moves; tail dependence raises joint crash probability.",
            "Tail dependence means assets crash together, so diversification fails in stress.",
            "Investment Strategy & Portfolio Design",
        ),
        record(
            "Design a stress test for a bank trading book.",
            "Shock rates, spreads and equities; revalue the book under each stress scenario.",
            "Apply historical and hypothetical stress scenarios and measure losses against capital.",
            "Risk Management & Stress Testing",
        ),
        record(
            "What is reverse stress testing?",
            "Start from failure and work backwards to the stress scenario that causes it.",
            "Reverse stress testing identifies scenarios that would break the business model.",
            "Risk Management & Stress Testing",
        ),
        record(
            "How should a company choose its capital structure?",
            "Trade-off theory balances tax shields of debt against distress costs.",
            "Pick leverage where the marginal tax benefit equals the marginal distress cost.",
            "Corporate Finance",
        ),
        record(
            "Explain stress testing in corporate treasury.",
            "Liquidity stress for the treasury: model cash flows under a revenue shock.",
            "Treasury stress testing checks the firm survives a liquidity squeeze.",
            "Corporate Finance",
        ),
    ]
}

/// A chat backend that replays canned replies and records every request.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<ResponsePayload, FinRagError>>>,
    pub requests: Mutex<Vec<Vec<Message>>>,
    pub offered_tools: Mutex<Vec<Vec<String>>>,
    pub temperatures: Mutex<Vec<f32>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<ResponsePayload, FinRagError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            offered_tools: Mutex::new(Vec::new()),
            temperatures: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Contents of the `tool` messages in the last request, in order.
    pub fn last_tool_results(&self) -> Vec<String> {
        let requests = self.requests.lock().unwrap();
        requests
            .last()
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.role == "tool")
                    .filter_map(|m| m.content.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        temperature: f32,
    ) -> Result<ResponsePayload, FinRagError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.offered_tools.lock().unwrap().push(
            tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect(),
        );
        self.temperatures.lock().unwrap().push(temperature);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FinRagError::Chat("script exhausted".into())))
    }

    fn model_name(&self) -> &str {
        "SCRIPTED MODEL"
    }
}

fn payload(message: Message) -> ResponsePayload {
    ResponsePayload {
        id: "scripted".into(),
        object: "chat.completion".into(),
        created: 0,
        model: "SCRIPTED MODEL".into(),
        choices: vec![Choice { message }],
        usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15, cost_usd: None }),
    }
}

pub fn text_reply(text: &str) -> Result<ResponsePayload, FinRagError> {
    Ok(payload(Message {
        role: "assistant".into(),
        content: Some(text.into()),
        ..Default::default()
    }))
}

pub fn tool_reply(name: &str, arguments: JsonValue) -> Result<ResponsePayload, FinRagError> {
    Ok(payload(Message {
        role: "assistant".into(),
        tool_calls: Some(vec![ToolCall {
            id: format!("call_{}", name),
            tool_type: "function".into(),
            function: FunctionCall { name: name.into(), arguments },
        }]),
        ..Default::default()
    }))
}
