use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
pub use crate::tools::ToolCall;

/// One chat message in the OpenAI wire shape. Provider adapters translate
/// from and to it, so everything above the providers speaks only this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool name, on `tool` messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Thinking text some models return beside the answer. Never sent back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    fn with_role(role: &str, content: String) -> Self {
        Message {
            role: role.to_string(),
            content: Some(content),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: Message,
}

/// Token counts for one or more model calls, with their price when the model
/// entry in `models.json` carries one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Usage {
    /// Prices the counts. Both prices are in USD per million tokens.
    pub fn price(&mut self, input_per_million: f32, output_per_million: f32) {
        let input = f64::from(self.prompt_tokens) * f64::from(input_per_million);
        let output = f64::from(self.completion_tokens) * f64::from(output_per_million);
        self.cost_usd = Some((input + output) / 1_000_000.0);
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// A chat completion in the OpenAI response shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePayload {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ResponsePayload {
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }
}

pub fn format_system_message(content: String) -> Message {
    Message::with_role("system", content)
}

pub fn format_user_message(content: String) -> Message {
    Message::with_role("user", content)
}

/// The result of one tool call, tied back to the call by `tool_call_id`.
pub fn format_tool_message(content: String, tool_call_id: String, name: String) -> Message {
    Message {
        name: Some(name),
        tool_call_id: Some(tool_call_id),
        ..Message::with_role("tool", content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_sums_counts_and_known_costs() {
        let mut priced = Usage { prompt_tokens: 1_000, completion_tokens: 500, total_tokens: 1_500, cost_usd: None };
        priced.price(0.3, 2.5);
        let cost = priced.cost_usd.unwrap();
        assert!((cost - 0.00155).abs() < 1e-9, "{}", cost);

        let mut total = Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15, cost_usd: None };
        total += priced;
        assert_eq!(total.total_tokens, 1_515);
        assert_eq!(total.cost_usd, Some(cost));
    }

    #[test]
    fn tool_messages_carry_the_call_id() {
        let message = format_tool_message("42".into(), "call_1".into(), "execute_code".into());
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({"role": "tool", "content": "42", "name": "execute_code", "tool_call_id": "call_1"})
        );
    }
}
