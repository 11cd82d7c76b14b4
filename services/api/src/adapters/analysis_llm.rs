//! services/api/src/adapters/analysis_llm.rs
//!
//! This module contains the adapter for the deal-scoring LLM.
//! It implements the `AnalysisService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use deal_desk_core::{
    domain::{AiAnalysis, AnalysisRequest, MessageDirection},
    ports::{AnalysisFailure, AnalysisService},
};
use serde::Deserialize;

const SYSTEM_INSTRUCTIONS: &str = r#"You assist sales managers who answer customers in Messenger and Instagram.
You receive the most recent messages of one conversation, oldest first. Lines starting with
"CLIENT:" were written by the customer, lines starting with "MANAGER:" by the sales team.

Assess how likely the customer is to buy and reply with ONE JSON object and nothing else:
{
  "summary": "one or two sentences about what the customer wants",
  "score": 0-100 integer purchase likelihood,
  "intent": "short label, e.g. price_inquiry, ready_to_buy, support, browsing",
  "objections": ["customer concerns, empty if none"],
  "next_action": "the single most useful next step for the manager"
}
Write summary, objections and next_action in the language the customer uses."#;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `AnalysisService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiAnalysisAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnalysisAdapter {
    /// Creates a new `OpenAiAnalysisAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

//=========================================================================================
// `AnalysisService` Trait Implementation
//=========================================================================================

#[async_trait]
impl AnalysisService for OpenAiAnalysisAdapter {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AiAnalysis, AnalysisFailure> {
        if request.messages.is_empty() {
            return Err(AnalysisFailure::EmptyHistory);
        }
        let provider = |e: OpenAIError| AnalysisFailure::Provider(e.to_string());

        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(provider)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(render_transcript(request))
                .build()
                .map_err(provider)?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.2)
            .n(1)
            .build()
            .map_err(provider)?;

        let response = self.client.chat().create(request).await.map_err(provider)?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                AnalysisFailure::MalformedResponse("model returned no text content".to_string())
            })?;
        parse_analysis(&content)
    }
}

/// Used when no API key is configured: every run fails and is recorded as such.
pub struct UnconfiguredAnalysisAdapter;

#[async_trait]
impl AnalysisService for UnconfiguredAnalysisAdapter {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AiAnalysis, AnalysisFailure> {
        Err(AnalysisFailure::Provider(
            "OPENAI_API_KEY is not configured".to_string(),
        ))
    }
}

//=========================================================================================
// Prompt and Response Helpers
//=========================================================================================

fn render_transcript(request: &AnalysisRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| {
            let who = match m.direction {
                MessageDirection::Client => "CLIENT",
                MessageDirection::Manager => "MANAGER",
            };
            format!("{}: {}", who, m.text.replace('\n', " "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Deserialize)]
struct AnalysisPayload {
    summary: String,
    score: f64,
    #[serde(default)]
    intent: String,
    #[serde(default)]
    objections: Vec<String>,
    #[serde(default)]
    next_action: String,
}

/// Parses the model's JSON answer, tolerating a surrounding code fence.
pub fn parse_analysis(content: &str) -> Result<AiAnalysis, AnalysisFailure> {
    let trimmed = content.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(AnalysisFailure::MalformedResponse(
                "response contains no JSON object".to_string(),
            ))
        }
    };
    let payload: AnalysisPayload = serde_json::from_str(json)
        .map_err(|e| AnalysisFailure::MalformedResponse(e.to_string()))?;
    if !payload.score.is_finite() {
        return Err(AnalysisFailure::MalformedResponse(
            "score is not a number".to_string(),
        ));
    }
    Ok(AiAnalysis {
        summary: payload.summary.trim().to_string(),
        score: payload.score.round().clamp(0.0, 100.0) as u8,
        intent: payload.intent.trim().to_string(),
        objections: payload
            .objections
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
        next_action: payload.next_action.trim().to_string(),
    })
}
