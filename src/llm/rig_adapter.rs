//! Bridge from rig-core's `CompletionModel` to our `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};
use rig::message::Message as RigMessage;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Default output budget when the request does not set one.
const DEFAULT_MAX_TOKENS: u64 = 1024;

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

/// Split our messages into (preamble, history, prompt).
fn split_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<RigMessage>, Option<RigMessage>) {
    let mut preamble: Vec<&str> = Vec::new();
    let mut history: Vec<RigMessage> = Vec::new();
    for message in messages {
        match message.role {
            Role::System => preamble.push(&message.content),
            Role::User => history.push(RigMessage::user(message.content.clone())),
            Role::Assistant => history.push(RigMessage::assistant(message.content.clone())),
        }
    }
    let prompt = history.pop();
    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
    (preamble, history, prompt)
}

/// Map a provider error message onto the `LlmError` variants the
/// arbiter distinguishes.
pub(crate) fn classify_provider_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_lowercase();
    // OpenAI reports an exhausted quota as a 429, so quota words win.
    if ["quota", "insufficient", "billing", "credit"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        LlmError::QuotaExceeded {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("authentication") || lower.contains("invalid api key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(&request.messages);
        let prompt = prompt.ok_or_else(|| LlmError::InvalidResponse {
            provider: self.provider.to_string(),
            reason: "completion request has no user or assistant message".into(),
        })?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .max_tokens(request.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_TOKENS));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_provider_error(self.provider, &e.to_string()))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = if content.trim().is_empty() {
            FinishReason::Unknown
        } else {
            FinishReason::Stop
        };

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason,
        })
    }
}
