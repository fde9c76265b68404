use chrono::Utc;

use super::native_types::{NativeChatResponse, NativeGenerateResponse};
use super::openai_types::{
    ChatCompletion, Choice, Completion, CompletionChoice, FinishReason, ResponseMessage, Role,
    Usage, CHAT_COMPLETION_OBJECT, SYSTEM_FINGERPRINT, TEXT_COMPLETION_OBJECT,
};

pub const CHAT_ID_PREFIX: &str = "chatcmpl";
pub const COMPLETION_ID_PREFIX: &str = "cmpl";

/// The `id`, `created` and `model` fixed once per exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeIdentity {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl ExchangeIdentity {
    /// Fresh identity: random id under `prefix`, current time.
    pub fn new(prefix: &str, model: &str) -> Self {
        Self {
            id: format!("{prefix}-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: model.to_string(),
        }
    }
}

/// Pick the model name to report: the native one when present, else what was requested.
pub fn reported_model<'a>(native: &'a str, requested: &'a str) -> &'a str {
    if native.is_empty() {
        requested
    } else {
        native
    }
}

/// Map a native `done_reason` to the public finish reason.
pub fn map_finish_reason(done_reason: Option<&str>) -> FinishReason {
    match done_reason {
        Some("length") => FinishReason::Length,
        Some("abort" | "aborted" | "cancel" | "canceled" | "cancelled") => FinishReason::Aborted,
        _ => FinishReason::Stop,
    }
}

/// Usage from native counts. `None` when the native side reported neither count.
pub fn native_usage(prompt_eval_count: Option<u32>, eval_count: Option<u32>) -> Option<Usage> {
    if prompt_eval_count.is_none() && eval_count.is_none() {
        return None;
    }
    Some(Usage::new(
        prompt_eval_count.unwrap_or(0),
        eval_count.unwrap_or(0),
    ))
}

/// Whitespace-token estimator used only when explicitly enabled and the
/// native side reports no counts. Results are flagged `approximate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEstimator {
    prompt_words: u32,
}

impl UsageEstimator {
    pub fn for_prompt(prompt: &str) -> Self {
        Self {
            prompt_words: count_words(prompt),
        }
    }

    pub fn estimate(&self, completion: &str) -> Usage {
        self.estimate_words(count_words(completion))
    }

    pub fn estimate_words(&self, completion_words: u32) -> Usage {
        Usage {
            approximate: true,
            ..Usage::new(self.prompt_words, completion_words)
        }
    }
}

pub fn count_words(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

fn resolve_usage(
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    completion: &str,
    estimator: Option<&UsageEstimator>,
) -> Option<Usage> {
    native_usage(prompt_eval_count, eval_count)
        .or_else(|| estimator.map(|e| e.estimate(completion)))
}

/// Translate a complete native chat response into a chat completion envelope.
pub fn chat_to_public(
    resp: &NativeChatResponse,
    requested_model: &str,
    estimator: Option<&UsageEstimator>,
) -> ChatCompletion {
    let identity = ExchangeIdentity::new(
        CHAT_ID_PREFIX,
        reported_model(&resp.model, requested_model),
    );

    ChatCompletion {
        id: identity.id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: identity.created,
        model: identity.model,
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content: resp.message.content.clone(),
            },
            finish_reason: Some(map_finish_reason(resp.done_reason.as_deref())),
        }],
        usage: resolve_usage(
            resp.prompt_eval_count,
            resp.eval_count,
            &resp.message.content,
            estimator,
        ),
    }
}

/// Translate a complete native generate response into a text completion envelope.
pub fn completion_to_public(
    resp: &NativeGenerateResponse,
    requested_model: &str,
    estimator: Option<&UsageEstimator>,
) -> Completion {
    let identity = ExchangeIdentity::new(
        COMPLETION_ID_PREFIX,
        reported_model(&resp.model, requested_model),
    );

    Completion {
        id: identity.id,
        object: TEXT_COMPLETION_OBJECT.to_string(),
        created: identity.created,
        model: identity.model,
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices: vec![CompletionChoice {
            text: resp.response.clone(),
            index: 0,
            logprobs: None,
            finish_reason: Some(map_finish_reason(resp.done_reason.as_deref())),
        }],
        usage: resolve_usage(
            resp.prompt_eval_count,
            resp.eval_count,
            &resp.response,
            estimator,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::native_types::NativeMessage;

    fn chat_response(content: &str, done_reason: Option<&str>) -> NativeChatResponse {
        NativeChatResponse {
            model: "llama3".to_string(),
            message: NativeMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
                images: Vec::new(),
            },
            done: true,
            done_reason: done_reason.map(String::from),
            prompt_eval_count: Some(10),
            eval_count: Some(20),
            ..NativeChatResponse::default()
        }
    }

    #[test]
    fn test_simple_chat_response() {
        let result = chat_to_public(&chat_response("Hello!", Some("stop")), "llama3", None);

        assert_eq!(result.object, "chat.completion");
        assert!(result.id.starts_with("chatcmpl-"));
        assert_eq!(result.model, "llama3");
        assert_eq!(result.choices.len(), 1);
        assert_eq!(result.choices[0].index, 0);
        assert_eq!(result.choices[0].message.role, Role::Assistant);
        assert_eq!(result.choices[0].message.content, "Hello!");
        assert_eq!(result.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage, Some(Usage::new(10, 20)));
        assert_eq!(result.usage.unwrap().total_tokens, 30);
    }

    #[test]
    fn test_ids_are_fresh_per_response() {
        let resp = chat_response("Hi", None);
        let a = chat_to_public(&resp, "llama3", None);
        let b = chat_to_public(&resp, "llama3", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_usage_omitted_without_counts() {
        let mut resp = chat_response("Hi", None);
        resp.prompt_eval_count = None;
        resp.eval_count = None;
        let result = chat_to_public(&resp, "llama3", None);
        assert!(result.usage.is_none());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn test_estimator_marks_usage_approximate() {
        let resp = NativeGenerateResponse {
            response: "one two three".to_string(),
            done: true,
            ..NativeGenerateResponse::default()
        };
        let estimator = UsageEstimator::for_prompt("count to three");
        let result = completion_to_public(&resp, "llama3", Some(&estimator));
        let usage = result.usage.unwrap();
        assert!(usage.approximate);
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 6);
    }

    #[test]
    fn test_completion_response() {
        let resp = NativeGenerateResponse {
            response: "Hello!".to_string(),
            done: true,
            done_reason: Some("length".to_string()),
            ..NativeGenerateResponse::default()
        };
        let result = completion_to_public(&resp, "requested-model", None);

        assert_eq!(result.object, "text_completion");
        assert!(result.id.starts_with("cmpl-"));
        assert_eq!(result.model, "requested-model");
        assert_eq!(result.choices[0].text, "Hello!");
        assert_eq!(result.choices[0].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("abort")), FinishReason::Aborted);
        assert_eq!(map_finish_reason(Some("load")), FinishReason::Stop);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }
}
