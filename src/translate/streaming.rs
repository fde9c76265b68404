//! State machine for turning native partial events into public stream chunks.
//!
//! A [`Reassembler`] consumes the native events of one exchange in order and
//! emits public delta chunks. It moves `Idle → Streaming → Terminated` and
//! never re-enters a state. The envelope identity (`id`, `created`, `model`)
//! is fixed on the first event and shared by every chunk that follows.
//!
//! The per-endpoint shape of events and chunks is supplied by a
//! [`StreamKind`]: [`ChatStream`] for chat completions and
//! [`CompletionStream`] for text completions.

use serde::Serialize;

use super::native_types::{NativeChatResponse, NativeGenerateResponse};
use super::openai_types::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, Completion, CompletionChoice, FinishReason,
    Role, Usage, CHAT_COMPLETION_CHUNK_OBJECT, SYSTEM_FINGERPRINT, TEXT_COMPLETION_OBJECT,
};
use super::response::{
    count_words, map_finish_reason, native_usage, reported_model, ExchangeIdentity,
    UsageEstimator, CHAT_ID_PREFIX, COMPLETION_ID_PREFIX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Terminated,
}

/// Endpoint-specific view of a native event and constructor of public chunks.
pub trait StreamKind {
    type Event;
    type Chunk: Serialize;

    const ID_PREFIX: &'static str;

    /// Whether the opening chunk is meaningful even with no content
    /// (chat announces the assistant role; text completion has nothing to announce).
    const ANNOUNCES_ROLE: bool;

    fn event_model(event: &Self::Event) -> &str;

    /// Content produced since the previous event.
    fn fragment(event: &Self::Event) -> &str;

    fn is_done(event: &Self::Event) -> bool;

    fn done_reason(event: &Self::Event) -> Option<&str>;

    fn usage(event: &Self::Event) -> Option<Usage>;

    fn chunk(
        identity: &ExchangeIdentity,
        fragment: &str,
        opening: bool,
        finish_reason: Option<FinishReason>,
    ) -> Self::Chunk;

    /// Trailing chunk with no choices that carries only the usage summary.
    fn usage_chunk(identity: &ExchangeIdentity, usage: Usage) -> Self::Chunk;
}

/// Per-request reassembler.
///
/// ```ignore
/// let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
/// for event in native_events {
///     for chunk in reassembler.process(&event) {
///         // frame and write the chunk
///     }
///     if reassembler.is_terminated() { break; }
/// }
/// ```
#[derive(Debug)]
pub struct Reassembler<K: StreamKind> {
    state: StreamState,
    requested_model: String,
    identity: Option<ExchangeIdentity>,
    include_usage: bool,
    estimator: Option<UsageEstimator>,
    completion_words: u32,
    chunks_emitted: usize,
    _kind: std::marker::PhantomData<K>,
}

impl<K: StreamKind> Reassembler<K> {
    pub fn new(
        requested_model: &str,
        include_usage: bool,
        estimator: Option<UsageEstimator>,
    ) -> Self {
        Self {
            state: StreamState::Idle,
            requested_model: requested_model.to_string(),
            identity: None,
            include_usage,
            estimator,
            completion_words: 0,
            chunks_emitted: 0,
            _kind: std::marker::PhantomData,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == StreamState::Terminated
    }

    pub fn identity(&self) -> Option<&ExchangeIdentity> {
        self.identity.as_ref()
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted
    }

    /// Process one native event, returning the chunks it produces, in order.
    pub fn process(&mut self, event: &K::Event) -> Vec<K::Chunk> {
        let opening = match self.state {
            StreamState::Terminated => return Vec::new(),
            StreamState::Idle => {
                let model = reported_model(K::event_model(event), &self.requested_model);
                self.identity = Some(ExchangeIdentity::new(K::ID_PREFIX, model));
                self.state = StreamState::Streaming;
                true
            }
            StreamState::Streaming => false,
        };
        let Some(identity) = self.identity.as_ref() else {
            return Vec::new();
        };

        let mut chunks = Vec::new();
        let fragment = K::fragment(event);

        // Empty intermediate events are no-ops unless they open a role-announcing stream.
        if !fragment.is_empty() || (opening && K::ANNOUNCES_ROLE) {
            chunks.push(K::chunk(identity, fragment, opening, None));
        }
        if self.estimator.is_some() {
            self.completion_words = self.completion_words.saturating_add(count_words(fragment));
        }

        if K::is_done(event) {
            let reason = map_finish_reason(K::done_reason(event));
            chunks.push(K::chunk(identity, "", false, Some(reason)));

            if self.include_usage {
                let usage = K::usage(event).or_else(|| {
                    self.estimator
                        .map(|e| e.estimate_words(self.completion_words))
                });
                if let Some(usage) = usage {
                    chunks.push(K::usage_chunk(identity, usage));
                }
            }
            self.state = StreamState::Terminated;
        }

        self.chunks_emitted += chunks.len();
        chunks
    }
}

/// Chat completion streams.
#[derive(Debug)]
pub struct ChatStream;

impl StreamKind for ChatStream {
    type Event = NativeChatResponse;
    type Chunk = ChatCompletionChunk;

    const ID_PREFIX: &'static str = CHAT_ID_PREFIX;
    const ANNOUNCES_ROLE: bool = true;

    fn event_model(event: &Self::Event) -> &str {
        &event.model
    }

    fn fragment(event: &Self::Event) -> &str {
        &event.message.content
    }

    fn is_done(event: &Self::Event) -> bool {
        event.done
    }

    fn done_reason(event: &Self::Event) -> Option<&str> {
        event.done_reason.as_deref()
    }

    fn usage(event: &Self::Event) -> Option<Usage> {
        native_usage(event.prompt_eval_count, event.eval_count)
    }

    fn chunk(
        identity: &ExchangeIdentity,
        fragment: &str,
        opening: bool,
        finish_reason: Option<FinishReason>,
    ) -> Self::Chunk {
        let delta = ChunkDelta {
            role: opening.then_some(Role::Assistant),
            content: (!fragment.is_empty() || opening).then(|| fragment.to_string()),
        };
        chat_chunk(
            identity,
            vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            None,
        )
    }

    fn usage_chunk(identity: &ExchangeIdentity, usage: Usage) -> Self::Chunk {
        chat_chunk(identity, Vec::new(), Some(usage))
    }
}

fn chat_chunk(
    identity: &ExchangeIdentity,
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: identity.id.clone(),
        object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
        created: identity.created,
        model: identity.model.clone(),
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices,
        usage,
    }
}

/// Text completion streams.
#[derive(Debug)]
pub struct CompletionStream;

impl StreamKind for CompletionStream {
    type Event = NativeGenerateResponse;
    type Chunk = Completion;

    const ID_PREFIX: &'static str = COMPLETION_ID_PREFIX;
    const ANNOUNCES_ROLE: bool = false;

    fn event_model(event: &Self::Event) -> &str {
        &event.model
    }

    fn fragment(event: &Self::Event) -> &str {
        &event.response
    }

    fn is_done(event: &Self::Event) -> bool {
        event.done
    }

    fn done_reason(event: &Self::Event) -> Option<&str> {
        event.done_reason.as_deref()
    }

    fn usage(event: &Self::Event) -> Option<Usage> {
        native_usage(event.prompt_eval_count, event.eval_count)
    }

    fn chunk(
        identity: &ExchangeIdentity,
        fragment: &str,
        _opening: bool,
        finish_reason: Option<FinishReason>,
    ) -> Self::Chunk {
        completion_chunk(
            identity,
            vec![CompletionChoice {
                text: fragment.to_string(),
                index: 0,
                logprobs: None,
                finish_reason,
            }],
            None,
        )
    }

    fn usage_chunk(identity: &ExchangeIdentity, usage: Usage) -> Self::Chunk {
        completion_chunk(identity, Vec::new(), Some(usage))
    }
}

fn completion_chunk(
    identity: &ExchangeIdentity,
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
) -> Completion {
    Completion {
        id: identity.id.clone(),
        object: TEXT_COMPLETION_OBJECT.to_string(),
        created: identity.created,
        model: identity.model.clone(),
        system_fingerprint: SYSTEM_FINGERPRINT.to_string(),
        choices,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::native_types::NativeMessage;

    fn chat_event(content: &str, done: bool) -> NativeChatResponse {
        NativeChatResponse {
            model: "llama3".to_string(),
            message: NativeMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
                images: Vec::new(),
            },
            done,
            done_reason: done.then(|| "stop".to_string()),
            ..NativeChatResponse::default()
        }
    }

    fn generate_event(text: &str, done: bool) -> NativeGenerateResponse {
        NativeGenerateResponse {
            model: "llama3".to_string(),
            response: text.to_string(),
            done,
            ..NativeGenerateResponse::default()
        }
    }

    fn run_chat(events: &[NativeChatResponse]) -> Vec<ChatCompletionChunk> {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
        events.iter().flat_map(|e| reassembler.process(e)).collect()
    }

    #[test]
    fn test_simple_chat_stream() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
        assert_eq!(reassembler.state(), StreamState::Idle);

        let chunks = reassembler.process(&chat_event("Hel", false));
        assert_eq!(reassembler.state(), StreamState::Streaming);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].object, "chat.completion.chunk");
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hel"));
        assert!(chunks[0].choices[0].finish_reason.is_none());

        let chunks = reassembler.process(&chat_event("lo", false));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.role, None);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("lo"));

        let chunks = reassembler.process(&chat_event("", true));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.content, None);
        assert_eq!(chunks[0].choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(reassembler.is_terminated());
        assert_eq!(reassembler.chunks_emitted(), 3);
    }

    #[test]
    fn test_identity_fixed_across_chunks() {
        let chunks = run_chat(&[
            chat_event("a", false),
            chat_event("b", false),
            chat_event("c", false),
            chat_event("", true),
        ]);
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert_eq!(chunk.id, chunks[0].id);
            assert_eq!(chunk.created, chunks[0].created);
            assert_eq!(chunk.model, chunks[0].model);
        }
    }

    #[test]
    fn test_exactly_one_finish_reason_and_it_is_last() {
        let chunks = run_chat(&[
            chat_event("one", false),
            chat_event("", false),
            chat_event("two", false),
            chat_event("three", true),
        ]);
        let finished: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.choices.iter().any(|ch| ch.finish_reason.is_some()))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(finished, vec![chunks.len() - 1]);

        let contents: Vec<String> = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_empty_intermediate_event_suppressed() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
        let _ = reassembler.process(&chat_event("hi", false));
        assert!(reassembler.process(&chat_event("", false)).is_empty());
    }

    #[test]
    fn test_empty_opening_event_announces_role() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
        let chunks = reassembler.process(&chat_event("", false));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some(""));
    }

    #[test]
    fn test_no_events_after_termination() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", false, None);
        let _ = reassembler.process(&chat_event("done", true));
        assert!(reassembler.is_terminated());
        assert!(reassembler.process(&chat_event("late", false)).is_empty());
        assert_eq!(reassembler.state(), StreamState::Terminated);
    }

    #[test]
    fn test_usage_chunk_after_terminal_when_requested() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", true, None);
        let _ = reassembler.process(&chat_event("hi", false));
        let mut last = chat_event("", true);
        last.prompt_eval_count = Some(5);
        last.eval_count = Some(2);

        let chunks = reassembler.process(&last);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(chunks[1].choices.is_empty());
        assert_eq!(chunks[1].usage, Some(Usage::new(5, 2)));
    }

    #[test]
    fn test_usage_not_fabricated() {
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", true, None);
        let chunks = reassembler.process(&chat_event("hi", true));
        assert!(chunks.iter().all(|c| c.usage.is_none()));
    }

    #[test]
    fn test_estimated_usage_when_enabled() {
        let estimator = UsageEstimator::for_prompt("say two words");
        let mut reassembler = Reassembler::<ChatStream>::new("llama3", true, Some(estimator));
        let _ = reassembler.process(&chat_event("hello ", false));
        let chunks = reassembler.process(&chat_event("there", true));
        let usage = chunks.last().and_then(|c| c.usage.clone()).unwrap();
        assert!(usage.approximate);
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 2);
    }

    #[test]
    fn test_completion_stream() {
        let mut reassembler = Reassembler::<CompletionStream>::new("requested", false, None);

        // Nothing to announce on an empty opening event.
        assert!(reassembler.process(&generate_event("", false)).is_empty());
        assert_eq!(reassembler.state(), StreamState::Streaming);

        let chunks = reassembler.process(&generate_event("Hello", false));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].object, "text_completion");
        assert_eq!(chunks[0].choices[0].text, "Hello");
        assert!(chunks[0].id.starts_with("cmpl-"));

        let mut last = generate_event("", true);
        last.done_reason = Some("length".to_string());
        let chunks = reassembler.process(&last);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].text, "");
        assert_eq!(chunks[0].choices[0].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_model_falls_back_to_request() {
        let mut reassembler = Reassembler::<CompletionStream>::new("requested", false, None);
        let mut event = generate_event("x", false);
        event.model = String::new();
        let chunks = reassembler.process(&event);
        assert_eq!(chunks[0].model, "requested");
        assert_eq!(reassembler.identity().unwrap().model, "requested");
    }
}
