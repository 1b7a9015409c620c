//! Chat write and read paths.
//!
//! Replies and conversation summaries are generated outside the per-user
//! lock; only the document read-modify-write runs under it, so a slow
//! completion never holds up other writers past their lock timeout. The
//! summary is built from the history read before the lock is taken, so an
//! exchange stored concurrently shows up in the next summary instead.

use async_trait::async_trait;
use juris_core::{JurisResult, LlmError};
use juris_llm::{CallOutcome, CompletionProvider};
use juris_storage::{ChatDocument, ChatMessage, EntryOptions, Sender, StoreDriver};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, CacheValue};

/// Oldest messages beyond this are dropped on save.
pub const MAX_HISTORY_MESSAGES: usize = 500;

/// Cached history is short-lived; writes invalidate it anyway.
const HISTORY_TTL: Duration = Duration::from_secs(60);

/// Newest messages fed to the summary prompt.
const SUMMARY_WINDOW: usize = 20;

// ============================================================================
// KEYS
// ============================================================================

/// Lock key serializing writes to one user's document.
pub fn lock_key(user_id: &str) -> String {
    format!("chat:{}", user_id)
}

/// Cache key of a user's history.
pub fn history_key(user_id: &str) -> String {
    format!("{}messages", history_prefix(user_id))
}

/// Prefix covering every cached entry derived from a user's document.
/// Terminated so that `u1` never matches `u10`.
pub fn history_prefix(user_id: &str) -> String {
    format!("history:{}:", user_id)
}

/// Prompt asking for a short digest of `messages`.
pub fn summary_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::from("Summarize this conversation in two or three sentences.\n\n");
    for message in messages {
        let speaker = match message.sender {
            Sender::User => "User",
            Sender::Bot => "Assistant",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&message.text);
        prompt.push('\n');
    }
    prompt
}

/// Cache key of a completion, derived from the prompt text.
pub fn completion_key(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    format!("completion:{}", hex::encode(digest))
}

// ============================================================================
// SERVICE
// ============================================================================

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Cache,
    Provider,
    /// The completion service failed or is unavailable.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub user_message: String,
    pub bot_response: String,
    pub source: ReplySource,
    /// Messages stored for the user after this exchange.
    pub history_len: usize,
    /// Stored conversation summary after this exchange.
    pub summary: String,
}

/// Chat operations over a shared [`AppState`].
pub struct ChatService<D: StoreDriver> {
    state: Arc<AppState<D>>,
}

impl<D: StoreDriver> Clone for ChatService<D> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<D: StoreDriver> ChatService<D> {
    pub fn new(state: Arc<AppState<D>>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState<D>> {
        &self.state
    }

    /// Answer `text` and append the exchange to the user's document.
    ///
    /// A failing completion service does not fail the call: the reply is the
    /// fallback message and the exchange is still stored with the previous
    /// summary. Lock, connection and storage failures do fail it, and leave
    /// the document untouched.
    pub async fn process_message(&self, user_id: &str, text: &str) -> ApiResult<ChatReply> {
        if user_id.is_empty() {
            return Err(ApiError::invalid_request("user id is required"));
        }
        if text.trim().is_empty() {
            return Err(ApiError::invalid_request("message is required"));
        }

        let (reply, source) = self.respond(text).await;
        let summary = match source {
            ReplySource::Fallback => None,
            ReplySource::Cache | ReplySource::Provider => {
                self.summarize(user_id, text, &reply).await?
            }
        };

        let state = &*self.state;
        let bot_text = reply.clone();
        let (history_len, summary) = state
            .locks
            .with_lock(&lock_key(user_id), move || async move {
                let conn = state.connection.ensure_connection().await?;
                let mut document = state
                    .store
                    .load(&conn, user_id)
                    .await?
                    .unwrap_or_else(|| ChatDocument::new(user_id));
                document.append_exchange(ChatMessage::user(text), ChatMessage::bot(bot_text));
                document.truncate_front(MAX_HISTORY_MESSAGES);
                if let Some(summary) = summary {
                    document.summary = summary;
                }
                state.store.save(&conn, &document).await?;
                Ok::<_, ApiError>((document.messages.len(), document.summary))
            })
            .await??;

        let invalidated = state.cache.invalidate_prefix(&history_prefix(user_id));
        tracing::debug!(
            user_id,
            ?source,
            history_len,
            invalidated,
            "Chat exchange stored"
        );

        Ok(ChatReply {
            user_message: text.to_string(),
            bot_response: reply,
            source,
            history_len,
            summary,
        })
    }

    /// Summary of the user's history plus the new exchange. `None` when the
    /// completion service could not produce one.
    async fn summarize(
        &self,
        user_id: &str,
        text: &str,
        reply: &str,
    ) -> ApiResult<Option<String>> {
        let mut transcript = self.history(user_id).await?;
        transcript.push(ChatMessage::user(text));
        transcript.push(ChatMessage::bot(reply));
        let start = transcript.len().saturating_sub(SUMMARY_WINDOW);
        let prompt = summary_prompt(&transcript[start..]);

        match self.complete(&prompt).await {
            CallOutcome::Completed(summary) => Ok(Some(summary)),
            CallOutcome::Degraded(degraded) => {
                tracing::warn!(
                    user_id,
                    reason = %degraded.reason,
                    "Keeping previous chat summary"
                );
                Ok(None)
            }
        }
    }

    /// One completion through the limiter, degrading instead of failing.
    async fn complete(&self, prompt: &str) -> CallOutcome<String> {
        let provider = Arc::clone(&self.state.provider);
        self.state
            .limiter
            .call_or_degrade(|| {
                let provider = Arc::clone(&provider);
                let prompt = prompt.to_string();
                async move { provider.complete(&prompt).await }
            })
            .await
    }

    /// Reply text for `prompt`: cached, fresh from the provider, or the
    /// fallback message. Fallback replies are never cached.
    pub async fn respond(&self, prompt: &str) -> (String, ReplySource) {
        let key = completion_key(prompt);
        if let Some(CacheValue::Completion(text)) = self.state.cache.get(&key) {
            return (text, ReplySource::Cache);
        }

        match self.complete(prompt).await {
            CallOutcome::Completed(text) => {
                if let Err(e) = self.state.cache.set(key, CacheValue::Completion(text.clone())) {
                    tracing::debug!(error = %e, "Completion not cached");
                }
                (text, ReplySource::Provider)
            }
            CallOutcome::Degraded(degraded) => {
                tracing::warn!(
                    reason = %degraded.reason,
                    attempts = degraded.attempts,
                    "Answering with fallback reply"
                );
                (degraded.message, ReplySource::Fallback)
            }
        }
    }

    /// The user's messages, oldest first. Empty when no document exists.
    pub async fn history(&self, user_id: &str) -> ApiResult<Vec<ChatMessage>> {
        let key = history_key(user_id);
        if let Some(CacheValue::History(messages)) = self.state.cache.get(&key) {
            return Ok(messages);
        }

        let conn = self.state.connection.ensure_connection().await?;
        let messages = self
            .state
            .store
            .load(&conn, user_id)
            .await?
            .map(|document| document.messages)
            .unwrap_or_default();

        if let Err(e) = self.state.cache.set_with(
            key,
            CacheValue::History(messages.clone()),
            EntryOptions::ttl(HISTORY_TTL),
        ) {
            tracing::debug!(user_id, error = %e, "History not cached");
        }
        Ok(messages)
    }

    /// Delete the user's document. Returns whether one existed.
    pub async fn clear_history(&self, user_id: &str) -> ApiResult<bool> {
        let state = &*self.state;
        let existed = state
            .locks
            .with_lock(&lock_key(user_id), move || async move {
                let conn = state.connection.ensure_connection().await?;
                let existed = state.store.delete(&conn, user_id).await?;
                Ok::<_, ApiError>(existed)
            })
            .await??;

        state.cache.invalidate_prefix(&history_prefix(user_id));
        tracing::info!(user_id, existed, "Chat history cleared");
        Ok(existed)
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Provider used when no completion backend is configured. Every call fails
/// with [`LlmError::ProviderNotConfigured`], so replies degrade to the
/// fallback message.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProvider;

#[async_trait]
impl CompletionProvider for UnconfiguredProvider {
    fn provider_id(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _prompt: &str) -> JurisResult<String> {
        Err(LlmError::ProviderNotConfigured.into())
    }

    async fn ping(&self) -> JurisResult<()> {
        Err(LlmError::ProviderNotConfigured.into())
    }
}
