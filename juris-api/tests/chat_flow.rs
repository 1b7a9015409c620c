//! End-to-end chat paths over mock collaborators.

use std::sync::Arc;
use std::time::Duration;

use juris_api::{
    history_key, lock_key, ApiError, AppConfig, AppState, CacheValue, ChatService, ReplySource,
};
use juris_core::{
    ConnectionError, HealthState, HealthStatus, JurisError, LockError, StorageError,
    ThrottleConfig,
};
use juris_llm::{CompletionProvider, FALLBACK_MESSAGE};
use juris_storage::Sender;
use juris_test_utils::assertions::{
    assert_connection_error, assert_lock_timeout, assert_retry_exhausted,
    assert_service_unavailable,
};
use juris_test_utils::fixtures;
use juris_test_utils::{InMemoryChatStore, MockCompletionProvider, MockStoreDriver};

struct Harness {
    state: Arc<AppState<MockStoreDriver>>,
    chat: ChatService<MockStoreDriver>,
    driver: Arc<MockStoreDriver>,
    store: Arc<InMemoryChatStore>,
    provider: Arc<MockCompletionProvider>,
}

fn test_config() -> AppConfig {
    AppConfig {
        connection: fixtures::connection_config(),
        lock: fixtures::lock_config(),
        cache: fixtures::cache_config(),
        limiter: fixtures::limiter_config(),
        health: fixtures::health_config(),
        throttle: ThrottleConfig::disabled(),
        ..AppConfig::default()
    }
}

fn harness_with(config: AppConfig) -> Harness {
    let driver = Arc::new(MockStoreDriver::new());
    let store = Arc::new(InMemoryChatStore::new());
    let provider = Arc::new(MockCompletionProvider::new());
    let state = Arc::new(AppState::new(
        config,
        Arc::clone(&driver),
        store.clone(),
        provider.clone(),
    ));
    Harness {
        chat: ChatService::new(Arc::clone(&state)),
        state,
        driver,
        store,
        provider,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

#[tokio::test(start_paused = true)]
async fn test_message_is_answered_and_stored() {
    let h = harness();

    let reply = h.chat.process_message("u1", "what is bail?").await.unwrap();
    assert_eq!(reply.bot_response, "reply to: what is bail?");
    assert_eq!(reply.source, ReplySource::Provider);
    assert_eq!(reply.history_len, 2);

    let document = h.store.document("u1").unwrap();
    assert_eq!(document.version, 1);
    assert_eq!(document.messages[0].sender, Sender::User);
    assert_eq!(document.messages[1].text, "reply to: what is bail?");
    assert!(reply.summary.contains("User: what is bail?"));
    assert_eq!(document.summary, reply.summary);
    assert_eq!(h.driver.connects(), 1);
    assert!(!h.state.locks.is_locked(&lock_key("u1")));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_prompt_served_from_cache() {
    let h = harness();

    h.chat.process_message("u1", "what is bail?").await.unwrap();
    let reply = h.chat.process_message("u2", "what is bail?").await.unwrap();

    assert_eq!(reply.source, ReplySource::Cache);
    assert_eq!(reply.bot_response, "reply to: what is bail?");
    // One completion for the reply, one summary per user.
    let prompts = h.provider.prompts();
    assert_eq!(prompts.iter().filter(|p| *p == "what is bail?").count(), 1);
    assert_eq!(prompts.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_write_invalidates_cached_history() {
    let h = harness();

    h.chat.process_message("u1", "first").await.unwrap();
    assert_eq!(h.chat.history("u1").await.unwrap().len(), 2);
    assert!(h.state.cache.contains_key(&history_key("u1")));

    h.chat.process_message("u1", "second").await.unwrap();
    assert!(!h.state.cache.contains_key(&history_key("u1")));
    assert_eq!(h.chat.history("u1").await.unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_history_of_other_user_survives_invalidation() {
    let h = harness();

    h.chat.process_message("u10", "hello").await.unwrap();
    h.chat.history("u10").await.unwrap();

    h.chat.process_message("u1", "hello again").await.unwrap();
    assert!(matches!(
        h.state.cache.get(&history_key("u10")),
        Some(CacheValue::History(messages)) if messages.len() == 2
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_for_one_user_are_serialized() {
    let h = harness();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let chat = h.chat.clone();
        tasks.push(tokio::spawn(async move {
            chat.process_message("u1", &format!("question {i}")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let document = h.store.document("u1").unwrap();
    assert_eq!(document.messages.len(), 20);
    assert_eq!(document.version, 10);
    assert_eq!(h.store.saves(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_failing_provider_degrades_to_fallback() {
    let h = harness();
    h.provider.set_healthy(false);

    let reply = h.chat.process_message("u1", "what is bail?").await.unwrap();
    assert_eq!(reply.source, ReplySource::Fallback);
    assert_eq!(reply.bot_response, FALLBACK_MESSAGE);
    // No summary is attempted after a fallback reply.
    assert_eq!(h.provider.calls(), 3);
    assert!(reply.summary.is_empty());
    assert_eq!(h.state.limiter.health(), HealthState::Degraded);

    // The exchange is still stored, the fallback is not cached.
    assert_eq!(h.store.document("u1").unwrap().messages.len(), 2);

    h.provider.set_healthy(true);
    let reply = h.chat.process_message("u1", "what is bail?").await.unwrap();
    assert_eq!(reply.source, ReplySource::Provider);
    assert_eq!(h.provider.calls(), 5);
    assert!(!reply.summary.is_empty());
    assert_eq!(h.state.limiter.health(), HealthState::Available);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_failures_fail_fast_until_cooldown() {
    let h = harness();
    h.provider.set_healthy(false);
    let complete = || {
        let provider = h.provider.clone();
        async move { provider.complete("what is bail?").await }
    };

    assert_retry_exhausted(&h.state.limiter.call(complete).await, 3);
    assert_eq!(h.state.limiter.health(), HealthState::Degraded);
    assert_retry_exhausted(&h.state.limiter.call(complete).await, 3);
    assert_eq!(h.state.limiter.health(), HealthState::Unavailable);

    assert_service_unavailable(&h.state.limiter.call(complete).await);
    assert_eq!(h.provider.calls(), 6);

    // The chat path keeps answering without reaching the provider.
    let reply = h.chat.process_message("u1", "hello").await.unwrap();
    assert_eq!(reply.source, ReplySource::Fallback);
    assert_eq!(h.provider.calls(), 6);
    assert_eq!(h.store.document("u1").unwrap().messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_summary_keeps_previous_one() {
    let h = harness();
    let first = h.chat.process_message("u1", "what is bail?").await.unwrap();
    assert!(!first.summary.is_empty());

    // Reply comes from the cache; every summary attempt fails.
    h.provider.fail_next(3);
    let second = h.chat.process_message("u1", "what is bail?").await.unwrap();
    assert_eq!(second.source, ReplySource::Cache);
    assert_eq!(second.summary, first.summary);

    let document = h.store.document("u1").unwrap();
    assert_eq!(document.messages.len(), 4);
    assert_eq!(document.summary, first.summary);
    assert_eq!(h.state.limiter.health(), HealthState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_releases_lock_and_keeps_document() {
    let h = harness();
    h.chat.process_message("u1", "first").await.unwrap();
    h.store.fail_next_saves(1);

    let err = h.chat.process_message("u1", "second").await.unwrap_err();
    assert!(matches!(
        err,
        ApiError::Juris(JurisError::Storage(StorageError::WriteFailed { .. }))
    ));
    assert!(!h.state.locks.is_locked(&lock_key("u1")));
    assert_eq!(h.store.document("u1").unwrap().messages.len(), 2);

    let reply = h.chat.process_message("u1", "third").await.unwrap();
    assert_eq!(reply.history_len, 4);
}

#[tokio::test(start_paused = true)]
async fn test_missing_store_uri_fails_write() {
    let mut config = test_config();
    config.connection.uri = None;
    let h = harness_with(config);

    let err = h.chat.process_message("u1", "hello").await.unwrap_err();
    assert!(matches!(
        err,
        ApiError::Juris(JurisError::Connection(ConnectionError::MissingUri))
    ));
    assert!(!h.state.locks.is_locked(&lock_key("u1")));
    assert_connection_error(
        &h.state
            .connection
            .ensure_connection()
            .await
            .map_err(JurisError::from),
    );
}

#[tokio::test(start_paused = true)]
async fn test_held_lock_times_out_writer() {
    let h = harness();
    let token = h
        .state
        .locks
        .acquire_lock(&lock_key("u1"), Duration::from_secs(1))
        .await
        .unwrap();

    let err = h.chat.process_message("u1", "hello").await.unwrap_err();
    assert!(matches!(
        err,
        ApiError::Juris(JurisError::Lock(LockError::Timeout { timeout_ms: 1000, .. }))
    ));
    assert!(h.store.document("u1").is_none());
    assert_lock_timeout(
        &h.state
            .locks
            .acquire_lock(&lock_key("u1"), Duration::from_millis(100))
            .await
            .map_err(JurisError::from),
    );

    assert!(h.state.locks.release_lock(&lock_key("u1"), token));
    h.chat.process_message("u1", "hello").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_empty_message_rejected() {
    let h = harness();
    let err = h.chat.process_message("u1", "   ").await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest { .. }));
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.driver.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_clear_history() {
    let h = harness();
    h.chat.process_message("u1", "hello").await.unwrap();
    h.chat.history("u1").await.unwrap();

    assert!(h.chat.clear_history("u1").await.unwrap());
    assert!(h.store.document("u1").is_none());
    assert!(h.chat.history("u1").await.unwrap().is_empty());
    assert!(!h.chat.clear_history("u1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_write_after_connection_drop_uses_new_connection() {
    let h = harness();
    h.chat.process_message("u1", "first").await.unwrap();

    h.driver.drop_connection();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reply = h.chat.process_message("u1", "second").await.unwrap();
    assert_eq!(reply.history_len, 4);
    assert_eq!(h.driver.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_system_status_reports_components() {
    let h = harness();
    h.chat.process_message("u1", "hello").await.unwrap();

    let status = h.state.system_status();
    assert_eq!(status.overall, HealthStatus::Healthy);
    assert!(status.connection.is_connected);
    assert_eq!(status.locks.acquisitions, 1);
    assert_eq!(status.locks.held_keys, 0);
    assert_eq!(status.cache.entry_count, 1);
    assert_eq!(status.completion.provider, "mock");
    // Reply and summary.
    assert_eq!(status.completion.calls.successes, 2);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["overall"], "healthy");
    assert_eq!(json["completion"]["health"], "available");
}

#[tokio::test(start_paused = true)]
async fn test_status_unhealthy_when_store_disconnected() {
    let h = harness();
    let status = h.state.system_status();
    assert_eq!(status.overall, HealthStatus::Unhealthy);
    assert!(status
        .checks
        .iter()
        .any(|c| c.component == "store" && c.status == HealthStatus::Unhealthy));
}
