//! Property tests over the primitives as the chat service composes them.

use std::collections::HashSet;
use std::sync::Arc;

use juris_api::{
    history_key, history_prefix, AppConfig, AppState, CacheValue, ChatService,
    MAX_HISTORY_MESSAGES,
};
use juris_core::{transition, ConnectionEvent, ConnectionState, ThrottleConfig};
use juris_storage::{BoundedTtlCache, ChatDocument};
use juris_test_utils::fixtures;
use juris_test_utils::generators::{
    arb_cache_key, arb_chat_document, arb_connection_event, arb_connection_state,
};
use juris_test_utils::{InMemoryChatStore, MockCompletionProvider, MockStoreDriver};
use proptest::prelude::*;

use juris_core::ConnectionEvent as E;
use juris_core::ConnectionState as S;

const LEGAL_EDGES: [(ConnectionState, ConnectionEvent, ConnectionState); 6] = [
    (S::Disconnected, E::ConnectRequested, S::Connecting),
    (S::Connecting, E::ConnectSucceeded, S::Connected),
    (S::Connecting, E::ConnectFailed, S::Disconnected),
    (S::Connected, E::ConnectionLost, S::Disconnected),
    (S::Connected, E::DisconnectRequested, S::Disconnecting),
    (S::Disconnecting, E::DisconnectCompleted, S::Disconnected),
];

/// Pad a generated document to around the history cap.
fn arb_long_document() -> impl Strategy<Value = ChatDocument> {
    (arb_chat_document(), 0usize..12).prop_map(|(mut document, extra)| {
        let target = MAX_HISTORY_MESSAGES - 6 + extra;
        let seed = fixtures::chat_document(&document.user_id, 1).messages;
        while document.messages.len() < target {
            document.messages.push(seed[document.messages.len() % 2].clone());
        }
        document
    })
}

fn store_one_message(document: ChatDocument) -> (usize, ChatDocument) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let store = Arc::new(InMemoryChatStore::new());
        let user_id = document.user_id.clone();
        store.insert(document);

        let config = AppConfig {
            connection: fixtures::connection_config(),
            lock: fixtures::lock_config(),
            cache: fixtures::cache_config(),
            limiter: fixtures::limiter_config(),
            health: fixtures::health_config(),
            throttle: ThrottleConfig::disabled(),
            ..AppConfig::default()
        };
        let state = Arc::new(AppState::new(
            config,
            Arc::new(MockStoreDriver::new()),
            store.clone(),
            Arc::new(MockCompletionProvider::new()),
        ));
        let reply = ChatService::new(state)
            .process_message(&user_id, "newest question")
            .await
            .unwrap();
        (reply.history_len, store.document(&user_id).unwrap())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every accepted event follows a diagram edge; every other pair is
    /// rejected and leaves the state where it was.
    #[test]
    fn prop_transition_stays_on_legal_edges(
        start in arb_connection_state(),
        events in prop::collection::vec(arb_connection_event(), 0..40),
    ) {
        let mut state = start;
        for event in events {
            let edge = LEGAL_EDGES.iter().find(|(from, on, _)| *from == state && *on == event);
            match transition(state, event) {
                Ok(next) => {
                    prop_assert_eq!(edge.map(|(_, _, to)| *to), Some(next));
                    state = next;
                }
                Err(rejected) => {
                    prop_assert!(edge.is_none());
                    prop_assert_eq!(rejected.from, state);
                    prop_assert_eq!(rejected.event, event);
                }
            }
        }
    }

    /// Invalidating a prefix removes exactly the keys under it.
    #[test]
    fn prop_prefix_invalidation_is_exact(
        keys in prop::collection::vec(arb_cache_key(), 0..30),
        prefix in prop::sample::select(vec!["completion:", "history:", "profile:"]),
    ) {
        let cache: BoundedTtlCache<CacheValue> = BoundedTtlCache::new(fixtures::cache_config());
        for key in &keys {
            cache.set(key.clone(), CacheValue::Completion(key.clone())).unwrap();
        }

        let distinct: HashSet<&String> = keys.iter().collect();
        let expected = distinct.iter().filter(|k| k.starts_with(prefix)).count();
        prop_assert_eq!(cache.invalidate_prefix(prefix), expected);
        for key in distinct {
            prop_assert_eq!(cache.contains_key(key), !key.starts_with(prefix));
        }
    }

    #[test]
    fn prop_history_keys_stay_within_their_user(
        a in "[a-z0-9]{1,12}",
        b in "[a-z0-9]{1,12}",
    ) {
        prop_assume!(a != b);
        prop_assert!(!history_key(&b).starts_with(&history_prefix(&a)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A stored conversation never grows past the cap, and the newest
    /// exchange always survives truncation.
    #[test]
    fn prop_history_never_exceeds_cap(document in arb_long_document()) {
        let before = document.messages.len();
        let version = document.version;
        let (history_len, stored) = store_one_message(document);

        prop_assert!(stored.messages.len() <= MAX_HISTORY_MESSAGES);
        prop_assert_eq!(stored.messages.len(), (before + 2).min(MAX_HISTORY_MESSAGES));
        prop_assert_eq!(history_len, stored.messages.len());
        prop_assert_eq!(stored.version, version + 1);

        let newest = &stored.messages[stored.messages.len() - 2..];
        prop_assert_eq!(newest[0].text.as_str(), "newest question");
        prop_assert_eq!(newest[1].text.as_str(), "reply to: newest question");
    }
}
