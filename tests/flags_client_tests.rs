use async_trait::async_trait;
use reflag::{
    ClientPhase, EntityContext, EvaluationContext, FlagOverrides, FlagsClient, FlagsOptions,
    ManualClock, MemoryStorage, OverridesProvider, RawFlag, RawFlags, StorageAdapter,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PUBLISHABLE_KEY: &str = "pk_test";

fn flags_body(enabled: bool) -> Value {
    json!({
        "success": true,
        "features": {
            "a": {"key": "a", "isEnabled": enabled, "targetingVersion": 1}
        }
    })
}

async fn mount_flags(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/features/evaluated"))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn evaluated_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/features/evaluated")
        .count()
}

fn options(server: &MockServer) -> reflag::FlagsOptionsBuilder {
    FlagsOptions::builder(PUBLISHABLE_KEY).base_url(server.uri())
}

fn client_with(
    options: FlagsOptions,
    storage: Arc<MemoryStorage>,
    clock: &ManualClock,
) -> FlagsClient {
    FlagsClient::builder(options)
        .context(
            EvaluationContext::builder()
                .user(EntityContext::with_id("u1"))
                .build(),
        )
        .storage(storage)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

fn counter(client: &FlagsClient) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    client.on_updated(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    count
}

struct FixedOverrides(FlagOverrides);

#[async_trait]
impl OverridesProvider for FixedOverrides {
    async fn set_overrides(&self, _overrides: &FlagOverrides) {}

    async fn get_overrides(&self) -> reflag::Result<FlagOverrides> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_initialize_fetches_and_caches() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();

    let client = client_with(
        options(&server).stale_time(Duration::from_secs(60)).build(),
        storage.clone(),
        &clock,
    );
    let updates = counter(&client);
    client.initialize().await;

    assert_eq!(client.phase(), ClientPhase::Initialized);
    assert!(client.flag("a").unwrap().is_enabled());
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    // a second client for the same context is served from the fresh cache
    let second = client_with(
        options(&server).stale_time(Duration::from_secs(60)).build(),
        storage,
        &clock,
    );
    second.initialize().await;
    assert!(second.flag("a").unwrap().is_enabled());
    assert_eq!(evaluated_requests(&server).await, 1);
}

#[tokio::test]
async fn test_request_carries_sorted_context_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/features/evaluated"))
        .and(query_param("context.user.id", "u1"))
        .and(query_param("publishableKey", PUBLISHABLE_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(flags_body(true)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );
    assert!(client.fetch_flags().await.is_some());
}

#[tokio::test]
async fn test_network_failure_without_cache_uses_fallback() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(500)).await;

    let client = client_with(
        options(&server).fallback_flag_keys(["x"]).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    let mut expected = RawFlags::new();
    expected.insert("x".to_string(), RawFlag::new("x", true));
    assert_eq!(client.maybe_fetch_flags().await, Some(expected.clone()));

    client.initialize().await;
    assert_eq!(client.get_fetched_flags(), expected);
    assert!(client.flag("x").unwrap().config().is_none());
}

#[tokio::test]
async fn test_invalid_response_is_a_fetch_failure() {
    let server = MockServer::start().await;
    mount_flags(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "features": {"a": {"key": "b", "isEnabled": true, "targetingVersion": 1}}
        })),
    )
    .await;

    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );
    assert!(client.fetch_flags().await.is_none());
}

#[tokio::test]
async fn test_unsuccessful_response_is_a_fetch_failure() {
    let server = MockServer::start().await;
    mount_flags(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"success": false, "features": {}})),
    )
    .await;

    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );
    assert!(client.fetch_flags().await.is_none());
}

#[tokio::test]
async fn test_stale_cache_served_when_fetch_fails() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();

    let first = client_with(options(&server).build(), storage.clone(), &clock);
    first.initialize().await;

    clock.advance(Duration::from_millis(1));
    server.reset().await;
    mount_flags(&server, ResponseTemplate::new(503)).await;

    let second = client_with(
        options(&server).fallback_flag_keys(["x"]).build(),
        storage,
        &clock,
    );
    second.initialize().await;

    assert!(second.flag("a").unwrap().is_enabled());
    assert!(second.flag("x").is_none());
    assert_eq!(evaluated_requests(&server).await, 1);
}

#[tokio::test]
async fn test_expired_cache_falls_back() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();

    let build = |storage: Arc<MemoryStorage>| {
        client_with(
            options(&server)
                .expire_time(Duration::from_secs(10))
                .fallback_flag_keys(["x"])
                .build(),
            storage,
            &clock,
        )
    };

    build(storage.clone()).initialize().await;

    clock.advance(Duration::from_secs(10));
    server.reset().await;
    mount_flags(&server, ResponseTemplate::new(500)).await;

    let client = build(storage);
    client.initialize().await;
    assert!(client.flag("a").is_none());
    assert!(client.flag("x").unwrap().is_enabled());
}

#[tokio::test]
async fn test_stale_while_revalidate_serves_stale_then_updates() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();
    let swr = || options(&server).stale_while_revalidate(true).build();

    client_with(swr(), storage.clone(), &clock).initialize().await;

    clock.advance(Duration::from_millis(1));
    server.reset().await;
    mount_flags(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(flags_body(false))
            .set_delay(Duration::from_millis(200)),
    )
    .await;

    let client = client_with(swr(), storage.clone(), &clock);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_updated(move |flags| {
        let _ = tx.send(flags["a"].is_enabled());
    });

    let started = std::time::Instant::now();
    client.initialize().await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(client.flag("a").unwrap().is_enabled());
    assert_eq!(rx.recv().await, Some(true));

    let refreshed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(refreshed, Some(false));
    assert!(!client.flag("a").unwrap().is_enabled());

    let cached = storage
        .get_item(reflag::core::DEFAULT_CACHE_STORAGE_KEY)
        .await
        .unwrap()
        .unwrap();
    assert!(cached.contains("\"isEnabled\":false"));
}

#[tokio::test]
async fn test_refresh_is_limited_to_ten_per_window() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    for _ in 0..10 {
        assert!(client.refresh_flags().await.is_some());
    }
    assert!(client.refresh_flags().await.is_none());
    assert_eq!(evaluated_requests(&server).await, 10);
}

#[tokio::test]
async fn test_refresh_window_reopens() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let clock = ManualClock::starting_now();
    let client = client_with(options(&server).build(), Arc::new(MemoryStorage::new()), &clock);

    for _ in 0..10 {
        client.refresh_flags().await;
    }
    assert!(client.refresh_flags().await.is_none());

    clock.advance(Duration::from_secs(5 * 60));
    assert!(client.refresh_flags().await.is_some());
}

#[tokio::test]
async fn test_refresh_writes_cache() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;
    let storage = Arc::new(MemoryStorage::new());
    let client = client_with(
        options(&server).build(),
        storage.clone(),
        &ManualClock::starting_now(),
    );

    client.refresh_flags().await;
    assert!(storage
        .get_item(reflag::core::DEFAULT_CACHE_STORAGE_KEY)
        .await
        .unwrap()
        .is_some());
    assert!(client.flag("a").is_some());
}

#[tokio::test]
async fn test_unchanged_flags_emit_once() {
    let client = FlagsClient::new(FlagsOptions::builder(PUBLISHABLE_KEY).offline(true).build())
        .unwrap();
    let updates = counter(&client);

    let mut flags = RawFlags::new();
    flags.insert("a".to_string(), RawFlag::new("a", true));
    client.set_fetched_flags(flags.clone(), true);
    client.set_fetched_flags(flags, true);

    assert_eq!(updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_override_always_emits_and_merges() {
    let client = FlagsClient::builder(FlagsOptions::builder(PUBLISHABLE_KEY).offline(true).build())
        .storage(Arc::new(MemoryStorage::new()))
        .build()
        .unwrap();
    let mut flags = RawFlags::new();
    flags.insert("a".to_string(), RawFlag::new("a", true));
    client.set_fetched_flags(flags, false);

    let updates = counter(&client);
    client.set_flag_override("a", Some(false));
    client.set_flag_override("a", Some(false));
    client.set_flag_override("ghost", Some(true));

    assert_eq!(updates.load(Ordering::SeqCst), 3);
    assert!(!client.flag("a").unwrap().is_enabled());
    assert!(client.flag("ghost").is_none());
    assert_eq!(client.get_flag_override("ghost"), Some(true));

    client.set_flag_override("a", None);
    assert_eq!(client.flag("a").unwrap().is_enabled_override, None);
    assert_eq!(client.get_flag_override("a"), None);
}

#[tokio::test]
async fn test_override_survives_fetch_failure_and_persists() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(500)).await;
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();

    let client = client_with(
        options(&server).fallback_flag_keys(["x"]).build(),
        storage.clone(),
        &clock,
    );
    client.set_flag_override("x", Some(false));
    client.initialize().await;

    let flag = client.flag("x").unwrap();
    assert!(flag.flag.is_enabled);
    assert!(!flag.is_enabled());

    let mut persisted = None;
    for _ in 0..100 {
        persisted = storage
            .get_item(reflag::overrides::DEFAULT_OVERRIDES_KEY)
            .await
            .unwrap();
        if persisted.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted.as_deref(), Some(r#"{"x":false}"#));

    let restarted = client_with(
        options(&server).fallback_flag_keys(["x"]).build(),
        storage,
        &clock,
    );
    restarted.initialize().await;
    assert_eq!(restarted.get_flag_override("x"), Some(false));
    assert!(!restarted.flag("x").unwrap().is_enabled());
}

#[tokio::test]
async fn test_in_memory_overrides_win_over_persisted() {
    let mut persisted = FlagOverrides::new();
    persisted.insert("a".to_string(), true);
    persisted.insert("b".to_string(), true);

    let client = FlagsClient::builder(FlagsOptions::builder(PUBLISHABLE_KEY).offline(true).build())
        .storage(Arc::new(MemoryStorage::new()))
        .overrides(Arc::new(FixedOverrides(persisted)))
        .build()
        .unwrap();

    client.set_flag_override("a", Some(false));
    client.initialize().await;

    assert_eq!(client.get_flag_override("a"), Some(false));
    assert_eq!(client.get_flag_override("b"), Some(true));
}

#[tokio::test]
async fn test_offline_never_touches_network() {
    let server = MockServer::start().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;

    let client = client_with(
        options(&server).offline(true).fallback_flag_keys(["x"]).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );
    client.initialize().await;

    assert!(client.get_flags().is_empty());
    assert!(client.refresh_flags().await.is_none());

    let sent = Arc::new(AtomicUsize::new(0));
    let seen = sent.clone();
    let value = client
        .send_check_event(reflag::CheckEvent::is_enabled("a", true), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert!(value.is_none());
    assert_eq!(sent.load(Ordering::SeqCst), 0);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_set_context_refetches_for_new_fingerprint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/features/evaluated"))
        .and(query_param("context.user.id", "u2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(flags_body(false)))
        .mount(&server)
        .await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;

    let client = client_with(
        options(&server).stale_time(Duration::from_secs(60)).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );
    client.initialize().await;
    let before = client.cache_key();

    client
        .set_context(
            EvaluationContext::builder()
                .user(EntityContext::with_id("u2"))
                .build(),
        )
        .await;

    assert_ne!(client.cache_key(), before);
    assert!(!client.flag("a").unwrap().is_enabled());
    assert_eq!(evaluated_requests(&server).await, 2);
}

#[tokio::test]
async fn test_stop_detaches_listeners() {
    let client = FlagsClient::builder(FlagsOptions::builder(PUBLISHABLE_KEY).offline(true).build())
        .storage(Arc::new(MemoryStorage::new()))
        .build()
        .unwrap();
    let updates = counter(&client);

    client.stop();
    client.set_flag_override("a", Some(true));
    let mut flags = RawFlags::new();
    flags.insert("a".to_string(), RawFlag::new("a", true));
    client.set_fetched_flags(flags, true);

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert!(client.is_stopped());
}

#[tokio::test]
async fn test_stop_abandons_in_flight_fetch() {
    let server = MockServer::start().await;
    mount_flags(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(flags_body(true))
            .set_delay(Duration::from_secs(2)),
    )
    .await;
    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    let fetching = client.clone();
    let handle = tokio::spawn(async move { fetching.fetch_flags().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop();

    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_check_events_are_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/features/events"))
        .and(query_param("publishableKey", PUBLISHABLE_KEY))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    let sent = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let seen = sent.clone();
        let event = reflag::CheckEvent::is_enabled("a", true).version(1);
        let value = client
            .send_check_event(event, move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(value, Some(reflag::CheckValue::Enabled(true)));
    }
    assert_eq!(sent.load(Ordering::SeqCst), 1);

    // a different outcome is a different event
    client
        .send_check_event(reflag::CheckEvent::is_enabled("a", false).version(1), || {})
        .await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["action"], "check-is-enabled");
    assert_eq!(body["key"], "a");
    assert_eq!(body["targetingVersion"], 1);
    assert_eq!(body["evalResult"], true);
    assert_eq!(body["evalContext"]["user"]["id"], "u1");
}

#[tokio::test]
async fn test_check_event_failure_is_swallowed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/features/events"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    let sent = Arc::new(AtomicUsize::new(0));
    let seen = sent.clone();
    let value = client
        .send_check_event(reflag::CheckEvent::is_enabled("a", true), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert_eq!(value, Some(reflag::CheckValue::Enabled(true)));
    assert_eq!(sent.load(Ordering::SeqCst), 1);
}

fn single_flag_body(key: &str) -> Value {
    json!({
        "success": true,
        "features": {
            key: {"key": key, "isEnabled": true, "targetingVersion": 1}
        }
    })
}

async fn mount_flags_for_user(server: &MockServer, user_id: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/features/evaluated"))
        .and(query_param("context.user.id", user_id))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_background_refresh_keeps_its_own_context_when_context_changes() {
    let server = MockServer::start().await;
    mount_flags_for_user(
        &server,
        "u1",
        ResponseTemplate::new(200)
            .set_body_json(single_flag_body("flag_for_a"))
            .set_delay(Duration::from_millis(200)),
    )
    .await;
    mount_flags_for_user(
        &server,
        "u2",
        ResponseTemplate::new(200).set_body_json(single_flag_body("flag_for_b")),
    )
    .await;

    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();
    let swr = || options(&server).stale_while_revalidate(true).build();

    client_with(swr(), storage.clone(), &clock).initialize().await;
    clock.advance(Duration::from_millis(5));

    let client = client_with(swr(), storage.clone(), &clock);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_updated(move |flags| {
        let _ = tx.send(flags.keys().cloned().collect::<Vec<_>>());
    });

    // stale hit for u1 starts a background refresh, then the context moves on
    client.initialize().await;
    let fingerprint_a = client.cache_key();
    client
        .set_context(
            EvaluationContext::builder()
                .user(EntityContext::with_id("u2"))
                .build(),
        )
        .await;
    let fingerprint_b = client.cache_key();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(update);
    }
    // the slower background write for u1 lands last and wins the visible state
    assert_eq!(
        seen,
        vec![
            vec!["flag_for_a".to_string()],
            vec!["flag_for_b".to_string()],
            vec!["flag_for_a".to_string()],
        ]
    );
    assert!(client.flag("flag_for_a").is_some());

    let raw = storage
        .get_item(reflag::core::DEFAULT_CACHE_STORAGE_KEY)
        .await
        .unwrap()
        .unwrap();
    let blob =
        reflag::core::validate_cache_data(&serde_json::from_str::<Value>(&raw).unwrap()).unwrap();
    let keys = |fingerprint: &str| blob[fingerprint].flags.keys().cloned().collect::<Vec<_>>();
    assert_eq!(keys(&fingerprint_a), vec!["flag_for_a".to_string()]);
    assert_eq!(keys(&fingerprint_b), vec!["flag_for_b".to_string()]);
}

#[tokio::test]
async fn test_dropped_initialize_can_be_retried() {
    let server = MockServer::start().await;
    mount_flags(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(flags_body(true))
            .set_delay(Duration::from_secs(2)),
    )
    .await;
    let client = client_with(
        options(&server).build(),
        Arc::new(MemoryStorage::new()),
        &ManualClock::starting_now(),
    );

    let abandoned = tokio::time::timeout(Duration::from_millis(50), client.initialize()).await;
    assert!(abandoned.is_err());
    assert_eq!(client.phase(), ClientPhase::Idle);

    server.reset().await;
    mount_flags(&server, ResponseTemplate::new(200).set_body_json(flags_body(true))).await;

    client.initialize().await;
    assert_eq!(client.phase(), ClientPhase::Initialized);
    assert!(client.flag("a").unwrap().is_enabled());
}
