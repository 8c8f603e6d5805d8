//! Invocation pipeline integration tests
//!
//! Every test drives an `InvocationExecutor` against the scripted provider
//! in `common`, so the whole stack (codec, correlation, batching, cache,
//! validation and access control) runs for real over the in-process
//! transport.

mod common;

use std::time::Duration;

use capwire::access::{AccessPolicy, RateLimit};
use capwire::types::{
    ArgumentSchema, CacheClass, Capability, CapabilityKind, ContentBlock, ContentPolicy,
};
use capwire::validation::ViolationKind;
use capwire::{classify, CapwireError, ReadRange};
use futures::future::join_all;
use serde_json::{json, Value};

use common::{connect_executor, test_config, wait_until, ProviderSpec};

fn text_of(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Correlation and batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_calls_each_resolve_with_their_own_result() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;
    executor.list_operations().await.unwrap();

    let calls = (0..20).map(|n| executor.call("echo", json!({ "n": n })));
    let results = join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        let response = result.expect("call should succeed");
        let echoed: Value = serde_json::from_str(&text_of(&response.content)).unwrap();
        assert_eq!(echoed, json!({ "n": n }));
    }
    assert_eq!(provider.count("tools/call"), 20);
    assert_eq!(executor.connection().pending_requests(), 0);
}

#[tokio::test]
async fn test_calls_inside_one_window_share_a_frame() {
    let mut config = test_config();
    config.batching.window_ms = 30;
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;
    executor.list_operations().await.unwrap();

    let calls = (0..5).map(|n| executor.call("echo", json!({ "n": n })));
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    // The provider answers batches in reverse order; ids still line up.
    for (n, result) in results.into_iter().enumerate() {
        let echoed: Value = serde_json::from_str(&text_of(&result.unwrap().content)).unwrap();
        assert_eq!(echoed["n"], n);
    }
    assert_eq!(provider.count("tools/call"), 5);
    assert_eq!(provider.frames_with("tools/call"), 1);
}

// ---------------------------------------------------------------------------
// Local rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_arguments_report_every_violation_without_sending() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let err = executor
        .call("typed", json!({ "a": "not-a-number", "b": "z" }))
        .await
        .unwrap_err();

    match classify(&err) {
        Some(CapwireError::Validation {
            capability,
            violations,
        }) => {
            assert_eq!(capability, "typed");
            assert_eq!(violations.len(), 2);
            assert!(violations
                .iter()
                .any(|v| v.field == "a" && v.kind == ViolationKind::TypeMismatch));
            assert!(violations
                .iter()
                .any(|v| v.field == "b" && v.kind == ViolationKind::NotInEnum));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(provider.count("tools/call"), 0);
}

#[tokio::test]
async fn test_rate_limit_rejects_the_eleventh_call() {
    let mut config = test_config();
    config.access = AccessPolicy {
        rate_limit: Some(RateLimit {
            max_calls: 10,
            window_ms: 1_000,
        }),
        ..AccessPolicy::default()
    };
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    for n in 0..10 {
        executor
            .call("echo", json!({ "n": n }))
            .await
            .expect("within the limit");
    }
    let err = executor.call("echo", json!({ "n": 10 })).await.unwrap_err();

    assert!(matches!(
        classify(&err),
        Some(CapwireError::RateLimited { limit: 10, window_ms: 1_000, .. })
    ));
    assert_eq!(provider.count("tools/call"), 10);
}

#[tokio::test]
async fn test_permission_is_checked_per_capability() {
    let mut config = test_config();
    config.access = AccessPolicy {
        subject: "alice".into(),
        allowed: vec!["operation:echo".into(), "operation:tools/list".into()],
        ..AccessPolicy::default()
    };
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    executor.call("echo", json!({})).await.expect("echo is allowed");
    let err = executor
        .call("typed", json!({ "a": 1, "b": "x" }))
        .await
        .unwrap_err();

    match classify(&err) {
        Some(CapwireError::PermissionDenied {
            subject,
            capability,
        }) => {
            assert_eq!(subject, "alice");
            assert_eq!(capability, "operation:typed");
        }
        other => panic!("expected permission error, got {:?}", other),
    }
    assert_eq!(provider.count("tools/call"), 1);
}

#[tokio::test]
async fn test_kind_not_offered_is_unsupported() {
    let config = test_config();
    let spec = ProviderSpec {
        offer_resources: false,
        ..ProviderSpec::default()
    };
    let (executor, provider) = connect_executor(&config, spec).await;

    let err = executor.read("mem://doc", None).await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(CapwireError::UnsupportedCapability(_))
    ));
    let err = executor.list_templates().await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(CapwireError::UnsupportedCapability(_))
    ));
    assert_eq!(provider.count("resources/read"), 0);
    assert_eq!(provider.count("resources/templates/list"), 0);
}

#[tokio::test]
async fn test_unknown_operation_after_refresh() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let err = executor.call("missing", json!({})).await.unwrap_err();

    assert!(matches!(
        classify(&err),
        Some(CapwireError::UnknownCapability(name)) if name == "operation:missing"
    ));
    assert_eq!(provider.count("tools/list"), 1);
    assert_eq!(provider.count("tools/call"), 0);
}

#[tokio::test]
async fn test_content_policy_strips_markup_before_sending() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;
    executor.register(Capability {
        kind: CapabilityKind::Operation,
        name: "echo".into(),
        title: None,
        description: None,
        mime_type: None,
        schema: ArgumentSchema::default(),
        cache_class: CacheClass::Never,
        content_policy: ContentPolicy {
            strip_control: true,
            strip_markup: true,
            disallowed: String::new(),
        },
    });

    executor
        .call("echo", json!({ "text": "<b>hi</b>\u{200B}" }))
        .await
        .unwrap();

    let sent = provider.requests("tools/call");
    assert_eq!(sent[0]["params"]["arguments"]["text"], "bhi/b");

    // Rediscovery keeps the declared policy.
    executor.list_operations().await.unwrap();
    let echo = executor
        .registry()
        .get(CapabilityKind::Operation, "echo")
        .unwrap();
    assert!(echo.content_policy.strip_markup);
}

#[tokio::test]
async fn test_content_policy_survives_list_changed() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;
    executor.register(Capability {
        kind: CapabilityKind::Operation,
        name: "echo".into(),
        title: None,
        description: None,
        mime_type: None,
        schema: ArgumentSchema::default(),
        cache_class: CacheClass::Never,
        content_policy: ContentPolicy {
            strip_control: true,
            strip_markup: true,
            disallowed: String::new(),
        },
    });

    provider.control().inject(json!({
        "jsonrpc": "2.0",
        "method": "notifications/tools/list_changed"
    }));
    let cleared = wait_until(Duration::from_secs(1), || {
        executor
            .registry()
            .get(CapabilityKind::Operation, "echo")
            .is_none()
    })
    .await;
    assert!(cleared, "registry should drop operations");

    executor
        .call("echo", json!({ "text": "<b>hi</b>" }))
        .await
        .unwrap();

    let sent = provider.requests("tools/call");
    assert_eq!(sent[0]["params"]["arguments"]["text"], "bhi/b");
    assert_eq!(provider.count("tools/list"), 1);
}

#[tokio::test]
async fn test_provider_error_surfaces_as_remote() {
    let config = test_config();
    let (executor, _provider) = connect_executor(&config, ProviderSpec::default()).await;

    let err = executor.read("mem://missing", None).await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(CapwireError::Remote { code: -32002, .. })
    ));
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discovery_follows_cursors() {
    let config = test_config();
    let spec = ProviderSpec {
        page_size: Some(2),
        ..ProviderSpec::default()
    };
    let (executor, provider) = connect_executor(&config, spec).await;

    let operations = executor.list_operations().await.unwrap();

    let names: Vec<&str> = operations.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "typed", "slow"]);
    assert_eq!(provider.count("tools/list"), 2);
    assert_eq!(executor.registry().len(), 3);
}

#[tokio::test]
async fn test_list_changed_invalidates_cached_discovery() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    executor.list_operations().await.unwrap();
    executor.list_operations().await.unwrap();
    assert_eq!(provider.count("tools/list"), 1);

    provider.control().inject(json!({
        "jsonrpc": "2.0",
        "method": "notifications/tools/list_changed"
    }));
    let cleared = wait_until(Duration::from_secs(1), || {
        executor
            .registry()
            .get(CapabilityKind::Operation, "echo")
            .is_none()
    })
    .await;
    assert!(cleared, "registry should drop operations");

    executor.list_operations().await.unwrap();
    assert_eq!(provider.count("tools/list"), 2);
}

#[tokio::test]
async fn test_templates_are_discovered_with_variable_schema() {
    let config = test_config();
    let (executor, _provider) = connect_executor(&config, ProviderSpec::default()).await;

    let templates = executor.list_templates().await.unwrap();

    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].name, "mem://docs/{name}");
    assert_eq!(templates[0].schema.required, vec!["name".to_string()]);
}

// ---------------------------------------------------------------------------
// Reads and caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reads_are_cached_until_ttl_expires() {
    let mut config = test_config();
    config.cache.dynamic_ttl_ms = 150;
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let first = executor.read("mem://doc", None).await.unwrap();
    let second = executor.read("mem://doc", None).await.unwrap();

    assert_eq!(first.text(), "hello world");
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(provider.count("resources/read"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let third = executor.read("mem://doc", None).await.unwrap();

    assert!(!third.from_cache);
    assert_eq!(provider.count("resources/read"), 2);
}

#[tokio::test]
async fn test_concurrent_reads_share_one_request() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let (first, second) = tokio::join!(
        executor.read("mem://doc", None),
        executor.read("mem://doc", None)
    );

    assert_eq!(first.unwrap().text(), "hello world");
    assert_eq!(second.unwrap().text(), "hello world");
    assert_eq!(provider.count("resources/read"), 1);
}

#[tokio::test]
async fn test_concurrent_failed_reads_all_see_the_error() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let (first, second) = tokio::join!(
        executor.read("mem://missing", None),
        executor.read("mem://missing", None)
    );

    for outcome in [first, second] {
        let err = outcome.unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(CapwireError::Remote { code: -32002, .. })
        ));
    }
    assert_eq!(provider.count("resources/read"), 1);

    // A failed flight is not remembered.
    assert!(executor.read("mem://missing", None).await.is_err());
    assert_eq!(provider.count("resources/read"), 2);
}

#[tokio::test]
async fn test_never_class_skips_the_cache() {
    let mut config = test_config();
    config
        .cache
        .overrides
        .insert("mem://doc".into(), CacheClass::Never);
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    executor.read("mem://doc", None).await.unwrap();
    executor.read("mem://doc", None).await.unwrap();

    assert_eq!(provider.count("resources/read"), 2);
}

#[tokio::test]
async fn test_read_range_applies_to_cached_contents() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let head = executor
        .read("mem://doc", Some(ReadRange::new(0, 5)))
        .await
        .unwrap();
    let tail = executor
        .read("mem://doc", Some(ReadRange::new(6, 5)))
        .await
        .unwrap();

    assert_eq!(head.text(), "hello");
    assert_eq!(tail.text(), "world");
    assert!(tail.from_cache);
    assert_eq!(provider.count("resources/read"), 1);
}

#[tokio::test]
async fn test_template_read_expands_arguments() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let result = executor
        .read_template("mem://docs/{name}", json!({ "name": "guide" }), None)
        .await
        .unwrap();

    assert_eq!(result.uri, "mem://docs/guide");
    assert_eq!(result.text(), "doc guide");
    let sent = provider.requests("resources/read");
    assert_eq!(sent[0]["params"]["uri"], "mem://docs/guide");
}

#[tokio::test]
async fn test_template_read_requires_every_variable() {
    let config = test_config();
    let (executor, provider) = connect_executor(&config, ProviderSpec::default()).await;

    let err = executor
        .read_template("mem://docs/{name}", json!({}), None)
        .await
        .unwrap_err();

    match classify(&err) {
        Some(CapwireError::Validation { violations, .. }) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].field, "name");
            assert_eq!(violations[0].kind, ViolationKind::Missing);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(provider.count("resources/read"), 0);
}
