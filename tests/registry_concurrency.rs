//! Handler registry behaviour under concurrent registration.

mod common;

use std::sync::Arc;

use common::{Counting, Succeeding};
use tasker_engine::events::EventPublisher;
use tasker_engine::orchestration::StepHandler;
use tasker_engine::registry::StepHandlerRegistry;
use tasker_engine::TaskerError;

fn counting() -> Arc<dyn StepHandler> {
    Arc::new(Counting::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_are_all_resolvable() {
    let registry = Arc::new(StepHandlerRegistry::new());
    let mut tasks = Vec::new();

    for worker in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let mut registered = Vec::new();
            for index in 0..25 {
                let handler = counting();
                let name = format!("step_{worker}_{index}");
                registry
                    .register("bulk", &name, "1.0.0", Arc::clone(&handler), false)
                    .await
                    .unwrap();
                registered.push((name, handler));
            }
            registered
        }));
    }

    let mut expected = Vec::new();
    for task in tasks {
        expected.extend(task.await.unwrap());
    }

    assert_eq!(registry.len(), 200);
    for (name, handler) in &expected {
        let resolved = registry.resolve("bulk", name, "1.0.0").unwrap();
        assert!(Arc::ptr_eq(&resolved, handler), "{name} resolved to another handler");
    }
    assert_eq!(registry.list("bulk").len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_registrations_of_one_key_admit_exactly_one() {
    let registry = Arc::new(StepHandlerRegistry::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry
                .register("payments", "charge", "1.0.0", counting(), false)
                .await
        }));
    }

    let mut admitted = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(TaskerError::ConflictError { key }) => {
                assert_eq!(key, "payments/charge/1.0.0");
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_list_is_sorted_while_registrations_continue() {
    let registry = Arc::new(StepHandlerRegistry::new());
    let writer = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for index in 0..100 {
                registry
                    .register("reports", &format!("render_{index:03}"), "1.0.0", counting(), false)
                    .await
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        let listed = registry.list("reports");
        let mut sorted = listed.clone();
        sorted.sort();
        assert_eq!(listed, sorted);
        tokio::task::yield_now().await;
    }

    writer.await.unwrap();
    assert_eq!(registry.list("reports").len(), 100);
}

#[tokio::test]
async fn test_replace_swaps_the_resolved_handler() {
    let registry = StepHandlerRegistry::with_event_sink(Arc::new(EventPublisher::default()));
    let first = counting();
    let second: Arc<dyn StepHandler> = Arc::new(Succeeding);

    registry
        .register("inventory", "reserve", "2.1.0", Arc::clone(&first), false)
        .await
        .unwrap();
    registry
        .register("inventory", "reserve", "2.1.0", Arc::clone(&second), true)
        .await
        .unwrap();

    let resolved = registry.resolve("inventory", "reserve", "2.1.0").unwrap();
    assert!(Arc::ptr_eq(&resolved, &second));
    assert!(!Arc::ptr_eq(&resolved, &first));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_versions_and_namespaces_are_distinct_keys() {
    let registry = StepHandlerRegistry::new();
    for (namespace, name, version) in [
        ("inventory", "reserve", "1.0.0"),
        ("inventory", "reserve", "2.0.0"),
        ("inventory", "release", "1.0.0"),
        ("shipping", "reserve", "1.0.0"),
    ] {
        registry
            .register(namespace, name, version, counting(), false)
            .await
            .unwrap();
    }

    assert_eq!(
        registry.list("inventory"),
        vec![
            ("release".to_string(), "1.0.0".to_string()),
            ("reserve".to_string(), "1.0.0".to_string()),
            ("reserve".to_string(), "2.0.0".to_string()),
        ]
    );
    assert!(registry.list("billing").is_empty());

    let stats = registry.stats();
    assert_eq!(stats.total_handlers, 4);
    assert_eq!(stats.namespaces, vec!["inventory", "shipping"]);

    assert!(matches!(
        registry.resolve("inventory", "reserve", "3.0.0"),
        Err(TaskerError::NotFoundError(_))
    ));
}

#[tokio::test]
async fn test_invalid_keys_are_rejected() {
    let registry = StepHandlerRegistry::new();
    for (namespace, name, version) in [
        ("", "charge", "1.0.0"),
        ("payments", "", "1.0.0"),
        ("payments", "charge", "1.0"),
        ("payments", "charge", "v1.0.0"),
    ] {
        let result = registry
            .register(namespace, name, version, counting(), false)
            .await;
        assert!(
            matches!(result, Err(TaskerError::ValidationError(_))),
            "{namespace}/{name}/{version} should be rejected"
        );
    }
    assert!(registry.is_empty());
}

#[test]
fn test_registry_is_usable_from_synchronous_setup_code() {
    let registry = StepHandlerRegistry::new();
    tokio_test::block_on(registry.register("setup", "seed", "0.1.0", counting(), false)).unwrap();

    assert!(registry.contains("setup", "seed", "0.1.0"));
    assert!(tokio_test::block_on(registry.register("setup", "seed", "0.1.0", counting(), false)).is_err());
}
