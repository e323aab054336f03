//! # Handler Registry
//!
//! Thread-safe, versioned lookup of executable handlers keyed by
//! `(namespace, name, version)`.
//!
//! Entries live in a `DashMap`, so registrations of distinct keys only contend
//! when they hash to the same shard, and a reader never sees a half-inserted
//! entry. `list` must be consistent at a single instant, which shard-by-shard
//! iteration alone does not give; registrations therefore hold a shared
//! snapshot gate and `list` takes it exclusively. Registrations never block
//! one another on the gate.
//!
//! The registry is an explicitly constructed value owned by the orchestration
//! root and passed by reference. There is no global instance.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info};

use crate::constants::events;
use crate::error::{Result, TaskerError};
use crate::events::{payload, publish_quietly, EventSink};
use crate::logging::log_registry_operation;

/// Key for handler lookup in the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl HandlerKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Convert to string key for storage
    pub fn key_string(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.version)
    }
}

/// Capability check every registrable handler type provides.
///
/// Runs once at registration so a misconfigured handler is rejected before
/// any step is dispatched to it.
pub trait RegistrableHandler: Send + Sync {
    /// Short label used in logs and errors, e.g. `"step handler"`
    fn handler_kind(&self) -> &'static str;

    fn validate_capabilities(&self) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_handlers: usize,
    pub namespaces: Vec<String>,
}

pub struct HandlerRegistry<H: ?Sized + RegistrableHandler> {
    handlers: DashMap<HandlerKey, Arc<H>>,
    snapshot_gate: RwLock<()>,
    events: Option<Arc<dyn EventSink>>,
}

impl<H: ?Sized + RegistrableHandler> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized + RegistrableHandler> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            snapshot_gate: RwLock::new(()),
            events: None,
        }
    }

    /// Create a registry that publishes its mutations
    pub fn with_event_sink(events: Arc<dyn EventSink>) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    /// Register `handler` under `(namespace, name, version)`.
    ///
    /// Fails with `ConflictError` if the key is taken and `allow_replace` is
    /// false, or with `ValidationError` if the key or the handler's
    /// capability check is invalid. Insert or overwrite is atomic.
    pub async fn register(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        handler: Arc<H>,
        allow_replace: bool,
    ) -> Result<()> {
        let key = HandlerKey::new(namespace, name, version);
        validate_key(&key)?;
        handler.validate_capabilities().map_err(|reason| {
            TaskerError::ValidationError(format!(
                "{} {key} failed capability check: {reason}",
                handler.handler_kind()
            ))
        })?;
        let kind = handler.handler_kind();

        let replaced = {
            let _gate = self.snapshot_gate.read();
            match self.handlers.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    if !allow_replace {
                        return Err(TaskerError::ConflictError {
                            key: key.key_string(),
                        });
                    }
                    entry.insert(handler);
                    true
                }
                Entry::Vacant(entry) => {
                    entry.insert(handler);
                    false
                }
            }
        };

        log_registry_operation(
            if replaced { "replace" } else { "register" },
            Some(key.namespace.as_str()),
            Some(key.name.as_str()),
            Some(key.version.as_str()),
            "success",
            Some(kind),
        );

        if let Some(sink) = &self.events {
            let event_name = if replaced {
                events::HANDLER_REPLACED
            } else {
                events::HANDLER_REGISTERED
            };
            publish_quietly(
                sink.as_ref(),
                event_name,
                payload([
                    ("namespace", json!(key.namespace)),
                    ("name", json!(key.name)),
                    ("version", json!(key.version)),
                    ("handler_kind", json!(kind)),
                ]),
            )
            .await;
        }

        Ok(())
    }

    /// Resolve the handler registered at `(namespace, name, version)`
    pub fn resolve(&self, namespace: &str, name: &str, version: &str) -> Result<Arc<H>> {
        self.resolve_key(&HandlerKey::new(namespace, name, version))
    }

    pub fn resolve_key(&self, key: &HandlerKey) -> Result<Arc<H>> {
        match self.handlers.get(key) {
            Some(entry) => {
                debug!(key = %key, "Handler resolved");
                Ok(Arc::clone(entry.value()))
            }
            None => Err(TaskerError::NotFoundError(format!(
                "No handler registered for {key}"
            ))),
        }
    }

    pub fn contains(&self, namespace: &str, name: &str, version: &str) -> bool {
        self.handlers
            .contains_key(&HandlerKey::new(namespace, name, version))
    }

    /// All `(name, version)` pairs in `namespace`, sorted, as of one instant
    pub fn list(&self, namespace: &str) -> Vec<(String, String)> {
        let _gate = self.snapshot_gate.write();
        let mut entries: Vec<(String, String)> = self
            .handlers
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| (entry.key().name.clone(), entry.key().version.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let _gate = self.snapshot_gate.write();
        let mut namespaces: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();

        let stats = RegistryStats {
            total_handlers: self.handlers.len(),
            namespaces,
        };
        info!(
            total_handlers = stats.total_handlers,
            namespaces = stats.namespaces.len(),
            "Registry stats collected"
        );
        stats
    }
}

fn validate_key(key: &HandlerKey) -> Result<()> {
    if key.namespace.is_empty() {
        return Err(TaskerError::ValidationError(
            "Handler namespace cannot be empty".to_string(),
        ));
    }
    if key.name.is_empty() {
        return Err(TaskerError::ValidationError(
            "Handler name cannot be empty".to_string(),
        ));
    }
    if !is_valid_semver(&key.version) {
        return Err(TaskerError::ValidationError(format!(
            "Invalid version format: '{}'",
            key.version
        )));
    }
    Ok(())
}

/// `MAJOR.MINOR.PATCH`, numeric parts only
fn is_valid_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|part| part.parse::<u32>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
        fn ready(&self) -> bool {
            true
        }
    }

    impl RegistrableHandler for dyn Greeter {
        fn handler_kind(&self) -> &'static str {
            "greeter"
        }

        fn validate_capabilities(&self) -> std::result::Result<(), String> {
            if self.ready() {
                Ok(())
            } else {
                Err("not ready".to_string())
            }
        }
    }

    struct Hello(&'static str);

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello {}", self.0)
        }
    }

    struct Broken;

    impl Greeter for Broken {
        fn greet(&self) -> String {
            String::new()
        }
        fn ready(&self) -> bool {
            false
        }
    }

    fn hello(who: &'static str) -> Arc<dyn Greeter> {
        Arc::new(Hello(who))
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry: HandlerRegistry<dyn Greeter> = HandlerRegistry::new();
        registry
            .register("payments", "charge", "1.0.0", hello("a"), false)
            .await
            .unwrap();

        let handler = registry.resolve("payments", "charge", "1.0.0").unwrap();
        assert_eq!(handler.greet(), "hello a");
        assert!(matches!(
            registry.resolve("payments", "charge", "2.0.0"),
            Err(TaskerError::NotFoundError(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_without_replace() {
        let registry: HandlerRegistry<dyn Greeter> = HandlerRegistry::new();
        registry
            .register("payments", "charge", "1.0.0", hello("a"), false)
            .await
            .unwrap();

        let err = registry
            .register("payments", "charge", "1.0.0", hello("b"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskerError::ConflictError { .. }));
        assert_eq!(
            registry.resolve("payments", "charge", "1.0.0").unwrap().greet(),
            "hello a"
        );

        registry
            .register("payments", "charge", "1.0.0", hello("b"), true)
            .await
            .unwrap();
        assert_eq!(
            registry.resolve("payments", "charge", "1.0.0").unwrap().greet(),
            "hello b"
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_at_registration() {
        let registry: HandlerRegistry<dyn Greeter> = HandlerRegistry::new();

        assert!(registry
            .register("", "charge", "1.0.0", hello("a"), false)
            .await
            .is_err());
        assert!(registry
            .register("payments", "charge", "1.0", hello("a"), false)
            .await
            .is_err());
        assert!(registry
            .register("payments", "charge", "v1.0.0", hello("a"), false)
            .await
            .is_err());

        let err = registry
            .register("payments", "charge", "1.0.0", Arc::new(Broken), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_namespace() {
        let registry: HandlerRegistry<dyn Greeter> = HandlerRegistry::new();
        for (ns, name, version) in [
            ("payments", "refund", "1.0.0"),
            ("payments", "charge", "2.0.0"),
            ("payments", "charge", "1.0.0"),
            ("inventory", "reserve", "1.0.0"),
        ] {
            registry
                .register(ns, name, version, hello("x"), false)
                .await
                .unwrap();
        }

        assert_eq!(
            registry.list("payments"),
            vec![
                ("charge".to_string(), "1.0.0".to_string()),
                ("charge".to_string(), "2.0.0".to_string()),
                ("refund".to_string(), "1.0.0".to_string()),
            ]
        );
        assert!(registry.list("shipping").is_empty());
        assert_eq!(
            registry.stats().namespaces,
            vec!["inventory".to_string(), "payments".to_string()]
        );
    }

    #[tokio::test]
    async fn test_registry_mutations_are_published() {
        let publisher = Arc::new(EventPublisher::default());
        let mut rx = publisher.subscribe();
        let registry: HandlerRegistry<dyn Greeter> = HandlerRegistry::with_event_sink(publisher);

        registry
            .register("payments", "charge", "1.0.0", hello("a"), false)
            .await
            .unwrap();
        registry
            .register("payments", "charge", "1.0.0", hello("b"), true)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name, events::HANDLER_REGISTERED);
        let replaced = rx.recv().await.unwrap();
        assert_eq!(replaced.name, events::HANDLER_REPLACED);
        assert_eq!(replaced.payload["handler_kind"], json!("greeter"));
    }
}
