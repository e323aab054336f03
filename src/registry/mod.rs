//! Versioned handler registries.

pub mod handler_registry;

pub use handler_registry::{HandlerKey, HandlerRegistry, RegistrableHandler, RegistryStats};

use crate::orchestration::{StepHandler, TaskHandler};

/// Step handlers keyed by `(task namespace, step handler name, task version)`
pub type StepHandlerRegistry = HandlerRegistry<dyn StepHandler>;

/// Task handlers keyed by `(namespace, task name, version)`
pub type TaskHandlerRegistry = HandlerRegistry<dyn TaskHandler>;
