use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::registry::HandlerKey;
use crate::state_machine::TaskState;

/// A submitted unit of work: an identity, a (namespace, name, version) triple
/// resolving to its task handler, an opaque context payload and the ordered
/// set of steps held by the graph store.
///
/// `current_state` is materialised from the task's most recent transition and
/// is only ever changed through [`crate::state_machine::TaskStateMachine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_uuid: Uuid,
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub context: Value,
    pub current_state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// New Task for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub context: Value,
}

impl NewTask {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            context: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl Task {
    /// Materialise a task record from a creation request
    pub fn from_new(new_task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            task_uuid: Uuid::new_v4(),
            namespace: new_task.namespace,
            name: new_task.name,
            version: new_task.version,
            context: new_task.context,
            current_state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Registry key for this task's handler
    pub fn handler_key(&self) -> HandlerKey {
        HandlerKey::new(&self.namespace, &self.name, &self.version)
    }

    /// Registry key for a step handler within this task's namespace and version
    pub fn step_handler_key(&self, handler_name: &str) -> HandlerKey {
        HandlerKey::new(&self.namespace, handler_name, &self.version)
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }
}
