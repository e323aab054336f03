use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::system::PROVIDES_EDGE_NAME;

/// WorkflowStepEdge represents a dependency relationship between two steps:
/// `to_step` depends on `from_step`.
///
/// Parent and child lookups are always derived from the edge set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepEdge {
    pub from_step_uuid: Uuid,
    pub to_step_uuid: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// New WorkflowStepEdge for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowStepEdge {
    pub from_step_uuid: Uuid,
    pub to_step_uuid: Uuid,
    pub name: String,
}

impl NewWorkflowStepEdge {
    pub fn provides(from_step_uuid: Uuid, to_step_uuid: Uuid) -> Self {
        Self {
            from_step_uuid,
            to_step_uuid,
            name: PROVIDES_EDGE_NAME.to_string(),
        }
    }
}

impl WorkflowStepEdge {
    pub fn from_new(new_edge: NewWorkflowStepEdge, now: DateTime<Utc>) -> Self {
        Self {
            from_step_uuid: new_edge.from_step_uuid,
            to_step_uuid: new_edge.to_step_uuid,
            name: new_edge.name,
            created_at: now,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.from_step_uuid == self.to_step_uuid
    }
}
