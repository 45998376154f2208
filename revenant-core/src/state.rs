//! Agent state as handed to and returned from the engine.

use crate::{AgentId, EngineError, EngineResult, SegmentName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// An agent's execution state, split into named segments.
///
/// Task segments are JSON arrays whose elements carry an `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub segments: BTreeMap<SegmentName, Value>,
}

impl AgentState {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            segments: BTreeMap::new(),
        }
    }

    /// Builder: set a segment.
    pub fn with_segment(mut self, name: impl Into<SegmentName>, value: Value) -> Self {
        self.segments.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<SegmentName>, value: Value) -> Option<Value> {
        self.segments.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.segments.get(&SegmentName::new(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.segments.remove(&SegmentName::new(name))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drop engine metadata segments.
    pub fn without_reserved(mut self) -> Self {
        self.segments.retain(|name, _| !name.is_reserved());
        self
    }

    /// Append a task to `tasks.queued`, creating the segment if needed.
    ///
    /// A `tasks.queued` value that is not an array is left untouched and the
    /// task is refused.
    pub fn enqueue_task(&mut self, task: Value) -> EngineResult<()> {
        let queued = self
            .segments
            .entry(SegmentName::tasks_queued())
            .or_insert_with(|| Value::Array(Vec::new()));
        match queued {
            Value::Array(items) => {
                items.push(task);
                Ok(())
            }
            _ => Err(EngineError::InvalidState {
                reason: format!(
                    "{} of {} is not an array; refusing to replace it",
                    SegmentName::TASKS_QUEUED,
                    self.agent_id
                ),
            }),
        }
    }

    /// Identity keys of the tasks in `tasks.queued`.
    pub fn queued_task_keys(&self) -> Vec<String> {
        task_items(self.get(SegmentName::TASKS_QUEUED))
            .iter()
            .map(task_key)
            .collect()
    }
}

fn task_items(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

/// Identity of a queued task: its `id` field, or its whole JSON encoding
/// when it has none.
pub fn task_key(task: &Value) -> String {
    match task.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => task.to_string(),
    }
}

/// Merge queued tasks from discarded fork siblings into `primary`.
///
/// Every task keeps its first occurrence; the primary's own order is
/// preserved and sibling tasks are appended in sibling order. Returns the
/// number of tasks added. Fails without changing `primary` when sibling
/// tasks need a home and the primary's queue is not an array.
pub fn merge_queued_tasks(primary: &mut AgentState, siblings: &[AgentState]) -> EngineResult<usize> {
    let mut seen: HashSet<String> = primary.queued_task_keys().into_iter().collect();
    let mut added = Vec::new();

    for sibling in siblings {
        for task in task_items(sibling.get(SegmentName::TASKS_QUEUED)) {
            if seen.insert(task_key(task)) {
                added.push(task.clone());
            }
        }
    }

    let count = added.len();
    for task in added {
        primary.enqueue_task(task)?;
    }
    Ok(count)
}
