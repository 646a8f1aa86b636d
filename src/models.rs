//! Core data models for the ChainFlow work orchestrator

use crate::error::{ChainFlowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_UNIT_COUNT: usize = 1_000;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DATA_BYTES: usize = 10_240; // 10 KB, serialized

/// Validate a task, work or tag name: non-empty, bounded, `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ChainFlowError::InvalidName {
            name: name.to_string(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ChainFlowError::NameTooLong {
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChainFlowError::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Identity of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one submitted graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(Uuid);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primitive value stored in [`Data`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Bool(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<i32> for DataValue {
    fn from(value: i32) -> Self {
        DataValue::Int(i64::from(value))
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Text(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Text(value)
    }
}

/// Immutable key/value mapping passed into and out of work units.
///
/// Keys are ordered so merges and serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(BTreeMap<String, DataValue>);

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this mapping with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(DataValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(DataValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(DataValue::Float(v)) => Some(*v),
            Some(DataValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(DataValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite-merge: keys from `other` replace existing keys.
    pub fn merge_from(&mut self, other: &Data) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Keys from `required` that this mapping does not contain.
    pub fn missing_keys<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|key| !self.0.contains_key(key.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Size of the JSON encoding, used for the [`MAX_DATA_BYTES`] limit.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(&self.0)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX)
    }

    pub fn ensure_within_limit(&self) -> Result<()> {
        let size = self.serialized_size();
        if size > MAX_DATA_BYTES {
            return Err(ChainFlowError::DataTooLarge {
                size,
                limit: MAX_DATA_BYTES,
            });
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for Data
where
    K: Into<String>,
    V: Into<DataValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Work unit state.
///
/// `Succeeded`, `Failed` and `Cancelled` are terminal. Output data only
/// exists inside `Succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkState {
    Enqueued,
    Blocked,
    Running,
    Retrying {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Succeeded {
        output: Data,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Succeeded { .. } | WorkState::Failed { .. } | WorkState::Cancelled
        )
    }

    pub fn output(&self) -> Option<&Data> {
        match self {
            WorkState::Succeeded { output } => Some(output),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkState::Enqueued => "enqueued",
            WorkState::Blocked => "blocked",
            WorkState::Running => "running",
            WorkState::Retrying { .. } => "retrying",
            WorkState::Succeeded { .. } => "succeeded",
            WorkState::Failed { .. } => "failed",
            WorkState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkState::Retrying { attempt, .. } => write!(f, "retrying (attempt {})", attempt),
            WorkState::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Graph state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GraphState {
    Enqueued,
    /// Waiting for a predecessor graph under the same unique name
    Blocked,
    /// Waiting for the constraints of `stage` to hold
    Constrained {
        stage: usize,
    },
    Running {
        stage: usize,
    },
    Succeeded {
        output: Data,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl GraphState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphState::Succeeded { .. } | GraphState::Failed { .. } | GraphState::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            GraphState::Enqueued => "enqueued",
            GraphState::Blocked => "blocked",
            GraphState::Constrained { .. } => "constrained",
            GraphState::Running { .. } => "running",
            GraphState::Succeeded { .. } => "succeeded",
            GraphState::Failed { .. } => "failed",
            GraphState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphState::Constrained { stage } => write!(f, "constrained (stage {})", stage),
            GraphState::Running { stage } => write!(f, "running (stage {})", stage),
            GraphState::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Snapshot of one work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkInfo {
    /// Assigned when the owning graph is enqueued
    pub id: WorkId,
    /// Identity of the [`crate::dag::WorkRequest`] this unit was built from
    pub request_id: WorkId,
    pub graph_id: GraphId,
    pub task: String,
    pub stage: usize,
    pub tags: BTreeSet<String>,
    pub state: WorkState,
    pub run_attempt_count: u32,
}

impl WorkInfo {
    pub fn output(&self) -> Option<&Data> {
        self.state.output()
    }
}

/// Snapshot of one submitted graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInfo {
    pub id: GraphId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: GraphState,
    pub units: Vec<WorkInfo>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl GraphInfo {
    /// Merged output of the final stage, present only once succeeded.
    pub fn output(&self) -> Option<&Data> {
        match &self.state {
            GraphState::Succeeded { output } => Some(output),
            _ => None,
        }
    }

    pub fn unit(&self, id: WorkId) -> Option<&WorkInfo> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn units_for_task<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a WorkInfo> {
        self.units.iter().filter(move |u| u.task == task)
    }
}

/// What to do when a unique name already has work
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Cancel the existing chain and install the new graph
    Replace,
    /// Discard the new graph while the existing chain is unfinished
    Keep,
    /// Run after the existing chain, inheriting its failure or cancellation
    Append,
    /// Run after the existing chain; a failed or cancelled chain is not inherited
    AppendOrReplace,
}

impl std::fmt::Display for ExistingWorkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExistingWorkPolicy::Replace => write!(f, "replace"),
            ExistingWorkPolicy::Keep => write!(f, "keep"),
            ExistingWorkPolicy::Append => write!(f, "append"),
            ExistingWorkPolicy::AppendOrReplace => write!(f, "append_or_replace"),
        }
    }
}
