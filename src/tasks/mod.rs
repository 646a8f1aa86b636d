//! Task functions and the registry the scheduler dispatches through

pub mod greeting;

use crate::error::{ChainFlowError, Result};
use crate::models::{validate_name, Data};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Result of one task function invocation
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Finished; the data becomes the unit's output
    Success(Data),
    /// Transient failure, attempt again per the unit's backoff policy
    Retry,
    /// Terminal failure, never retried
    Failure,
}

/// A unit of computation.
///
/// Implementations receive the merged output of the previous stage (plus the
/// request's own input) and must tolerate being invoked again for retries.
/// An `Err` or a panic is treated exactly like [`TaskOutcome::Retry`].
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn execute(&self, input: Data) -> anyhow::Result<TaskOutcome>;
}

/// Adapter turning an async closure into a [`TaskFunction`]
pub struct FnTask<F>(F);

impl<F> FnTask<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskFunction for FnTask<F>
where
    F: Fn(Data) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    async fn execute(&self, input: Data) -> anyhow::Result<TaskOutcome> {
        (self.0)(input).await
    }
}

/// Build a [`TaskFunction`] from an async closure
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Data) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    FnTask::new(f)
}

/// Named task functions. Work requests refer to tasks by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskFunction>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `name`
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::InvalidName` / `NameTooLong` - If the name is malformed
    /// * `ChainFlowError::DuplicateTask` - If the name is already taken
    pub fn register<T>(&mut self, name: &str, task: T) -> Result<()>
    where
        T: TaskFunction + 'static,
    {
        self.register_arc(name, Arc::new(task))
    }

    pub fn register_arc(&mut self, name: &str, task: Arc<dyn TaskFunction>) -> Result<()> {
        validate_name(name)?;
        if self.tasks.contains_key(name) {
            return Err(ChainFlowError::DuplicateTask {
                task: name.to_string(),
            });
        }
        self.tasks.insert(name.to_string(), task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
