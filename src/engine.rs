//! Work engine service: submission, observation and control
//!
//! A [`WorkEngine`] is constructed explicitly inside a tokio runtime, shared
//! by cloning, and torn down with [`WorkEngine::shutdown`]. Submission,
//! cancellation and queries never wait on task execution: each accepted
//! graph gets its own driver task on the captured runtime.
//!
//! # Example
//!
//! ```
//! use chainflow::constraints::AlwaysSatisfied;
//! use chainflow::dag::{GraphBuilder, WorkRequest};
//! use chainflow::engine::WorkEngine;
//! use chainflow::models::Data;
//! use chainflow::settings::EngineConfig;
//! use chainflow::tasks::{task_fn, TaskOutcome, TaskRegistry};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> chainflow::error::Result<()> {
//! let mut tasks = TaskRegistry::new();
//! tasks.register("hello", task_fn(|_| async {
//!     Ok(TaskOutcome::Success(Data::new().with("message", "hello")))
//! }))?;
//!
//! let engine = WorkEngine::new(tasks, Arc::new(AlwaysSatisfied), EngineConfig::default())?;
//! let graph = GraphBuilder::begin_with([WorkRequest::new("hello")]).build()?;
//!
//! let handle = engine.submit(graph)?;
//! let info = handle.finished().await;
//! assert_eq!(info.output().and_then(|o| o.get_str("message")), Some("hello"));
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::constraints::{AlwaysSatisfied, ConstraintEvaluator};
use crate::dag::WorkGraph;
use crate::error::{ChainFlowError, Result};
use crate::metrics::EngineMetrics;
use crate::models::{
    validate_name, ExistingWorkPolicy, GraphId, GraphInfo, GraphState, WorkInfo,
};
use crate::registry::{Admission, Resolution, UniqueWorkRegistry};
use crate::scheduler::Scheduler;
use crate::settings::EngineConfig;
use crate::state::GraphRun;
use crate::tasks::TaskRegistry;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::info;

/// Observation handle for one submitted graph
#[derive(Debug, Clone)]
pub struct GraphHandle {
    id: GraphId,
    rx: watch::Receiver<GraphInfo>,
}

impl GraphHandle {
    fn new(run: &GraphRun) -> Self {
        Self {
            id: run.id(),
            rx: run.subscribe(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Latest snapshot
    pub fn info(&self) -> GraphInfo {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> GraphState {
        self.rx.borrow().state.clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<GraphInfo> {
        self.rx.clone()
    }

    /// Wait for the graph to reach a terminal state
    pub async fn finished(&self) -> GraphInfo {
        let mut rx = self.rx.clone();
        if let Ok(info) = rx.wait_for(|info| info.state.is_terminal()).await {
            return info.clone();
        }
        let info = rx.borrow().clone();
        info
    }
}

struct EngineInner {
    runtime: Handle,
    scheduler: Arc<Scheduler>,
    registry: UniqueWorkRegistry,
    graphs: Mutex<HashMap<GraphId, Arc<GraphRun>>>,
    /// Closed by shutdown; held across admission so no graph slips past it
    accepting: Mutex<bool>,
}

/// Dependency-aware work orchestrator
#[derive(Clone)]
pub struct WorkEngine {
    inner: Arc<EngineInner>,
}

impl WorkEngine {
    /// Create an engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::NoRuntime` - If called outside a tokio runtime
    /// * `ChainFlowError::Validation` - If `config` is out of range
    /// * `ChainFlowError::Metrics` - If the metrics registry cannot be built
    pub fn new(
        tasks: TaskRegistry,
        evaluator: Arc<dyn ConstraintEvaluator>,
        config: EngineConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ChainFlowError::NoRuntime)?;
        config.validate()?;
        let metrics = EngineMetrics::new()?;

        info!(
            "Work engine started ({} workers, {} task functions)",
            config.max_workers,
            tasks.len()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                runtime,
                scheduler: Arc::new(Scheduler::new(tasks, evaluator, config, metrics)),
                registry: UniqueWorkRegistry::new(),
                graphs: Mutex::new(HashMap::new()),
                accepting: Mutex::new(true),
            }),
        })
    }

    /// Engine with default configuration and no constraint gating
    pub fn with_defaults(tasks: TaskRegistry) -> Result<Self> {
        Self::new(tasks, Arc::new(AlwaysSatisfied), EngineConfig::default())
    }

    pub fn tasks(&self) -> &TaskRegistry {
        self.inner.scheduler.tasks()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        self.inner.scheduler.metrics()
    }

    /// Submit an independent graph
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::EngineShutdown` - After [`Self::shutdown`]
    /// * `ChainFlowError::UnknownTask` - If a unit names an unregistered task
    pub fn submit(&self, graph: impl Into<Arc<WorkGraph>>) -> Result<GraphHandle> {
        let graph = graph.into();
        self.check_tasks(&graph)?;

        let accepting = self.lock_accepting();
        if !*accepting {
            return Err(ChainFlowError::EngineShutdown);
        }

        let run = GraphRun::new(graph, None);
        self.launch(run.clone(), Admission::Start);
        info!("Submitted graph {}", run.id());
        Ok(GraphHandle::new(&run))
    }

    /// Submit a graph under a unique name, resolving conflicts with `policy`.
    ///
    /// With [`ExistingWorkPolicy::Keep`] and unfinished work under `name`,
    /// nothing is enqueued and the handle observes the existing graph.
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::EngineShutdown` - After [`Self::shutdown`]
    /// * `ChainFlowError::UnknownTask` - If a unit names an unregistered task
    /// * `ChainFlowError::InvalidName` / `NameTooLong` - For a malformed name
    pub fn submit_unique(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        graph: impl Into<Arc<WorkGraph>>,
    ) -> Result<GraphHandle> {
        validate_name(name)?;
        let graph = graph.into();
        self.check_tasks(&graph)?;

        let accepting = self.lock_accepting();
        if !*accepting {
            return Err(ChainFlowError::EngineShutdown);
        }

        let run = GraphRun::new(graph, Some(name.to_string()));
        match self.inner.registry.admit(name, policy, run.clone()) {
            Resolution::Kept(existing) => Ok(GraphHandle::new(&existing)),
            Resolution::Launch(admission) => {
                self.launch(run.clone(), admission);
                info!(
                    "Submitted graph {} as '{}' (policy {})",
                    run.id(),
                    name,
                    policy
                );
                Ok(GraphHandle::new(&run))
            }
        }
    }

    /// Snapshot of graph `id`
    pub fn status(&self, id: GraphId) -> Option<GraphInfo> {
        self.lock_graphs().get(&id).map(|run| run.info())
    }

    /// Snapshot of the graph currently active under `name`
    pub fn status_unique(&self, name: &str) -> Option<GraphInfo> {
        self.inner.registry.current(name).map(|run| run.info())
    }

    /// Snapshots of every graph chained under `name`, oldest first
    pub fn unique_chain(&self, name: &str) -> Vec<GraphInfo> {
        self.inner
            .registry
            .chain(name)
            .iter()
            .map(|run| run.info())
            .collect()
    }

    /// Observation handle for graph `id`
    pub fn handle(&self, id: GraphId) -> Option<GraphHandle> {
        self.lock_graphs().get(&id).map(|run| GraphHandle::new(run))
    }

    /// Snapshots of all known graphs, oldest first
    pub fn graphs(&self) -> Vec<GraphInfo> {
        let mut graphs: Vec<GraphInfo> = self.runs().iter().map(|run| run.info()).collect();
        graphs.sort_by_key(|info| info.enqueued_at);
        graphs
    }

    /// Every unit carrying `tag`, across all known graphs
    pub fn work_by_tag(&self, tag: &str) -> Vec<WorkInfo> {
        self.runs()
            .iter()
            .flat_map(|run| run.units_with_tag(tag))
            .collect()
    }

    /// Cancel graph `id`. Returns false if it is unknown or already finished.
    pub fn cancel(&self, id: GraphId) -> bool {
        let run = self.lock_graphs().get(&id).cloned();
        let cancelled = run.map(|run| run.cancel()).unwrap_or(false);
        if cancelled {
            info!("Cancelled graph {}", id);
        }
        cancelled
    }

    /// Cancel every graph with an unfinished unit carrying `tag`.
    /// Returns how many graphs were cancelled.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let cancelled = self
            .runs()
            .iter()
            .filter(|run| run.has_active_tag(tag))
            .filter(|run| run.cancel())
            .count();
        info!("Cancelled {} graph(s) tagged '{}'", cancelled, tag);
        cancelled
    }

    /// Cancel all unfinished work under `name`. Returns how many graphs were cancelled.
    pub fn cancel_unique(&self, name: &str) -> usize {
        let cancelled = self.inner.registry.cancel(name);
        info!("Cancelled {} graph(s) under '{}'", cancelled, name);
        cancelled
    }

    /// Cancel every unfinished graph. Returns how many graphs were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.runs().iter().filter(|run| run.cancel()).count()
    }

    /// Forget finished graphs whose drivers have exited. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        self.inner.registry.prune();
        let mut graphs = self.lock_graphs();
        let before = graphs.len();
        graphs.retain(|_, run| !(run.is_terminal() && run.is_drained()));
        before - graphs.len()
    }

    pub fn is_shut_down(&self) -> bool {
        !*self.lock_accepting()
    }

    /// Refuse new submissions, cancel outstanding graphs and wait until
    /// every in-flight attempt has finished.
    pub async fn shutdown(&self) {
        {
            let mut accepting = self.lock_accepting();
            if !*accepting {
                return;
            }
            *accepting = false;
        }

        let runs = self.runs();
        let cancelled = runs.iter().filter(|run| run.cancel()).count();
        info!(
            "Shutting down work engine: cancelled {} graph(s), draining {}",
            cancelled,
            runs.len()
        );

        join_all(runs.iter().map(|run| run.drained())).await;
        info!("Work engine shut down");
    }

    fn launch(&self, run: Arc<GraphRun>, admission: Admission) {
        self.lock_graphs().insert(run.id(), run.clone());
        let scheduler = self.inner.scheduler.clone();
        self.inner.runtime.spawn(scheduler.drive(run, admission));
    }

    fn check_tasks(&self, graph: &WorkGraph) -> Result<()> {
        for task in graph.task_names() {
            if !self.tasks().contains(task) {
                return Err(ChainFlowError::UnknownTask {
                    task: task.to_string(),
                });
            }
        }
        Ok(())
    }

    fn runs(&self) -> Vec<Arc<GraphRun>> {
        self.lock_graphs().values().cloned().collect()
    }

    fn lock_graphs(&self) -> MutexGuard<'_, HashMap<GraphId, Arc<GraphRun>>> {
        self.inner
            .graphs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_accepting(&self) -> MutexGuard<'_, bool> {
        self.inner
            .accepting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEngine")
            .field("scheduler", &self.inner.scheduler)
            .field("graphs", &self.lock_graphs().len())
            .finish()
    }
}
