//! Stage-by-stage graph executor
//!
//! One driver task per graph walks the stages in order. Before each stage it
//! waits for the stage's constraints, then runs every unit of the stage
//! concurrently and waits for all of them. Units only hold a worker permit
//! while an attempt executes; backoff delays and constraint waits are timers.

use crate::constraints::{ConstraintEvaluator, Constraints};
use crate::dag::WorkRequest;
use crate::metrics::EngineMetrics;
use crate::models::{Data, GraphState};
use crate::registry::Admission;
use crate::retry::RetryState;
use crate::settings::EngineConfig;
use crate::state::GraphRun;
use crate::tasks::{TaskOutcome, TaskRegistry};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Executes graph runs on a bounded worker pool
pub struct Scheduler {
    tasks: TaskRegistry,
    evaluator: Arc<dyn ConstraintEvaluator>,
    workers: Arc<Semaphore>,
    config: EngineConfig,
    metrics: EngineMetrics,
}

impl Scheduler {
    pub fn new(
        tasks: TaskRegistry,
        evaluator: Arc<dyn ConstraintEvaluator>,
        config: EngineConfig,
        metrics: EngineMetrics,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers));
        Self {
            tasks,
            evaluator,
            workers,
            config,
            metrics,
        }
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Drive `run` to a terminal state, then signal it drained
    pub async fn drive(self: Arc<Self>, run: Arc<GraphRun>, admission: Admission) {
        self.metrics.inc_active_graphs();
        info!(
            "Graph {} enqueued ({} stages, {} units)",
            run.id(),
            run.graph().stages().len(),
            run.graph().unit_count()
        );

        if let Some(input) = self.await_admission(&run, admission).await {
            self.execute_stages(&run, input).await;
        }

        let state = run.graph_state();
        match &state {
            GraphState::Succeeded { .. } => info!("Graph {} succeeded", run.id()),
            GraphState::Failed { reason } => error!("Graph {} failed: {}", run.id(), reason),
            GraphState::Cancelled => info!("Graph {} cancelled", run.id()),
            other => warn!("Graph {} driver exited in state {}", run.id(), other),
        }

        self.metrics.record_graph(state.label());
        self.metrics.dec_active_graphs();
        run.mark_drained();
    }

    /// Wait for whatever must finish before `run` starts. Returns the input
    /// of the first stage, or `None` if the run ended while waiting.
    async fn await_admission(&self, run: &GraphRun, admission: Admission) -> Option<Data> {
        match admission {
            Admission::Start => Some(Data::new()),
            Admission::AfterReplaced(replaced) => {
                run.set_graph_state(GraphState::Blocked);
                debug!(
                    "Graph {} waiting for {} replaced graph(s) to drain",
                    run.id(),
                    replaced.len()
                );
                tokio::select! {
                    _ = join_all(replaced.iter().map(|old| old.drained())) => Some(Data::new()),
                    _ = run.halted() => None,
                }
            }
            Admission::AfterAppended {
                predecessor,
                inherit_failure,
            } => {
                run.set_graph_state(GraphState::Blocked);
                debug!(
                    "Graph {} appended after graph {}",
                    run.id(),
                    predecessor.id()
                );
                tokio::select! {
                    _ = predecessor.drained() => {}
                    _ = run.halted() => return None,
                }

                match predecessor.graph_state() {
                    GraphState::Succeeded { output } => Some(output),
                    GraphState::Failed { reason } if inherit_failure => {
                        run.fail(format!("predecessor graph {} failed: {}", predecessor.id(), reason));
                        None
                    }
                    GraphState::Cancelled if inherit_failure => {
                        run.cancel();
                        None
                    }
                    _ => Some(Data::new()),
                }
            }
        }
    }

    async fn execute_stages(&self, run: &GraphRun, mut input: Data) {
        let graph = run.graph().clone();

        for (stage, requests) in graph.stages().iter().enumerate() {
            if run.is_halted() {
                return;
            }
            run.release_stage(stage);

            let constraints = graph.stage_constraints(stage);
            if !self.await_constraints(run, &constraints, Some(stage)).await {
                return;
            }
            if !run.set_graph_state(GraphState::Running { stage }) {
                return;
            }
            info!(
                "Graph {} launching stage {} ({} units)",
                run.id(),
                stage,
                requests.len()
            );

            let offset = run.stage_offset(stage);
            let upstream = &input;
            let outputs = join_all(
                requests
                    .iter()
                    .enumerate()
                    .map(|(i, request)| self.run_unit(run, offset + i, request, upstream)),
            )
            .await;

            // Declaration order; later units overwrite earlier keys
            let mut merged = Data::new();
            for output in outputs {
                match output {
                    Some(output) => merged.merge_from(&output),
                    None => return,
                }
            }
            input = merged;
        }

        run.succeed(input);
    }

    /// Wait until `constraints` hold. Returns false if the run halted first.
    async fn await_constraints(
        &self,
        run: &GraphRun,
        constraints: &Constraints,
        stage: Option<usize>,
    ) -> bool {
        if constraints.is_empty() {
            return !run.is_halted();
        }

        let mut waiting = false;
        loop {
            if run.is_halted() {
                return false;
            }
            if self.evaluator.currently_satisfied(constraints) {
                if waiting {
                    info!("Constraints satisfied for graph {}", run.id());
                }
                return true;
            }
            if !waiting {
                if let Some(stage) = stage {
                    run.set_graph_state(GraphState::Constrained { stage });
                }
                info!("Graph {} waiting for constraints {:?}", run.id(), constraints);
                waiting = true;
            }

            tokio::select! {
                _ = self.evaluator.changed() => debug!("Constraint evaluator signalled a change"),
                _ = tokio::time::sleep(self.config.constraint_poll_interval()) => {
                    debug!("Re-polling constraints for graph {}", run.id())
                }
                _ = run.halted() => return false,
            }
        }
    }

    /// Run unit `index` until it succeeds, fails terminally or the graph
    /// halts. Returns the unit's output on success.
    async fn run_unit(
        &self,
        run: &GraphRun,
        index: usize,
        request: &WorkRequest,
        upstream: &Data,
    ) -> Option<Data> {
        let task_name = request.task();
        let Some(task) = self.tasks.get(task_name) else {
            run.fail_unit(index, format!("no task function registered as '{}'", task_name));
            return None;
        };

        let mut input = request.input().clone();
        input.merge_from(upstream);

        let missing = input.missing_keys(request.required_inputs());
        if !missing.is_empty() {
            error!(
                "Task '{}' is missing required input: {}",
                task_name,
                missing.join(", ")
            );
            run.fail_unit(index, format!("missing required input: {}", missing.join(", ")));
            return None;
        }

        let policy = request
            .backoff()
            .copied()
            .unwrap_or_else(|| self.config.default_backoff());
        let constraints = run.graph().unit_constraints(request);
        let mut retry = RetryState::new();

        loop {
            // The first attempt was gated with the whole stage
            if retry.attempts > 0 && !self.await_constraints(run, &constraints, None).await {
                return None;
            }

            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        run.cancel();
                        return None;
                    }
                },
                _ = run.halted() => return None,
            };

            let attempt = run.start_attempt(index)?;
            retry.record_attempt();
            info!(
                "Executing task '{}' of graph {} (attempt {})",
                task_name,
                run.id(),
                attempt
            );

            self.metrics.inc_running_units();
            let started = Instant::now();
            let handle = {
                let task = task.clone();
                let input = input.clone();
                tokio::spawn(async move { task.execute(input).await })
            };
            let joined = handle.await;
            drop(permit);
            self.metrics.dec_running_units();
            let elapsed = started.elapsed().as_secs_f64();

            let (outcome, label) = match joined {
                Ok(Ok(outcome)) => {
                    let label = match &outcome {
                        TaskOutcome::Success(_) => "success",
                        TaskOutcome::Retry => "retry",
                        TaskOutcome::Failure => "failure",
                    };
                    (outcome, label)
                }
                Ok(Err(e)) => {
                    warn!("Task '{}' attempt {} failed: {:#}", task_name, attempt, e);
                    (TaskOutcome::Retry, "fault")
                }
                Err(e) => {
                    warn!("Task '{}' attempt {} panicked: {}", task_name, attempt, e);
                    (TaskOutcome::Retry, "fault")
                }
            };

            if run.is_halted() {
                debug!(
                    "Discarding result of task '{}' attempt {}: graph {} halted",
                    task_name,
                    attempt,
                    run.id()
                );
                self.metrics.record_attempt(task_name, "discarded", elapsed);
                return None;
            }
            self.metrics.record_attempt(task_name, label, elapsed);

            match outcome {
                TaskOutcome::Success(output) => {
                    if let Err(e) = output.ensure_within_limit() {
                        error!("Task '{}' produced oversized output: {}", task_name, e);
                        run.fail_unit(index, e.to_string());
                        return None;
                    }
                    info!("Task '{}' completed successfully", task_name);
                    run.complete_unit(index, output.clone());
                    return Some(output);
                }
                TaskOutcome::Failure => {
                    error!("Task '{}' reported a terminal failure", task_name);
                    run.fail_unit(index, "task reported terminal failure");
                    return None;
                }
                TaskOutcome::Retry => {
                    if retry.is_exhausted(&policy) {
                        error!(
                            "Task '{}' failed after {} attempts",
                            task_name, retry.attempts
                        );
                        run.fail_unit(
                            index,
                            format!("retry budget exhausted after {} attempts", retry.attempts),
                        );
                        return None;
                    }

                    let delay =
                        retry.next_delay(&policy, self.config.min_backoff(), self.config.max_backoff());
                    warn!(
                        "Task '{}' will retry in {}ms (attempt {})",
                        task_name,
                        delay.as_millis(),
                        retry.attempts + 1
                    );
                    if !run.set_unit_retry(index, retry.next_attempt_at(delay)) {
                        return None;
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = run.halted() => return None,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks)
            .field("config", &self.config)
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}
