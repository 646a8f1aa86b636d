//! In-memory state of submitted graphs
//!
//! A [`GraphRun`] is the live record of one graph submission. Only the
//! scheduler and the control paths mutate it, every mutation goes through a
//! single lock, and every mutation publishes a fresh [`GraphInfo`] snapshot
//! on a watch channel. Terminal states are absorbing: transitions out of
//! `Succeeded`, `Failed` or `Cancelled` are refused.

use crate::dag::WorkGraph;
use crate::models::{Data, GraphId, GraphInfo, GraphState, WorkId, WorkInfo, WorkState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

const UPSTREAM_FAILED: &str = "prerequisite work failed";

struct RunState {
    graph: GraphState,
    units: Vec<WorkInfo>,
    finished_at: Option<DateTime<Utc>>,
}

/// Live record of one submitted graph
pub struct GraphRun {
    id: GraphId,
    name: Option<String>,
    graph: Arc<WorkGraph>,
    enqueued_at: DateTime<Utc>,
    /// Request id -> unit index
    positions: HashMap<WorkId, usize>,
    stage_offsets: Vec<usize>,
    state: Mutex<RunState>,
    info_tx: watch::Sender<GraphInfo>,
    halt_tx: watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
}

impl GraphRun {
    /// Enqueue `graph`, assigning fresh identities to all of its units
    pub fn new(graph: Arc<WorkGraph>, name: Option<String>) -> Arc<Self> {
        let id = GraphId::new();
        let enqueued_at = Utc::now();

        let mut units = Vec::with_capacity(graph.unit_count());
        let mut positions = HashMap::with_capacity(graph.unit_count());
        let mut stage_offsets = Vec::with_capacity(graph.stages().len());

        for (stage, requests) in graph.stages().iter().enumerate() {
            stage_offsets.push(units.len());
            for request in requests {
                positions.insert(request.id(), units.len());
                units.push(WorkInfo {
                    id: WorkId::new(),
                    request_id: request.id(),
                    graph_id: id,
                    task: request.task().to_string(),
                    stage,
                    tags: request.tags().clone(),
                    state: if stage == 0 {
                        WorkState::Enqueued
                    } else {
                        WorkState::Blocked
                    },
                    run_attempt_count: 0,
                });
            }
        }

        let state = RunState {
            graph: GraphState::Enqueued,
            units,
            finished_at: None,
        };
        let (info_tx, _) = watch::channel(snapshot(id, &name, enqueued_at, &state));
        let (halt_tx, _) = watch::channel(false);
        let (drained_tx, _) = watch::channel(false);

        Arc::new(Self {
            id,
            name,
            graph,
            enqueued_at,
            positions,
            stage_offsets,
            state: Mutex::new(state),
            info_tx,
            halt_tx,
            drained_tx,
        })
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn graph(&self) -> &Arc<WorkGraph> {
        &self.graph
    }

    /// Index of the first unit of `stage`
    pub fn stage_offset(&self, stage: usize) -> usize {
        self.stage_offsets.get(stage).copied().unwrap_or(self.positions.len())
    }

    /// Latest snapshot
    pub fn info(&self) -> GraphInfo {
        self.info_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GraphInfo> {
        self.info_tx.subscribe()
    }

    pub fn graph_state(&self) -> GraphState {
        self.lock().graph.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().graph.is_terminal()
    }

    pub fn unit_state(&self, index: usize) -> Option<WorkState> {
        self.lock().units.get(index).map(|u| u.state.clone())
    }

    /// Whether a non-terminal unit carries `tag`
    pub fn has_active_tag(&self, tag: &str) -> bool {
        self.lock()
            .units
            .iter()
            .any(|u| !u.state.is_terminal() && u.tags.contains(tag))
    }

    pub fn units_with_tag(&self, tag: &str) -> Vec<WorkInfo> {
        self.lock()
            .units
            .iter()
            .filter(|u| u.tags.contains(tag))
            .cloned()
            .collect()
    }

    /// Move a live graph to a progress state (blocked, constrained, running)
    pub fn set_graph_state(&self, next: GraphState) -> bool {
        self.update(|state| {
            if state.graph.is_terminal() {
                return false;
            }
            state.graph = next;
            true
        })
    }

    /// Make the units of `stage` eligible to run
    pub fn release_stage(&self, stage: usize) {
        self.update(|state| {
            for unit in state.units.iter_mut().filter(|u| u.stage == stage) {
                if unit.state == WorkState::Blocked {
                    unit.state = WorkState::Enqueued;
                }
            }
        });
    }

    /// Start an attempt of unit `index`. Returns the attempt number, or
    /// `None` if the unit or its graph is already finished.
    pub fn start_attempt(&self, index: usize) -> Option<u32> {
        self.update(|state| {
            if state.graph.is_terminal() {
                return None;
            }
            let unit = state.units.get_mut(index)?;
            if unit.state.is_terminal() {
                return None;
            }
            unit.run_attempt_count += 1;
            unit.state = WorkState::Running;
            Some(unit.run_attempt_count)
        })
    }

    /// Park unit `index` until its next attempt
    pub fn set_unit_retry(&self, index: usize, next_attempt_at: DateTime<Utc>) -> bool {
        self.update_unit(index, |unit| {
            unit.state = WorkState::Retrying {
                attempt: unit.run_attempt_count,
                next_attempt_at,
            };
        })
    }

    pub fn complete_unit(&self, index: usize, output: Data) -> bool {
        self.update_unit(index, |unit| {
            unit.state = WorkState::Succeeded { output };
        })
    }

    /// Fail unit `index` terminally and halt the graph.
    ///
    /// Downstream units fail with it, and same-stage siblings still in flight
    /// are cancelled.
    pub fn fail_unit(&self, index: usize, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let downstream: Vec<usize> = match self.lock().units.get(index) {
            Some(unit) => self
                .graph
                .downstream_of(unit.request_id)
                .iter()
                .filter_map(|id| self.positions.get(id).copied())
                .collect(),
            None => return false,
        };

        self.update(|state| {
            if state.graph.is_terminal() || state.units[index].state.is_terminal() {
                return false;
            }

            let stage = state.units[index].stage;
            state.units[index].state = WorkState::Failed {
                reason: reason.clone(),
            };
            for &i in &downstream {
                state.units[i].state = WorkState::Failed {
                    reason: UPSTREAM_FAILED.to_string(),
                };
            }
            for unit in state.units.iter_mut().filter(|u| u.stage == stage) {
                if !unit.state.is_terminal() {
                    unit.state = WorkState::Cancelled;
                }
            }

            let task = state.units[index].task.clone();
            self.finish(
                state,
                GraphState::Failed {
                    reason: format!("{}: {}", task, reason),
                },
            );
            true
        })
    }

    /// Fail the whole graph; every unfinished unit fails with it
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.update(|state| {
            if state.graph.is_terminal() {
                return false;
            }
            for unit in state.units.iter_mut().filter(|u| !u.state.is_terminal()) {
                unit.state = WorkState::Failed {
                    reason: reason.clone(),
                };
            }
            self.finish(state, GraphState::Failed { reason });
            true
        })
    }

    /// Cancel the graph and every unfinished unit.
    ///
    /// In-flight attempts keep running; their results are discarded.
    pub fn cancel(&self) -> bool {
        self.update(|state| {
            if state.graph.is_terminal() {
                return false;
            }
            for unit in state.units.iter_mut().filter(|u| !u.state.is_terminal()) {
                unit.state = WorkState::Cancelled;
            }
            self.finish(state, GraphState::Cancelled);
            true
        })
    }

    /// Mark the graph succeeded with the merged output of its final stage
    pub fn succeed(&self, output: Data) -> bool {
        self.update(|state| {
            if state.graph.is_terminal() {
                return false;
            }
            self.finish(state, GraphState::Succeeded { output });
            true
        })
    }

    /// Whether the graph was halted by cancellation or failure
    pub fn is_halted(&self) -> bool {
        *self.halt_tx.borrow()
    }

    /// Resolves once the graph is halted
    pub async fn halted(&self) {
        let mut rx = self.halt_tx.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|halted| *halted).await;
    }

    /// Signal that the driver exited and no attempt is in flight
    pub fn mark_drained(&self) {
        self.drained_tx.send_replace(true);
    }

    pub fn is_drained(&self) -> bool {
        *self.drained_tx.borrow()
    }

    /// Resolves once the driver exited and no attempt is in flight
    pub async fn drained(&self) {
        let mut rx = self.drained_tx.subscribe();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    fn finish(&self, state: &mut RunState, terminal: GraphState) {
        debug!("Graph {} finished: {}", self.id, terminal);
        state.graph = terminal;
        state.finished_at = Some(Utc::now());
        self.halt_tx.send_replace(true);
    }

    fn update_unit(&self, index: usize, apply: impl FnOnce(&mut WorkInfo)) -> bool {
        self.update(|state| {
            if state.graph.is_terminal() {
                return false;
            }
            match state.units.get_mut(index) {
                Some(unit) if !unit.state.is_terminal() => {
                    apply(unit);
                    true
                }
                _ => false,
            }
        })
    }

    fn update<R>(&self, apply: impl FnOnce(&mut RunState) -> R) -> R {
        let mut state = self.lock();
        let result = apply(&mut state);
        self.info_tx
            .send_replace(snapshot(self.id, &self.name, self.enqueued_at, &state));
        result
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for GraphRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRun")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.graph_state())
            .finish()
    }
}

fn snapshot(
    id: GraphId,
    name: &Option<String>,
    enqueued_at: DateTime<Utc>,
    state: &RunState,
) -> GraphInfo {
    GraphInfo {
        id,
        name: name.clone(),
        state: state.graph.clone(),
        units: state.units.clone(),
        enqueued_at,
        finished_at: state.finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{GraphBuilder, WorkRequest};

    fn chain() -> Arc<GraphRun> {
        let graph = GraphBuilder::begin_with([
            WorkRequest::new("a").with_tag("fetch"),
            WorkRequest::new("b").with_tag("fetch"),
        ])
        .then([WorkRequest::new("c")])
        .then([WorkRequest::new("d")])
        .build()
        .unwrap();
        GraphRun::new(Arc::new(graph), Some("chain".to_string()))
    }

    #[test]
    fn test_new_run_states() {
        let run = chain();
        let info = run.info();

        assert_eq!(info.state, GraphState::Enqueued);
        assert_eq!(info.name.as_deref(), Some("chain"));
        assert_eq!(info.units.len(), 4);
        assert_eq!(info.units[0].state, WorkState::Enqueued);
        assert_eq!(info.units[1].state, WorkState::Enqueued);
        assert_eq!(info.units[2].state, WorkState::Blocked);
        assert_eq!(run.stage_offset(1), 2);
        assert_eq!(run.stage_offset(2), 3);
        assert!(info.units.iter().all(|u| u.graph_id == run.id()));
    }

    #[test]
    fn test_same_graph_gets_fresh_unit_ids() {
        let graph = Arc::new(
            GraphBuilder::begin_with([WorkRequest::new("a")])
                .build()
                .unwrap(),
        );
        let first = GraphRun::new(graph.clone(), None);
        let second = GraphRun::new(graph, None);

        let (a, b) = (&first.info().units[0], &second.info().units[0]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.request_id, b.request_id);
    }

    #[test]
    fn test_attempt_lifecycle() {
        let run = chain();

        assert_eq!(run.start_attempt(0), Some(1));
        assert_eq!(run.unit_state(0), Some(WorkState::Running));

        assert!(run.set_unit_retry(0, Utc::now()));
        assert!(matches!(
            run.unit_state(0),
            Some(WorkState::Retrying { attempt: 1, .. })
        ));

        assert_eq!(run.start_attempt(0), Some(2));
        assert!(run.complete_unit(0, Data::new().with("k", "v")));

        let info = run.info();
        assert_eq!(info.units[0].run_attempt_count, 2);
        assert_eq!(info.units[0].output().unwrap().get_str("k"), Some("v"));

        // Terminal units never move again
        assert_eq!(run.start_attempt(0), None);
        assert!(!run.set_unit_retry(0, Utc::now()));
        assert!(!run.complete_unit(0, Data::new()));
    }

    #[test]
    fn test_release_stage() {
        let run = chain();
        run.release_stage(1);
        assert_eq!(run.unit_state(2), Some(WorkState::Enqueued));
        assert_eq!(run.unit_state(3), Some(WorkState::Blocked));
    }

    #[test]
    fn test_fail_unit_halts_graph() {
        let run = chain();
        run.start_attempt(0);
        run.start_attempt(1);

        assert!(run.fail_unit(0, "retry budget exhausted"));

        let info = run.info();
        assert!(matches!(info.state, GraphState::Failed { .. }));
        assert!(info.finished_at.is_some());
        assert!(matches!(info.units[0].state, WorkState::Failed { .. }));
        // In-flight sibling is cancelled, downstream fails
        assert_eq!(info.units[1].state, WorkState::Cancelled);
        assert!(matches!(info.units[2].state, WorkState::Failed { .. }));
        assert!(matches!(info.units[3].state, WorkState::Failed { .. }));
        assert!(info.units.iter().all(|u| u.output().is_none()));
        assert!(run.is_halted());

        // Late results are discarded
        assert!(!run.complete_unit(1, Data::new()));
        assert!(!run.succeed(Data::new()));
        assert!(!run.fail_unit(1, "late"));
    }

    #[test]
    fn test_cancel_is_terminal() {
        let run = chain();
        run.start_attempt(0);
        run.complete_unit(0, Data::new());

        assert!(run.cancel());
        assert!(!run.cancel());
        assert!(!run.set_graph_state(GraphState::Running { stage: 1 }));

        let info = run.info();
        assert_eq!(info.state, GraphState::Cancelled);
        assert!(matches!(info.units[0].state, WorkState::Succeeded { .. }));
        assert!(info.units[1..]
            .iter()
            .all(|u| u.state == WorkState::Cancelled));
    }

    #[test]
    fn test_fail_whole_graph() {
        let run = chain();
        assert!(run.fail("predecessor failed"));
        let info = run.info();
        assert!(info
            .units
            .iter()
            .all(|u| matches!(u.state, WorkState::Failed { .. })));
    }

    #[test]
    fn test_tag_queries() {
        let run = chain();
        assert!(run.has_active_tag("fetch"));
        assert!(!run.has_active_tag("other"));
        assert_eq!(run.units_with_tag("fetch").len(), 2);

        run.cancel();
        assert!(!run.has_active_tag("fetch"));
        assert_eq!(run.units_with_tag("fetch").len(), 2);
    }

    #[tokio::test]
    async fn test_watch_publishes_transitions() {
        let run = chain();
        let mut rx = run.subscribe();

        run.set_graph_state(GraphState::Running { stage: 0 });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, GraphState::Running { stage: 0 });

        run.succeed(Data::new().with("message", "done"));
        let info = rx.wait_for(|i| i.state.is_terminal()).await.unwrap().clone();
        assert_eq!(info.output().unwrap().get_str("message"), Some("done"));
    }

    #[tokio::test]
    async fn test_halt_and_drain_signals() {
        let run = chain();
        assert!(!run.is_halted());
        assert!(!run.is_drained());

        let waiter = {
            let run = run.clone();
            tokio::spawn(async move {
                run.halted().await;
                run.drained().await;
            })
        };

        run.cancel();
        run.mark_drained();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(run.is_drained());
    }
}
