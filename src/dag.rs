//! Dependency graph of work units: an ordered pipeline of parallel stages
//!
//! Every unit of stage `n + 1` depends on every unit of stage `n`. Because a
//! request can sit in exactly one stage, the graph is acyclic by
//! construction and no cycle detection is needed.

use crate::constraints::Constraints;
use crate::error::{ChainFlowError, Result};
use crate::models::{validate_name, Data, WorkId, MAX_UNIT_COUNT};
use crate::retry::BackoffPolicy;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Description of one unit of work: which task to run and how
#[derive(Debug, Clone)]
pub struct WorkRequest {
    id: WorkId,
    task: String,
    tags: BTreeSet<String>,
    input: Data,
    required_inputs: Vec<String>,
    constraints: Constraints,
    backoff: Option<BackoffPolicy>,
}

impl WorkRequest {
    /// New request for the task function registered as `task`
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: WorkId::new(),
            task: task.into(),
            tags: BTreeSet::new(),
            input: Data::new(),
            required_inputs: Vec::new(),
            constraints: Constraints::none(),
            backoff: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Initial input; upstream stage output is merged over it
    pub fn with_input(mut self, input: Data) -> Self {
        self.input = input;
        self
    }

    /// Declare an input key this unit cannot run without
    pub fn with_required_input(mut self, key: impl Into<String>) -> Self {
        self.required_inputs.push(key.into());
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn input(&self) -> &Data {
        &self.input
    }

    pub fn required_inputs(&self) -> &[String] {
        &self.required_inputs
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn backoff(&self) -> Option<&BackoffPolicy> {
        self.backoff.as_ref()
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.task)?;
        for tag in &self.tags {
            validate_name(tag)?;
        }
        for key in &self.required_inputs {
            if key.is_empty() {
                return Err(ChainFlowError::Validation(format!(
                    "Task '{}' declares an empty required input key",
                    self.task
                )));
            }
        }
        self.input.ensure_within_limit()
    }
}

/// Assembles stages into a [`WorkGraph`]
#[derive(Debug, Default)]
pub struct GraphBuilder {
    stages: Vec<Vec<WorkRequest>>,
    constraints: Constraints,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a graph whose first stage is `units`
    pub fn begin_with(units: impl IntoIterator<Item = WorkRequest>) -> Self {
        Self::new().then(units)
    }

    /// Append a stage that runs once every unit of the previous stage succeeded
    pub fn then(mut self, units: impl IntoIterator<Item = WorkRequest>) -> Self {
        self.stages.push(units.into_iter().collect());
        self
    }

    /// Constraints gating the launch of every unit in the graph
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Validate and freeze the graph
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::EmptyGraph` - If no stage was added
    /// * `ChainFlowError::EmptyStage` - If a stage has no units
    /// * `ChainFlowError::DuplicateUnit` - If a request appears twice
    /// * `ChainFlowError::UnitCountExceeded` - If the graph has too many units
    /// * `ChainFlowError::InvalidName` / `NameTooLong` - For malformed task or tag names
    /// * `ChainFlowError::DataTooLarge` - If a request's input is oversized
    pub fn build(self) -> Result<WorkGraph> {
        if self.stages.is_empty() {
            return Err(ChainFlowError::EmptyGraph);
        }

        let count: usize = self.stages.iter().map(Vec::len).sum();
        if count > MAX_UNIT_COUNT {
            return Err(ChainFlowError::UnitCountExceeded {
                count,
                limit: MAX_UNIT_COUNT,
            });
        }

        let mut seen = HashSet::with_capacity(count);
        for (stage, units) in self.stages.iter().enumerate() {
            if units.is_empty() {
                return Err(ChainFlowError::EmptyStage { stage });
            }
            for unit in units {
                unit.validate()?;
                if !seen.insert(unit.id) {
                    return Err(ChainFlowError::DuplicateUnit {
                        id: unit.id.to_string(),
                    });
                }
            }
        }

        let mut dag = DiGraph::with_capacity(count, count);
        let mut indices = HashMap::with_capacity(count);
        for unit in self.stages.iter().flatten() {
            indices.insert(unit.id, dag.add_node(unit.id));
        }

        // Edge from each unit to every unit of the following stage
        for pair in self.stages.windows(2) {
            for upstream in &pair[0] {
                for downstream in &pair[1] {
                    dag.add_edge(indices[&upstream.id], indices[&downstream.id], ());
                }
            }
        }

        Ok(WorkGraph {
            stages: self.stages,
            constraints: self.constraints,
            dag,
            indices,
        })
    }
}

/// Immutable, validated dependency graph. Resubmission reuses it as is.
#[derive(Debug, Clone)]
pub struct WorkGraph {
    stages: Vec<Vec<WorkRequest>>,
    constraints: Constraints,
    dag: DiGraph<WorkId, ()>,
    indices: HashMap<WorkId, NodeIndex>,
}

impl WorkGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn stages(&self) -> &[Vec<WorkRequest>] {
        &self.stages
    }

    /// Graph-wide constraints
    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn unit_count(&self) -> usize {
        self.indices.len()
    }

    pub fn units(&self) -> impl Iterator<Item = &WorkRequest> {
        self.stages.iter().flatten()
    }

    /// Distinct task names used by the graph
    pub fn task_names(&self) -> BTreeSet<&str> {
        self.units().map(WorkRequest::task).collect()
    }

    /// Constraints that must hold to launch `unit`
    pub fn unit_constraints(&self, unit: &WorkRequest) -> Constraints {
        self.constraints.union(unit.constraints())
    }

    /// Constraints that must hold to launch every unit of `stage`
    pub fn stage_constraints(&self, stage: usize) -> Constraints {
        self.stages
            .get(stage)
            .into_iter()
            .flatten()
            .fold(self.constraints, |acc, unit| acc.union(unit.constraints()))
    }

    /// Every request transitively waiting on `id`
    pub fn downstream_of(&self, id: WorkId) -> Vec<WorkId> {
        let Some(&start) = self.indices.get(&id) else {
            return Vec::new();
        };

        let mut dfs = Dfs::new(&self.dag, start);
        let mut downstream = Vec::new();
        while let Some(node) = dfs.next(&self.dag) {
            if node != start {
                downstream.push(self.dag[node]);
            }
        }
        downstream
    }
}
