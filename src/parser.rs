//! YAML parser with validation for graph specs
//!
//! ```yaml
//! name: welcome-chain        # optional unique work name
//! policy: replace            # replace | keep | append | append_or_replace
//! constraints:
//!   requires_charging: true
//!   network: connected
//! backoff:
//!   kind: exponential
//!   base_delay_ms: 10000
//!   max_attempts: 5
//! stages:
//!   - units:
//!       - task: fetch-work
//!       - task: fetch-manager
//!   - units:
//!       - task: welcome
//!         requires: [key_data_a, key_data_b]
//! ```

use crate::constraints::Constraints;
use crate::dag::{GraphBuilder, WorkGraph, WorkRequest};
use crate::error::{ChainFlowError, Result};
use crate::models::{validate_name, Data, ExistingWorkPolicy, MAX_UNIT_COUNT, MAX_YAML_SIZE};
use crate::retry::BackoffPolicy;
use crate::tasks::TaskRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parsed graph spec
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    /// Unique work name; submissions without one are independent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_policy")]
    pub policy: ExistingWorkPolicy,

    /// Graph-wide launch constraints
    #[serde(default)]
    pub constraints: Constraints,

    /// Default backoff for units that set none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,

    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub units: Vec<UnitSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    pub task: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Input keys the unit cannot run without
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    #[serde(default, skip_serializing_if = "Data::is_empty")]
    pub input: Data,

    #[serde(default)]
    pub constraints: Constraints,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
}

fn default_policy() -> ExistingWorkPolicy {
    ExistingWorkPolicy::Replace
}

impl GraphSpec {
    /// Build the immutable work graph described by this spec.
    ///
    /// Each call yields fresh request identities, so the same spec can be
    /// submitted any number of times.
    pub fn to_graph(&self) -> Result<WorkGraph> {
        let mut builder = GraphBuilder::new().with_constraints(self.constraints);

        for stage in &self.stages {
            let units = stage.units.iter().map(|unit| {
                let mut request = WorkRequest::new(unit.task.as_str())
                    .with_input(unit.input.clone())
                    .with_constraints(unit.constraints);
                for tag in &unit.tags {
                    request = request.with_tag(tag.as_str());
                }
                for key in &unit.requires {
                    request = request.with_required_input(key.as_str());
                }
                if let Some(backoff) = unit.backoff.or(self.backoff) {
                    request = request.with_backoff(backoff);
                }
                request
            });
            builder = builder.then(units);
        }

        builder.build()
    }

    /// Check that every task named by the spec is registered.
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::UnknownTask` - For the first unregistered task
    pub fn check_tasks(&self, registry: &TaskRegistry) -> Result<()> {
        for unit in self.stages.iter().flat_map(|s| &s.units) {
            if !registry.contains(&unit.task) {
                return Err(ChainFlowError::UnknownTask {
                    task: unit.task.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.stages.iter().map(|s| s.units.len()).sum()
    }
}

/// Parse a graph spec from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the YAML graph spec
///
/// # Errors
///
/// * `ChainFlowError::Io` - If the file cannot be read
/// * Everything [`parse_graph_yaml`] returns
///
/// # Example
///
/// ```no_run
/// use chainflow::parser::parse_graph_file;
///
/// let spec = parse_graph_file("graph.yaml")?;
/// println!("Loaded graph with {} units", spec.unit_count());
/// # Ok::<(), chainflow::error::ChainFlowError>(())
/// ```
pub fn parse_graph_file<P: AsRef<Path>>(path: P) -> Result<GraphSpec> {
    let content = fs::read_to_string(path)?;
    parse_graph_yaml(&content)
}

/// Parse a graph spec from a YAML string.
///
/// # Errors
///
/// * `ChainFlowError::YamlSizeExceeded` - If the content exceeds 1MB
/// * `ChainFlowError::YamlParse` - If the YAML is malformed
/// * `ChainFlowError::UnitCountExceeded` - If there are more than 1,000 units
/// * `ChainFlowError::InvalidName` / `NameTooLong` - For malformed names
/// * `ChainFlowError::Validation` - For duplicate tags or required keys
/// * Any graph build error (empty graph or stage, oversized input)
///
/// # Example
///
/// ```
/// use chainflow::parser::parse_graph_yaml;
///
/// let yaml = r#"
/// name: welcome
/// stages:
///   - units:
///       - task: fetch-work
/// "#;
///
/// let spec = parse_graph_yaml(yaml)?;
/// assert_eq!(spec.name.as_deref(), Some("welcome"));
/// # Ok::<(), chainflow::error::ChainFlowError>(())
/// ```
pub fn parse_graph_yaml(content: &str) -> Result<GraphSpec> {
    if content.len() > MAX_YAML_SIZE {
        return Err(ChainFlowError::YamlSizeExceeded(content.len()));
    }

    let spec: GraphSpec = serde_yaml::from_str(content)?;

    let count = spec.unit_count();
    if count > MAX_UNIT_COUNT {
        return Err(ChainFlowError::UnitCountExceeded {
            count,
            limit: MAX_UNIT_COUNT,
        });
    }

    if let Some(name) = &spec.name {
        validate_name(name)?;
    }

    for unit in spec.stages.iter().flat_map(|s| &s.units) {
        validate_unique(&unit.task, "tag", &unit.tags)?;
        validate_unique(&unit.task, "required key", &unit.requires)?;
    }

    // Builds and drops a graph so structural errors surface at parse time
    spec.to_graph()?;

    Ok(spec)
}

fn validate_unique(task: &str, what: &str, values: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(values.len());
    for value in values {
        if !seen.insert(value) {
            return Err(ChainFlowError::Validation(format!(
                "Duplicate {} '{}' on task '{}'",
                what, value, task
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::NetworkType;
    use crate::retry::BackoffKind;
    use crate::tasks::{task_fn, TaskOutcome};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const CHAIN: &str = r#"
name: welcome-chain
policy: append
constraints:
  requires_charging: true
  network: connected
backoff:
  kind: linear
  base_delay_ms: 10000
  max_attempts: 3
stages:
  - units:
      - task: fetch-work
        tags: [demo]
      - task: fetch-manager
        backoff:
          kind: exponential
          base_delay_ms: 20000
  - units:
      - task: welcome
        requires: [key_data_a, key_data_b]
        input:
          greeting: Welcome
"#;

    #[test]
    fn test_parse_full_spec() {
        let spec = parse_graph_yaml(CHAIN).unwrap();
        assert_eq!(spec.name.as_deref(), Some("welcome-chain"));
        assert_eq!(spec.policy, ExistingWorkPolicy::Append);
        assert_eq!(spec.constraints.network, NetworkType::Connected);
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.unit_count(), 3);
        assert_eq!(spec.stages[1].units[0].requires.len(), 2);
    }

    #[test]
    fn test_spec_to_graph_applies_defaults() {
        let spec = parse_graph_yaml(CHAIN).unwrap();
        let graph = spec.to_graph().unwrap();

        let fetch_work = &graph.stages()[0][0];
        assert!(fetch_work.tags().contains("demo"));
        let backoff = fetch_work.backoff().unwrap();
        assert_eq!(backoff.kind, BackoffKind::Linear);
        assert_eq!(backoff.max_attempts, Some(3));

        // Unit-level backoff wins over the graph default
        let fetch_manager = &graph.stages()[0][1];
        assert_eq!(fetch_manager.backoff().unwrap().kind, BackoffKind::Exponential);
        assert_eq!(
            fetch_manager.backoff().unwrap().base_delay,
            Duration::from_secs(20)
        );

        let welcome = &graph.stages()[1][0];
        assert_eq!(welcome.required_inputs(), ["key_data_a", "key_data_b"]);
        assert_eq!(welcome.input().get_str("greeting"), Some("Welcome"));
        assert!(graph.constraints().requires_charging);
    }

    #[test]
    fn test_to_graph_yields_fresh_ids() {
        let spec = parse_graph_yaml(CHAIN).unwrap();
        let first = spec.to_graph().unwrap();
        let second = spec.to_graph().unwrap();
        assert_ne!(first.stages()[0][0].id(), second.stages()[0][0].id());
    }

    #[test]
    fn test_policy_defaults_to_replace() {
        let spec = parse_graph_yaml("stages:\n  - units:\n      - task: a\n").unwrap();
        assert_eq!(spec.policy, ExistingWorkPolicy::Replace);
        assert!(spec.name.is_none());
    }

    #[test]
    fn test_size_limit() {
        let yaml = "a".repeat(MAX_YAML_SIZE + 1);
        assert!(matches!(
            parse_graph_yaml(&yaml),
            Err(ChainFlowError::YamlSizeExceeded(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            parse_graph_yaml("stages: [[["),
            Err(ChainFlowError::YamlParse(_))
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "stages:\n  - units:\n      - task: a\n        retries: 3\n";
        assert!(matches!(
            parse_graph_yaml(yaml),
            Err(ChainFlowError::YamlParse(_))
        ));
    }

    #[test]
    fn test_empty_specs_rejected() {
        assert!(matches!(
            parse_graph_yaml("stages: []"),
            Err(ChainFlowError::EmptyGraph)
        ));
        assert!(matches!(
            parse_graph_yaml("stages:\n  - units: []\n"),
            Err(ChainFlowError::EmptyStage { stage: 0 })
        ));
    }

    #[test]
    fn test_invalid_work_name() {
        let yaml = "name: \"bad name\"\nstages:\n  - units:\n      - task: a\n";
        assert!(matches!(
            parse_graph_yaml(yaml),
            Err(ChainFlowError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let yaml = "stages:\n  - units:\n      - task: a\n        tags: [x, x]\n";
        assert!(matches!(
            parse_graph_yaml(yaml),
            Err(ChainFlowError::Validation(_))
        ));
    }

    #[test]
    fn test_check_tasks() {
        let spec = parse_graph_yaml(CHAIN).unwrap();
        let mut registry = TaskRegistry::new();
        registry
            .register("fetch-work", task_fn(|_| async { Ok(TaskOutcome::Retry) }))
            .unwrap();

        assert!(matches!(
            spec.check_tasks(&registry),
            Err(ChainFlowError::UnknownTask { task }) if task == "fetch-manager"
        ));

        let mut full = TaskRegistry::new();
        crate::tasks::greeting::register(&mut full, 1.0).unwrap();
        assert!(spec.check_tasks(&full).is_ok());
    }

    #[test]
    fn test_parse_graph_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CHAIN.as_bytes()).unwrap();

        let spec = parse_graph_file(file.path()).unwrap();
        assert_eq!(spec.unit_count(), 3);

        assert!(matches!(
            parse_graph_file("/nonexistent/graph.yaml"),
            Err(ChainFlowError::Io(_))
        ));
    }
}
