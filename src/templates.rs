//! Built-in graph spec templates for `chainflow template` subcommand.
//!
//! All three use the demo task set in [`crate::tasks::greeting`].

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "single",
            description: "One tagged unit, cancellable by tag",
        },
        TemplateInfo {
            name: "pair",
            description: "Two parallel units as unique work, replacing earlier runs",
        },
        TemplateInfo {
            name: "chain",
            description: "Two parallel units, then a unit consuming both outputs",
        },
    ]
}

/// Returns the YAML content for a given template type.
///
/// The `template_type` must be one of: `single`, `pair`, `chain`.
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "single" => Some(TEMPLATE_SINGLE),
        "pair" => Some(TEMPLATE_PAIR),
        "chain" => Some(TEMPLATE_CHAIN),
        _ => None,
    }
}

const TEMPLATE_SINGLE: &str = r#"# ChainFlow graph: single unit
# Cancel with the tag: all units tagged execute-task-a
constraints:
  requires_charging: true
  network: connected
  requires_battery_not_low: true

stages:
  - units:
      - task: fetch-work
        tags: [execute-task-a]
        backoff:
          kind: linear
          base_delay_ms: 10000
"#;

const TEMPLATE_PAIR: &str = r#"# ChainFlow graph: parallel pair as unique work
# Resubmitting replaces the running pair.
name: execute-task-a-and-b
policy: replace

constraints:
  requires_charging: true
  network: connected
  requires_battery_not_low: true

backoff:
  kind: linear
  base_delay_ms: 10000

stages:
  - units:
      - task: fetch-work
      - task: fetch-manager
"#;

const TEMPLATE_CHAIN: &str = r#"# ChainFlow graph: fan-in chain as unique work
# welcome runs only after both fetches succeed and receives both words.
name: execute-all-tasks
policy: replace

constraints:
  requires_charging: true
  network: connected
  requires_battery_not_low: true

backoff:
  kind: linear
  base_delay_ms: 10000

stages:
  - units:
      - task: fetch-work
      - task: fetch-manager
  - units:
      - task: welcome
        requires: [key_data_a, key_data_b]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExistingWorkPolicy;
    use crate::parser::parse_graph_yaml;
    use crate::tasks::{greeting, TaskRegistry};

    #[test]
    fn test_list_templates_returns_all() {
        let names: Vec<&str> = list_templates().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["single", "pair", "chain"]);
        assert!(list_templates().iter().all(|t| !t.description.is_empty()));
    }

    #[test]
    fn test_get_template_unknown_returns_none() {
        assert!(get_template("fan-out").is_none());
    }

    #[test]
    fn test_all_templates_parse_and_use_demo_tasks() {
        let mut registry = TaskRegistry::new();
        greeting::register(&mut registry, 0.5).unwrap();

        for template in list_templates() {
            let content = get_template(template.name).unwrap();
            let spec = parse_graph_yaml(content)
                .unwrap_or_else(|e| panic!("template '{}' invalid: {}", template.name, e));
            spec.check_tasks(&registry).unwrap();
            assert!(spec.constraints.requires_charging);
        }
    }

    #[test]
    fn test_template_shapes() {
        let single = parse_graph_yaml(get_template("single").unwrap()).unwrap();
        assert!(single.name.is_none());
        assert_eq!(single.stages[0].units[0].tags, vec!["execute-task-a"]);

        let pair = parse_graph_yaml(get_template("pair").unwrap()).unwrap();
        assert_eq!(pair.policy, ExistingWorkPolicy::Replace);
        assert_eq!(pair.stages.len(), 1);
        assert_eq!(pair.unit_count(), 2);

        let chain = parse_graph_yaml(get_template("chain").unwrap()).unwrap();
        assert_eq!(chain.name.as_deref(), Some("execute-all-tasks"));
        assert_eq!(chain.stages.len(), 2);
    }
}
