//! CLI interface for ChainFlow

use crate::constraints::{ConnectedNetwork, DeviceConditions, DeviceSnapshot};
use crate::engine::{GraphHandle, WorkEngine};
use crate::logging::{init_logging, LogConfig};
use crate::models::{GraphInfo, GraphState};
use crate::parser::{parse_graph_file, GraphSpec};
use crate::settings::EngineConfig;
use crate::tasks::{greeting, TaskRegistry};
use crate::templates;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// ChainFlow - Dependency-aware background work orchestrator
#[derive(Parser, Debug)]
#[command(name = "chainflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware background work orchestrator", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Engine configuration file (toml, yaml or json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a graph spec against the demo task set and wait for it
    Run {
        /// Path to graph spec YAML file
        graph: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Probability that a demo task attempt succeeds
        #[arg(long, default_value = "0.5")]
        success_rate: f64,

        /// Submit the graph this many times (exercises the unique work policy)
        #[arg(long, default_value = "1")]
        times: usize,

        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,
    },

    /// Validate a graph spec
    Validate {
        /// Path to graph spec YAML file
        graph: PathBuf,
    },

    /// Generate example graph spec templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Simulated device conditions for `run`
#[derive(clap::Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Device is charging
    #[arg(long)]
    pub charging: bool,

    /// Network state
    #[arg(long, value_enum, default_value = "unmetered")]
    pub network: NetworkArg,

    /// Battery is low
    #[arg(long)]
    pub battery_low: bool,

    /// Storage is low
    #[arg(long)]
    pub storage_low: bool,

    /// Device is idle
    #[arg(long)]
    pub idle: bool,

    /// After this many milliseconds, every condition becomes favourable
    #[arg(long)]
    pub satisfy_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkArg {
    Offline,
    Unmetered,
    Metered,
    Roaming,
}

impl DeviceArgs {
    pub fn snapshot(&self) -> DeviceSnapshot {
        let network = match self.network {
            NetworkArg::Offline => None,
            NetworkArg::Unmetered => Some(ConnectedNetwork::default()),
            NetworkArg::Metered => Some(ConnectedNetwork {
                metered: true,
                roaming: false,
            }),
            NetworkArg::Roaming => Some(ConnectedNetwork {
                metered: true,
                roaming: true,
            }),
        };
        DeviceSnapshot {
            charging: self.charging,
            network,
            battery_low: self.battery_low,
            storage_low: self.storage_low,
            idle: self.idle,
        }
    }
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// One tagged unit
    Single,
    /// Two parallel units as unique work
    Pair,
    /// Two parallel units, then a unit consuming both outputs
    Chain,
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: self.log_level.as_str().into(),
            format: self.log_format.as_str().into(),
        };
        init_logging(&config)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run {
                graph,
                device,
                success_rate,
                times,
                metrics,
            } => {
                self.run_graph(graph, device, *success_rate, *times, *metrics)
                    .await?;
            }
            Commands::Validate { graph } => {
                self.validate_graph(graph)?;
            }
            Commands::Template {
                template_type,
                output,
            } => {
                self.handle_template(template_type.as_ref(), output.as_ref())?;
            }
        }
        Ok(())
    }

    /// Submit a graph spec and wait for every submission to finish
    async fn run_graph(
        &self,
        graph_path: &Path,
        device_args: &DeviceArgs,
        success_rate: f64,
        times: usize,
        print_metrics: bool,
    ) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&success_rate) {
            anyhow::bail!("success rate must be between 0 and 1, got {}", success_rate);
        }

        info!("Loading graph spec from: {:?}", graph_path);
        let spec = parse_graph_file(graph_path)?;
        let config = EngineConfig::load(self.config.as_deref())?;

        let mut tasks = TaskRegistry::new();
        greeting::register(&mut tasks, success_rate)?;
        spec.check_tasks(&tasks)?;

        let device = Arc::new(DeviceConditions::new(device_args.snapshot()));
        let engine = WorkEngine::new(tasks, device.clone(), config)?;

        let handles = submit_spec(&engine, &spec, times.max(1))?;

        if let Some(ms) = device_args.satisfy_after_ms {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                info!("Device conditions now favourable");
                device.update(|s| {
                    *s = DeviceSnapshot {
                        charging: true,
                        network: Some(ConnectedNetwork::default()),
                        battery_low: false,
                        storage_low: false,
                        idle: true,
                    }
                });
            });
        }

        let mut failed = false;
        for handle in &handles {
            let info = handle.finished().await;
            print_graph(&info);
            failed |= matches!(info.state, GraphState::Failed { .. });
        }

        if print_metrics {
            print!("{}", engine.metrics().encode()?);
        }
        engine.shutdown().await;

        if failed {
            error!("Graph failed");
            std::process::exit(1);
        }
        info!("All graphs finished");
        Ok(())
    }

    /// Validate a graph spec without executing it
    fn validate_graph(&self, graph_path: &Path) -> anyhow::Result<()> {
        info!("Validating graph spec: {:?}", graph_path);

        let spec = parse_graph_file(graph_path)?;
        let graph = spec.to_graph()?;

        let mut demo = TaskRegistry::new();
        greeting::register(&mut demo, 1.0)?;

        println!("Graph spec is valid");
        if let Some(name) = &spec.name {
            println!("Unique name: {} (policy {})", name, spec.policy);
        }
        println!("Units: {}", graph.unit_count());
        for (stage, units) in graph.stages().iter().enumerate() {
            let tasks: Vec<&str> = units.iter().map(|u| u.task()).collect();
            println!("Stage {}: {}", stage, tasks.join(", "));
        }
        if let Err(e) = spec.check_tasks(&demo) {
            println!("Note: {} (not part of the demo task set)", e);
        }

        Ok(())
    }

    /// Handle the `template` subcommand.
    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: chainflow template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let type_name = match tt {
            TemplateType::Single => "single",
            TemplateType::Pair => "pair",
            TemplateType::Chain => "chain",
        };

        let content = templates::get_template(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", type_name))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }
}

/// Submit `spec` `times` times, as unique work when it is named
fn submit_spec(
    engine: &WorkEngine,
    spec: &GraphSpec,
    times: usize,
) -> anyhow::Result<Vec<GraphHandle>> {
    let mut handles = Vec::with_capacity(times);
    for _ in 0..times {
        let graph = spec.to_graph()?;
        let handle = match &spec.name {
            Some(name) => engine.submit_unique(name, spec.policy, graph)?,
            None => engine.submit(graph)?,
        };
        handles.push(handle);
    }
    Ok(handles)
}

fn print_graph(info: &GraphInfo) {
    let elapsed = info
        .finished_at
        .map(|end| format_duration((end - info.enqueued_at).num_seconds()))
        .unwrap_or_else(|| "-".to_string());

    println!("\nGraph {} {} ({})", info.id, info.state, elapsed);
    println!("{:<16} {:<6} {:<10} {:<32}", "TASK", "STAGE", "ATTEMPTS", "STATE");
    println!("{}", "-".repeat(66));
    for unit in &info.units {
        println!(
            "{:<16} {:<6} {:<10} {:<32}",
            unit.task, unit.stage, unit.run_attempt_count, unit.state
        );
    }
    if let Some(output) = info.output() {
        for key in output.keys() {
            if let Some(value) = output.get(key) {
                println!("  {} = {:?}", key, value);
            }
        }
    }
}

/// Format duration in seconds to human-readable string
fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
