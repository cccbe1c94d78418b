use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;

use conductor::actors::{EchoExecutor, Executor};
use conductor::config::Config;
use conductor::core::{BatchGraph, Params};
use conductor::decompose::{Decomposer, RuleDecomposer};
use conductor::orchestration::TaskRequest;
use conductor::{Error, Result, System};

const DEMO_WORKER: &str = "echo";

/// Conductor - capability-tagged task orchestration
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.conductor/conductor.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run one request against an echo worker and print the outcome as JSON
    Run {
        /// Request type, e.g. market_trend
        request_type: String,

        /// Request parameter as key=value; the value is parsed as JSON when possible
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Priority hint, higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Capability for a request that has no decomposition rule
        #[arg(long)]
        capability: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// List the built-in decomposition rules and their stages
    Rules,

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    tracing::info!(debug = cli.debug, "conductor starting");

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Command::Run {
            request_type,
            params,
            priority,
            capability,
            wait_secs,
        } => {
            let config = Config::load_from(&config_path)?;
            let mut request = TaskRequest::new(&request_type)
                .with_params(params.into_iter().collect())
                .with_priority(priority);
            if let Some(capability) = capability.as_deref() {
                request = request.with_capability(capability);
            }
            run_request(config, request, Duration::from_secs(wait_secs))
        }
        Command::Rules => run_rules(),
        Command::Config { init } => run_config(&config_path, init),
    }
}

/// Run `request` on a fresh system whose only worker echoes its input.
fn run_request(config: Config, request: TaskRequest, wait: Duration) -> Result<()> {
    let decomposer = RuleDecomposer::with_builtin_rules();
    let capabilities = required_capabilities(&decomposer, &request);
    tracing::debug!(capabilities = ?capabilities, "demo worker capabilities");

    let echo: Arc<dyn Executor> = Arc::new(EchoExecutor);
    let executors: Vec<(String, Arc<dyn Executor>)> = capabilities
        .into_iter()
        .map(|c| (c, Arc::clone(&echo)))
        .collect();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let system = System::builder()
            .config(config)
            .decomposer(Arc::new(decomposer))
            .worker_with_limit(DEMO_WORKER, usize::MAX, executors)
            .start()?;

        let result = system.execute_timeout(request, wait).await;
        system.shutdown().await?;
        let (root, outcome) = result?;

        let output = serde_json::json!({
            "root": root.to_string(),
            "outcome": outcome,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok::<(), Error>(())
    })
}

/// Every leaf capability the tree for `request` can need.
fn required_capabilities(decomposer: &dyn Decomposer, request: &TaskRequest) -> BTreeSet<String> {
    let mut capabilities = BTreeSet::new();
    let root_capability = request
        .capability
        .clone()
        .unwrap_or_else(|| request.request_type.clone());
    let mut pending = VecDeque::from([(
        request.request_type.clone(),
        request.params.clone(),
        root_capability,
    )]);
    let mut seen = BTreeSet::new();

    while let Some((task_type, params, capability)) = pending.pop_front() {
        match decomposer.decompose(&task_type, &params) {
            Some(specs) if !specs.is_empty() => {
                if !seen.insert(task_type) {
                    continue;
                }
                for spec in specs {
                    pending.push_back((spec.task_type, spec.params, spec.required_capability));
                }
            }
            _ => {
                capabilities.insert(capability);
            }
        }
    }
    capabilities
}

fn run_rules() -> Result<()> {
    let decomposer = RuleDecomposer::with_builtin_rules();
    for name in decomposer.rule_names() {
        let specs = decomposer.decompose(name, &Params::new()).unwrap_or_default();
        let graph = BatchGraph::from_specs(&specs)?;
        println!("{}", name);
        for (index, stage) in graph.stages().iter().enumerate() {
            let entries: Vec<String> = stage
                .iter()
                .filter_map(|local| specs.iter().find(|s| s.local_id == *local))
                .map(|s| format!("{} ({} via {})", s.local_id, s.task_type, s.required_capability))
                .collect();
            println!("  stage {}: {}", index + 1, entries.join(", "));
        }
    }
    Ok(())
}

fn run_config(path: &Path, init: bool) -> Result<()> {
    if init && !path.exists() {
        Config::default().save_to(path)?;
        println!("Wrote defaults to {}", path.display());
    }
    let config = Config::load_from(path)?;
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("category=coffee").unwrap(),
            ("category".to_string(), json!("coffee"))
        );
        assert_eq!(parse_param("limit=5").unwrap(), ("limit".to_string(), json!(5)));
        assert_eq!(
            parse_param("tags=[\"a\",\"b\"]").unwrap().1,
            json!(["a", "b"])
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "market_trend",
            "-p",
            "category=tea",
            "--priority",
            "3",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                request_type,
                params,
                priority,
                ..
            } => {
                assert_eq!(request_type, "market_trend");
                assert_eq!(params, vec![("category".to_string(), json!("tea"))]);
                assert_eq!(priority, 3);
            }
            other => panic!("Expected Run, got {:?}", other),
        }
    }

    #[test]
    fn test_required_capabilities_walks_nested_rules() {
        let decomposer = RuleDecomposer::with_builtin_rules();
        let caps = required_capabilities(&decomposer, &TaskRequest::new("strategy_review"));
        let expected: BTreeSet<String> = [
            "business_strategy",
            "competitor_analysis",
            "competitor_data",
            "market_analysis",
            "market_data",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(caps, expected);
    }

    #[test]
    fn test_required_capabilities_for_leaf() {
        let decomposer = RuleDecomposer::with_builtin_rules();
        let caps = required_capabilities(
            &decomposer,
            &TaskRequest::new("ad_hoc").with_capability("special"),
        );
        assert_eq!(caps.into_iter().collect::<Vec<_>>(), vec!["special"]);
    }
}
