//! `ploston` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`     — start the MCP frontend (stdio or HTTP).
//! - `tools`     — list / show / refresh the tool registry.
//! - `workflows` — list registered workflows.
//! - `validate`  — validate a workflow YAML file.
//! - `config`    — show / get / set configuration values.
//! - `test`      — run a workflow once with `--input k=v` pairs.
//!
//! Exit code 0 on success; on failure, stderr carries the structured
//! error object `{code, category, message, detail?, suggestion, retryable}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::warn;

use config::loader::LoadedConfig;
use config::{Mode, StagedConfig};
use engine::{Engine, WorkflowRegistry};
use errors::AelError;
use tools::builtin::builtin_descriptors;
use tools::mcp::McpClient;
use tools::{ToolBackend, ToolInvoker, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "ploston",
    about = "Deterministic agent execution layer — workflows over MCP tools",
    version
)]
struct Cli {
    /// Path to the configuration file (overrides discovery).
    #[arg(long, global = true, env = "PLOSTON_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Configuration,
    Running,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP frontend.
    Serve {
        /// Force a mode instead of deriving it from config discovery.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long, value_enum, default_value = "stdio")]
        transport: Transport,
        /// Bind address for the HTTP transport.
        #[arg(long, default_value = "127.0.0.1:3001")]
        bind: String,
    },
    /// Inspect the tool registry.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Inspect registered workflows.
    Workflows {
        #[command(subcommand)]
        action: WorkflowsAction,
    },
    /// Validate a workflow YAML file.
    Validate {
        /// Path to the workflow file.
        path: PathBuf,
    },
    /// Show or edit configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Execute a workflow once and print the result.
    Test {
        /// Workflow name.
        workflow: String,
        /// Inputs as key=value pairs (values parse as JSON, else string).
        #[arg(long = "input", value_name = "K=V")]
        inputs: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List all visible tools.
    List,
    /// Show one tool's descriptor.
    Show { name: String },
    /// Re-discover tools from all backends.
    Refresh,
}

#[derive(Subcommand)]
enum WorkflowsAction {
    /// List registered workflows.
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Read one value by dotted path.
    Get { path: String },
    /// Set one value by dotted path (value parses as JSON, else string).
    Set { path: String, value: String },
}

// ---------------------------------------------------------------------------
// Service container
// ---------------------------------------------------------------------------

/// Everything `main` wires together: no hidden global state.
struct Services {
    loaded: LoadedConfig,
    registry: Arc<ToolRegistry>,
    invoker: Arc<ToolInvoker>,
    workflows: Arc<WorkflowRegistry>,
    engine: Arc<Engine>,
    staged: Arc<StagedConfig>,
}

async fn build_services(
    config_path: Option<&PathBuf>,
    mode_override: Option<Mode>,
) -> Result<Services, AelError> {
    let loaded = config::load(config_path.map(|p| p.as_path()))?;
    let mode = mode_override.unwrap_or(loaded.mode);

    init_logging(&loaded);

    // Backends only spin up in running mode; configuration mode exposes
    // the self-config tools alone.
    let mut backends: Vec<Arc<dyn ToolBackend>> = Vec::new();
    if mode == Mode::Running {
        for (id, spec) in loaded.config.enabled_mcp_servers() {
            match McpClient::connect(&id, &spec).await {
                Ok(client) => backends.push(client),
                // A dead backend degrades discovery, it does not block
                // startup; its tools just stay absent.
                Err(e) => warn!(backend = %id, error = %e, "MCP backend unavailable"),
            }
        }
    }

    let registry = Arc::new(ToolRegistry::new(
        builtin_descriptors(&loaded.config.tools),
        backends,
        mode,
    ));

    let staged = Arc::new(match &loaded.path {
        Some(path) => StagedConfig::from_config(&loaded.config, path.clone()),
        None => StagedConfig::new(config::loader::default_write_path()),
    });

    let invoker = ToolInvoker::new(
        registry.clone(),
        staged.clone(),
        loaded.config.python_exec.clone(),
    );

    let workflows = if mode == Mode::Running {
        WorkflowRegistry::load(&loaded.config.workflows.directory)?
    } else {
        WorkflowRegistry::empty()
    };
    workflows.sync_tools(&registry);

    let engine = Engine::new(workflows.clone(), invoker.clone(), &loaded.config);
    invoker.set_workflow_runner(engine.clone());

    registry.refresh().await;

    if mode == Mode::Running && loaded.config.workflows.hot_reload {
        let _watcher = workflows.spawn_hot_reload(Duration::from_secs(2), registry.clone());
    }

    Ok(Services {
        loaded,
        registry,
        invoker: invoker.clone(),
        workflows,
        engine,
        staged,
    })
}

fn init_logging(loaded: &LoadedConfig) {
    use tracing_subscriber::EnvFilter;

    let logging = &loaded.config.logging;
    let mut filter = logging.level.clone();
    for (component, level) in &logging.components {
        filter.push_str(&format!(",{component}={level}"));
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr);

    // Errors here mean a subscriber is already set (tests); ignore.
    let _ = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        let shape = serde_json::to_string(&error)
            .unwrap_or_else(|_| format!("{{\"code\":\"INTERNAL_ERROR\",\"message\":\"{error}\"}}"));
        eprintln!("{shape}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AelError> {
    match cli.command {
        Command::Serve { mode, transport, bind } => {
            let mode = mode.map(|m| match m {
                ModeArg::Configuration => Mode::Configuration,
                ModeArg::Running => Mode::Running,
            });
            let services = build_services(cli.config.as_ref(), mode).await?;
            let state = api::AppState {
                registry: services.registry.clone(),
                invoker: services.invoker.clone(),
                engine: services.engine.clone(),
                server_name: services.loaded.config.server.name.clone(),
                server_version: services.loaded.config.server.version.clone(),
            };
            match transport {
                Transport::Stdio => api::serve_stdio(state)
                    .await
                    .map_err(|e| AelError::internal(format!("stdio transport: {e}"))),
                Transport::Http => api::serve_http(&bind, state)
                    .await
                    .map_err(|e| AelError::internal(format!("http transport: {e}"))),
            }
        }

        Command::Tools { action } => {
            let services = build_services(cli.config.as_ref(), None).await?;
            match action {
                ToolsAction::List => {
                    for tool in services.registry.list() {
                        println!("{}\t{}", tool.name, tool.description);
                    }
                    Ok(())
                }
                ToolsAction::Show { name } => {
                    let tool = services
                        .registry
                        .lookup(&name)
                        .ok_or_else(|| AelError::tool_unavailable(&name))?;
                    println!("{}", pretty(&serde_json::to_value(&tool).unwrap_or(Value::Null)));
                    Ok(())
                }
                ToolsAction::Refresh => {
                    let report = services.registry.refresh().await;
                    println!("{}", pretty(&serde_json::to_value(&report).unwrap_or(Value::Null)));
                    Ok(())
                }
            }
        }

        Command::Workflows { action } => {
            let services = build_services(cli.config.as_ref(), None).await?;
            match action {
                WorkflowsAction::List => {
                    for wf in services.workflows.list() {
                        println!(
                            "{}\t{}\t{}",
                            wf.name,
                            wf.version,
                            wf.description.as_deref().unwrap_or("")
                        );
                    }
                    Ok(())
                }
            }
        }

        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                AelError::input_invalid(format!("cannot read {}: {e}", path.display()))
            })?;
            let workflow = engine::parse_workflow_yaml(&content)?;
            engine::validate_workflow(&workflow)?;
            println!(
                "workflow '{}' v{} is valid ({} steps)",
                workflow.name,
                workflow.version,
                workflow.steps.len()
            );
            Ok(())
        }

        Command::Config { action } => {
            let services = build_services(cli.config.as_ref(), None).await?;
            match action {
                ConfigAction::Show => {
                    let doc = serde_yaml::to_string(&services.loaded.config)
                        .map_err(|e| AelError::internal(e.to_string()))?;
                    print!("{doc}");
                    Ok(())
                }
                ConfigAction::Get { path } => {
                    println!("{}", pretty(&services.staged.get(&path)?));
                    Ok(())
                }
                ConfigAction::Set { path, value } => {
                    services.staged.set(&path, parse_value(&value))?;
                    services.staged.commit()?;
                    println!("wrote {}", services.staged.write_path().display());
                    Ok(())
                }
            }
        }

        Command::Test { workflow, inputs } => {
            let services = build_services(cli.config.as_ref(), None).await?;
            let inputs = parse_inputs(&inputs)?;
            let result = services.engine.execute(&workflow, inputs).await?;
            let failed = result.status == engine::ExecutionStatus::Failed;
            println!(
                "{}",
                pretty(&serde_json::to_value(&result).unwrap_or(Value::Null))
            );
            if failed {
                return Err(result
                    .error
                    .unwrap_or_else(|| AelError::internal("execution failed")));
            }
            Ok(())
        }
    }
}

/// `k=v` pairs; values parse as JSON where possible, else plain strings.
fn parse_inputs(pairs: &[String]) -> Result<Value, AelError> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            AelError::input_invalid(format!("input '{pair}' is not in k=v form"))
        })?;
        map.insert(key.to_string(), parse_value(value));
    }
    Ok(Value::Object(map))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
