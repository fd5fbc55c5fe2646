use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cre_host::{CapabilityRegistry, HostServices, LocalConsensus, Module, ModuleConfig};
use cre_protocol::{ExecuteRequest, ExecutionResult, Payload};

/// cre - run a workflow binary locally
#[derive(Parser)]
#[command(name = "cre")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Args)]
struct Target {
  /// Path to the workflow binary (wasm32-wasip1)
  wasm: PathBuf,

  /// Workflow config file, passed to the workflow as raw bytes
  #[arg(long)]
  config: Option<PathBuf>,

  /// Module limits (JSON, missing fields take their defaults)
  #[arg(long)]
  engine_config: Option<PathBuf>,

  /// Execution id (default: a random uuid)
  #[arg(long)]
  execution_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
  /// List the triggers the workflow subscribes to
  Subscribe {
    #[command(flatten)]
    target: Target,
  },

  /// Fire a trigger with a payload read from stdin
  Trigger {
    #[command(flatten)]
    target: Target,

    /// Index of the subscription to fire
    #[arg(long, default_value_t = 0)]
    index: u64,

    /// Type url of the trigger payload
    #[arg(long, default_value = "")]
    type_url: String,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Subscribe { target }) => {
      run(target, |id, config| Ok(ExecuteRequest::subscribe(id, config)))?;
    }
    Some(Commands::Trigger {
      target,
      index,
      type_url,
    }) => {
      run(target, |id, config| {
        let payload = Payload::new(type_url, read_payload_from_stdin()?);
        Ok(ExecuteRequest::trigger(id, config, index, payload))
      })?;
    }
    None => {
      println!("cre - use --help to see available commands");
    }
  }

  Ok(())
}

fn run(
  target: Target,
  build_request: impl FnOnce(String, Vec<u8>) -> Result<ExecuteRequest>,
) -> Result<()> {
  let config = match &target.config {
    Some(path) => std::fs::read(path)
      .with_context(|| format!("failed to read workflow config: {}", path.display()))?,
    None => Vec::new(),
  };
  let module_config = match &target.engine_config {
    Some(path) => ModuleConfig::from_json_file(path).context("failed to load engine config")?,
    None => ModuleConfig::default(),
  };
  let execution_id = target
    .execution_id
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  let request = build_request(execution_id, config)?;

  let rt = tokio::runtime::Runtime::new()?;
  let result = rt.block_on(async { execute(target.wasm, module_config, request).await })?;

  println!("{}", serde_json::to_string_pretty(&result)?);

  if let ExecutionResult::Error(error) = result {
    anyhow::bail!("workflow returned an error: {}", error);
  }
  Ok(())
}

async fn execute(
  wasm: PathBuf,
  module_config: ModuleConfig,
  request: ExecuteRequest,
) -> Result<ExecutionResult> {
  let module = Module::from_file(&wasm, module_config)
    .with_context(|| format!("failed to load workflow binary: {}", wasm.display()))?;
  info!(version = module.version(), "loaded workflow");

  let mut capabilities = CapabilityRegistry::new();
  capabilities
    .register(Arc::new(LocalConsensus::new()))
    .context("failed to register consensus capability")?;
  let services = HostServices::new(Arc::new(capabilities));

  let cancel = CancellationToken::new();
  let ctrl_c = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      ctrl_c.cancel();
    }
  });

  let result = module
    .execute(&request, services, cancel)
    .await
    .context("workflow execution failed");
  module.close();
  result
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}
