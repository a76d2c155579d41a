use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use spindle_checkpoint::{HttpCheckpointSink, HttpSinkConfig};
use spindle_engine::{RunIdentity, RunOptions};
use spindle_server::{Server, ServerConfig};
use spindle_store::{MemoryStore, SqliteStore, Store};

mod workflows;

/// Spindle - durable component workflows with checkpointing and suspension
#[derive(Parser)]
#[command(name = "spindle")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.spindle)
  #[arg(long, global = true, env = "SPINDLE_DATA_DIR")]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Serve the built-in workflows over HTTP
  Serve {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// Public base URL used in callback URLs
    #[arg(long, env = "SPINDLE_API_BASE")]
    api_base: Option<String>,

    /// Organization segment of checkpoint and callback routes
    #[arg(long, env = "SPINDLE_ORG", default_value = "local")]
    org: String,

    /// Keep executions in memory instead of the data directory
    #[arg(long)]
    in_memory: bool,
  },

  /// Run a built-in workflow with a JSON payload read from stdin
  Run {
    /// Name of the workflow
    workflow: String,

    /// Print output fragments as they are produced
    #[arg(long)]
    stream: bool,

    /// Send checkpoints to a spindle server at this base URL
    #[arg(long, env = "SPINDLE_CHECKPOINT_URL")]
    checkpoint_url: Option<String>,

    /// Organization used with --checkpoint-url
    #[arg(long, env = "SPINDLE_ORG", default_value = "local")]
    org: String,

    /// API key sent with checkpoints
    #[arg(long, env = "SPINDLE_API_KEY")]
    api_key: Option<String>,
  },

  /// List the built-in workflows
  List,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".spindle"),
  };

  match cli.command {
    Some(Commands::Serve {
      bind,
      api_base,
      org,
      in_memory,
    }) => {
      let config = ServerConfig {
        bind,
        api_base,
        org,
      };
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(serve(config, data_dir, in_memory))?;
    }
    Some(Commands::Run {
      workflow,
      stream,
      checkpoint_url,
      org,
      api_key,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_workflow(workflow, stream, checkpoint_url, org, api_key))?;
    }
    Some(Commands::List) => list_workflows()?,
    None => {
      println!("spindle - use --help to see available commands");
    }
  }

  Ok(())
}

async fn serve(config: ServerConfig, data_dir: PathBuf, in_memory: bool) -> Result<()> {
  let store: Arc<dyn Store> = if in_memory {
    Arc::new(MemoryStore::new())
  } else {
    tokio::fs::create_dir_all(&data_dir)
      .await
      .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let url = format!("sqlite://{}", data_dir.join("spindle.db").display());
    Arc::new(
      SqliteStore::connect(&url)
        .await
        .with_context(|| format!("failed to open store: {}", url))?,
    )
  };

  let registry = workflows::builtin().context("failed to register workflows")?;
  let server = Server::new(config, store, registry);

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("shutdown_requested");
      on_signal.cancel();
    }
  });

  server.serve(cancel).await.context("server failed")
}

async fn run_workflow(
  name: String,
  stream: bool,
  checkpoint_url: Option<String>,
  org: String,
  api_key: Option<String>,
) -> Result<()> {
  let registry = workflows::builtin().context("failed to register workflows")?;
  let registered = registry
    .get(&name)
    .with_context(|| format!("workflow '{}' not found", name))?;

  let payload = read_payload_from_stdin()?;

  let mut options = RunOptions::new();
  if let Some(api_base) = checkpoint_url {
    let sink = HttpCheckpointSink::new(HttpSinkConfig {
      api_base: api_base.clone(),
      org: org.clone(),
      api_key,
      ..HttpSinkConfig::default()
    })
    .context("failed to create checkpoint sink")?;
    options = options
      .with_sink(Arc::new(sink))
      .with_identity(RunIdentity {
        api_base: Some(api_base),
        org: Some(org),
        ..RunIdentity::default()
      });
  }

  let run = if stream {
    let mut live = registered.workflow.run_stream(payload, options).await;
    let mut stdout = io::stdout();
    while let Some(fragment) = live.next().await {
      match fragment {
        Ok(fragment) => {
          stdout.write_all(fragment.as_bytes())?;
          stdout.flush()?;
        }
        Err(message) => anyhow::bail!("stream failed: {}", message),
      }
    }
    writeln!(stdout)?;
    live.finish().await.context("workflow execution failed")?
  } else {
    let run = registered
      .workflow
      .run(payload, options)
      .await
      .context("workflow execution failed")?;
    println!("{}", serde_json::to_string_pretty(&run.output)?);
    run
  };

  eprintln!("Execution completed: {}", run.execution_id);
  Ok(())
}

fn list_workflows() -> Result<()> {
  let registry = workflows::builtin().context("failed to register workflows")?;
  for workflow in registry.list() {
    println!(
      "{}\t{}",
      workflow.name(),
      workflow.description.as_deref().unwrap_or_default()
    );
  }
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
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
}
