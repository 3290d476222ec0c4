use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lumen_engine::{Engine, EngineConfig, LogNotifier};
use lumen_flow::{FlowRegistry, FlowsFile, HandlerRegistry};
use lumen_handler_http::HttpHandler;
use lumen_store::{SqliteStore, Store, TaskFilter, TaskStatus};

/// Lumen - durable flow and task execution for learning content
#[derive(Parser)]
#[command(name = "lumen")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.lumen)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// SQLite database file (default: <data_dir>/lumen.db)
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Emit logs as JSON lines
  #[arg(long, global = true)]
  log_json: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Create or upgrade the database schema
  Migrate,

  /// Start a flow run; initial inputs are read from stdin as JSON
  Start {
    /// Flow definitions file
    #[arg(long)]
    flows: PathBuf,

    /// Name of the flow to run
    #[arg(long)]
    flow: String,

    /// Id of the domain entity this run produces content for
    #[arg(long)]
    owner: Option<String>,
  },

  /// Serve queues until interrupted
  Worker {
    /// Flow definitions file
    #[arg(long)]
    flows: PathBuf,

    /// Queue to serve; repeat for several, in preference order
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// Number of concurrent executors
    #[arg(long)]
    concurrency: Option<usize>,
  },

  /// Show a flow run and its step attempts
  Status {
    flow_run_id: String,
  },

  /// Cancel a flow run
  Cancel {
    flow_run_id: String,
  },

  /// Requeue or fail tasks whose lease has expired, once
  Reap {
    /// Flow definitions file
    #[arg(long)]
    flows: PathBuf,
  },

  /// List tasks
  Tasks {
    #[arg(long, value_parser = parse_task_status)]
    status: Option<TaskStatus>,

    #[arg(long)]
    queue: Option<String>,

    #[arg(long)]
    owner: Option<String>,

    #[arg(long)]
    flow_run: Option<String>,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.log_json);

  let data_dir = match cli.data_dir.clone() {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".lumen"),
  };

  let Some(command) = cli.command else {
    println!("lumen - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(command, data_dir, cli.database).await })
}

fn init_tracing(json: bool) {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
  let registry = tracing_subscriber::registry().with(env_filter);
  if json {
    registry
      .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
      .init();
  } else {
    registry
      .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
      .init();
  }
}

async fn run(command: Commands, data_dir: PathBuf, database: Option<PathBuf>) -> Result<()> {
  let config = EngineConfig::load_or_default(&data_dir.join("lumen.json"))?;
  let store = open_store(&data_dir, database).await?;

  match command {
    Commands::Migrate => {
      eprintln!("Database is up to date");
    }
    Commands::Start { flows, flow, owner } => {
      let inputs = read_payload_from_stdin()?;
      let engine = Engine::builder(store, load_registry(Some(&flows)).await?)
        .config(config)
        .build();
      let flow_run_id = engine
        .start(&flow, inputs, owner.as_deref())
        .await
        .with_context(|| format!("failed to start flow '{}'", flow))?;
      println!("{}", flow_run_id);
    }
    Commands::Worker {
      flows,
      queues,
      concurrency,
    } => {
      let mut config = config;
      if !queues.is_empty() {
        config.queues = queues;
      }
      if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
      }
      run_worker(store, load_registry(Some(&flows)).await?, config).await?;
    }
    Commands::Status { flow_run_id } => {
      let run = store
        .get_flow_run(&flow_run_id)
        .await
        .with_context(|| format!("failed to load flow run {}", flow_run_id))?;
      let steps = store.list_step_runs(&flow_run_id).await?;
      let output = serde_json::json!({ "run": run, "steps": steps });
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Commands::Cancel { flow_run_id } => {
      let engine = Engine::builder(store, load_registry(None).await?)
        .config(config)
        .build();
      let run = engine
        .cancel(&flow_run_id)
        .await
        .with_context(|| format!("failed to cancel flow run {}", flow_run_id))?;
      eprintln!("Flow run {} is {}", run.flow_run_id, run.status.as_str());
    }
    Commands::Reap { flows } => {
      let engine = Engine::builder(store, load_registry(Some(&flows)).await?)
        .config(config)
        .build();
      let report = engine
        .reaper()
        .reap_once(chrono::Utc::now())
        .await
        .context("reaper pass failed")?;
      eprintln!(
        "Requeued {} task(s), failed {} task(s), recovered {} flow run(s)",
        report.requeued, report.failed, report.recovered
      );
    }
    Commands::Tasks {
      status,
      queue,
      owner,
      flow_run,
    } => {
      let filter = TaskFilter {
        status,
        queue_name: queue,
        owner_id: owner,
        flow_run_id: flow_run,
        ..Default::default()
      };
      let tasks = store.list_tasks(&filter).await?;
      println!("{}", serde_json::to_string_pretty(&tasks)?);
    }
  }

  Ok(())
}

async fn run_worker(
  store: Arc<dyn Store>,
  registry: Arc<FlowRegistry>,
  config: EngineConfig,
) -> Result<()> {
  let engine = Engine::builder(store, registry)
    .config(config)
    .notifier(Arc::new(LogNotifier))
    .build();

  let shutdown = CancellationToken::new();
  let signal = shutdown.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("interrupt received, draining executors");
      signal.cancel();
    }
  });

  engine
    .run(shutdown)
    .await
    .context("worker stopped with an error")
}

async fn open_store(data_dir: &Path, database: Option<PathBuf>) -> Result<Arc<dyn Store>> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  let path = database.unwrap_or_else(|| data_dir.join("lumen.db"));
  let store = SqliteStore::connect(&path)
    .await
    .with_context(|| format!("failed to open database: {}", path.display()))?;
  store.migrate().await.context("failed to migrate database")?;
  Ok(Arc::new(store))
}

/// Handlers every flow file may refer to.
fn handlers() -> Result<HandlerRegistry> {
  let mut handlers = HandlerRegistry::new();
  handlers.register("http", HttpHandler::new())?;
  Ok(handlers)
}

async fn load_registry(flows_file: Option<&Path>) -> Result<Arc<FlowRegistry>> {
  let builder = FlowRegistry::builder(handlers()?);
  let Some(path) = flows_file else {
    return Ok(Arc::new(builder.build()?));
  };

  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read flows file: {}", path.display()))?;
  let file = FlowsFile::from_json(&content)
    .with_context(|| format!("failed to parse flows file: {}", path.display()))?;
  let registry = builder
    .flows(file.flows)
    .build()
    .with_context(|| format!("invalid flow definitions in {}", path.display()))?;

  info!(flows = ?registry.flow_names().collect::<Vec<_>>(), "flows loaded");
  Ok(Arc::new(registry))
}

fn parse_task_status(value: &str) -> Result<TaskStatus, String> {
  serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
    .map_err(|_| format!("unknown task status '{}'", value))
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
