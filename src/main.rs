mod agent;
mod cache;
mod config;
mod event;
mod fetch;
mod notify;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use event::{AgentEvent, EventBus, ACTION_RUN_CHECK};

#[derive(Parser, Debug)]
#[command(name = "filterd")]
#[command(about = "Background agent for the filter-tracker app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/filterd/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the cache and log directory
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Post a run-check message every N seconds (host-side timer)
  #[arg(long)]
  check_interval_secs: Option<u64>,

  /// Install, run one reminder check, then exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, with command-line overrides
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(dir) = args.data_dir {
    config.cache.data_dir = Some(dir);
  }
  if let Some(secs) = args.check_interval_secs {
    config.check_interval_secs = Some(secs);
  }

  let data_dir = config.data_dir()?;
  let _log_guard = init_tracing(&data_dir.join("logs"))?;

  let store = cache::CacheStore::open_at(&data_dir.join("cache.db"), &config.cache.version)?;
  let transport = fetch::HttpTransport::new()?;

  let mut agent = agent::Agent::new(
    &config,
    store,
    transport,
    notify::LogSurface,
    notify::LogSurface,
  )?;

  let bus = EventBus::new();
  if let Some(secs) = config.check_interval_secs {
    bus.spawn_check_timer(Duration::from_secs(secs));
  }

  // Readiness probe: once active, the agent must serve the app shell from
  // cache even with the network down
  {
    let request = fetch::FetchRequest::navigation(config.request_key(&config.app.offline_document)?);
    let (respond, probe) = tokio::sync::oneshot::channel();
    bus
      .sender()
      .send(AgentEvent::Fetch { request, respond })
      .map_err(|e| eyre!("Failed to queue readiness probe: {}", e))?;

    tokio::spawn(async move {
      match probe.await {
        Ok(Ok(response)) => tracing::info!(status = response.status, "Readiness probe served"),
        Ok(Err(e)) => tracing::warn!("Readiness probe failed: {e}"),
        Err(_) => {}
      }
    });
  }
  if args.once {
    let tx = bus.sender();
    tx.send(AgentEvent::Message(
      serde_json::json!({ "action": ACTION_RUN_CHECK }),
    ))
    .map_err(|e| eyre!("Failed to queue run-check: {}", e))?;
    tx.send(AgentEvent::Shutdown)
      .map_err(|e| eyre!("Failed to queue shutdown: {}", e))?;
  }

  agent.run(bus).await
}

/// Log to a rolling file in the data directory; level via FILTERD_LOG.
fn init_tracing(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "filterd.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = tracing_subscriber::EnvFilter::try_from_env("FILTERD_LOG")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
