use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use venv_server_cli::server;
use venv_server_lib::consts::{DEFAULT_LISTEN_ADDR, DEFAULT_TEMPLATE_ROOT};
use venv_server_lib::engine::docker::DockerEngine;
use venv_server_lib::pipeline::{Pipeline, PipelineConfig};

/// venv-server - Build Python virtual environments in containers and serve them as tar archives
#[derive(Parser)]
#[command(name = "venv-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Address to listen on
  #[arg(long, env = "VENV_SERVER_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
  listen: SocketAddr,

  /// Directory containing one subdirectory per template
  #[arg(long, env = "VENV_SERVER_TEMPLATES", default_value = DEFAULT_TEMPLATE_ROOT)]
  templates: PathBuf,

  /// Give up on image builds that take longer than this (e.g. "10m")
  #[arg(long, env = "VENV_SERVER_BUILD_TIMEOUT", value_parser = humantime::parse_duration)]
  build_timeout: Option<Duration>,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .init();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(serve(cli))
}

async fn serve(cli: Cli) -> Result<()> {
  if !cli.templates.is_dir() {
    anyhow::bail!("Template directory not found: {}", cli.templates.display());
  }

  let engine = DockerEngine::connect().context("Failed to create container engine client")?;
  engine.ping().await.context("Container engine is not reachable")?;

  let config = PipelineConfig {
    template_root: cli.templates,
    build_timeout: cli.build_timeout,
    ..Default::default()
  };
  let pipeline = Pipeline::new(Arc::new(engine), config);
  let config = pipeline.config();
  info!(
    templates = %config.template_root.display(),
    build_timeout = ?config.build_timeout.map(|d| humantime::format_duration(d).to_string()),
    "pipeline configured"
  );
  let app = server::router(pipeline);

  let listener = tokio::net::TcpListener::bind(cli.listen)
    .await
    .with_context(|| format!("Failed to bind {}", cli.listen))?;
  info!(addr = %cli.listen, "listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server failed")?;

  info!("shut down");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(err) = tokio::signal::ctrl_c().await {
      warn!(error = %err, "failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(err) => {
        warn!(error = %err, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    () = ctrl_c => {}
    () = terminate => {}
  }
  info!("shutdown signal received, draining connections");
}
