mod cache;
mod clients;
mod config;
mod db;
mod error;
mod event;
mod lifecycle;
mod network;
mod notify;
mod route;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::event::{build_request, EventReader, Input};
use crate::lifecycle::ControlMessage;
use crate::network::RequestMode;
use crate::worker::{Event, Outcome, Worker};

#[derive(Parser, Debug)]
#[command(name = "basket-sw")]
#[command(about = "Offline-first request caching worker for the Local Basket web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/basket-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest into this version's store
  Install,
  /// Make this version the active one and delete every other store
  Activate,
  /// Send a request through the worker
  Fetch {
    /// Path on the origin, or an absolute URL
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Extra header, as `Name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay queued writes
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Refresh the updates feed
  PeriodicSync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push message (JSON)
  Push { payload: String },
  /// Post a control message (JSON), e.g. '{"type":"GET_VERSION"}'
  Message { payload: String },
  /// Print the active version
  Version,
  /// List queued writes
  Queue,
  /// Read newline-delimited JSON events from stdin and dispatch them
  Run,
}

/// Log to stderr and to a daily rolling file.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=basket_sw=debug).
fn init_tracing(config: &Config) -> Result<WorkerGuard> {
  let log_dir = config.log_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "basket-sw.log");
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config)?;

  info!(store = %config.store_name(), origin = %config.origin, "basket-sw starting");
  let worker = Arc::new(Worker::open(config)?);

  let event = match args.command {
    Command::Install => Event::Install,
    Command::Activate => Event::Activate,
    Command::Fetch {
      url,
      method,
      navigate,
      headers,
      body,
    } => {
      let mut request = build_request(worker.config(), &url, method.as_deref(), body)?;
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header {:?}, expected `Name: value`", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if navigate {
        request = request.with_mode(RequestMode::Navigate);
      }
      Event::Fetch(request)
    }
    Command::Sync { tag } => Event::Sync {
      tag: tag.unwrap_or_else(|| worker.config().sync.tag.clone()),
    },
    Command::PeriodicSync { tag } => Event::PeriodicSync {
      tag: tag.unwrap_or_else(|| worker.config().periodic.tag.clone()),
    },
    Command::Push { payload } => Event::Push(payload.into_bytes()),
    Command::Message { payload } => {
      let message: ControlMessage = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Invalid control message {}: {}", payload, e))?;
      Event::Message(message)
    }
    Command::Version => {
      println!("{}", worker.version());
      return Ok(());
    }
    Command::Queue => {
      println!("{} queued", worker.queued_writes()?);
      for item in worker.pending_writes()? {
        println!(
          "{}\t{} {}\tattempts={}\t{}",
          item.id,
          item.payload.method,
          item.payload.url,
          item.attempts,
          item.created_at.to_rfc3339()
        );
      }
      return Ok(());
    }
    Command::Run => return run(worker).await,
  };

  let outcome = worker.dispatch(event).await;
  println!("{}", outcome);
  worker.settle().await;

  match outcome {
    Outcome::Failed(reason) => Err(eyre!(reason)),
    _ => Ok(()),
  }
}

/// Dispatch every event read from stdin, each on its own task, writing one
/// JSON outcome per line as they finish.
async fn run(worker: Arc<Worker>) -> Result<()> {
  let mut events = EventReader::stdin();
  let mut tasks = JoinSet::new();

  while let Some(input) = events.next().await {
    let event = match input {
      Input::Event(wire) => wire.into_event(worker.config()),
      Input::Invalid { line, error } => {
        warn!(line = %line, error = %error, "Skipping invalid event");
        println!("{}", json!({ "outcome": "invalid", "line": line, "error": error }));
        continue;
      }
    };

    let event = match event {
      Ok(event) => event,
      Err(e) => {
        warn!(error = %e, "Skipping event");
        println!("{}", Outcome::Failed(e.to_string()).to_json());
        continue;
      }
    };

    let worker = Arc::clone(&worker);
    tasks.spawn(async move {
      let outcome = worker.dispatch(event).await;
      println!("{}", outcome.to_json());
    });
  }

  while let Some(result) = tasks.join_next().await {
    if let Err(e) = result {
      warn!(error = %e, "Event task failed");
    }
  }
  worker.settle().await;

  info!("Input closed, shutting down");
  Ok(())
}
