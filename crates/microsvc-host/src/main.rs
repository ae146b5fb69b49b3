//! microsvc
//!
//! Command-line host for script micro-services: run a service and stream its
//! events as JSON lines, or manage the cache of installed remote services.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use microsvc::{EventPayload, ServiceError, ServiceHost};
use microsvc_js_runtime::JsEngine;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Overrides;

/// Exit code reported when `--timeout-ms` elapses, as with timeout(1)
const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when interrupted with Ctrl-C
const INTERRUPT_EXIT_CODE: i32 = 130;

/// Script micro-service host
#[derive(Parser, Debug)]
#[command(name = "microsvc")]
#[command(about = "Run and manage script micro-services", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "microsvc.toml")]
    config: PathBuf,

    /// Directory holding installed remote services
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Root directory for bundle: URIs
    #[arg(long, global = true)]
    bundle_root: Option<PathBuf>,

    /// Network fetch timeout in milliseconds
    #[arg(long, global = true)]
    fetch_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a service until it exits
    Run {
        /// bundle:, file:, http: or https: URI of the script
        uri: String,

        /// Event to send once running, as name=json (repeatable)
        #[arg(long = "emit", value_name = "NAME=JSON", value_parser = parse_emit)]
        emit: Vec<(String, EventPayload)>,

        /// Script event to print on stdout (repeatable)
        #[arg(long = "listen", value_name = "NAME")]
        listen: Vec<String>,

        /// Stop the service after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// How long on-start may hold back events, in milliseconds
        #[arg(long)]
        start_timeout_ms: Option<u64>,
    },

    /// Fetch a remote service into the cache
    Install {
        uri: String,

        /// Re-fetch even when already installed
        #[arg(long)]
        force: bool,
    },

    /// Remove a remote service from the cache
    Uninstall { uri: String },

    /// List installed remote services
    List,
}

/// One line of `run` output.
#[derive(Serialize)]
struct EventLine<'a> {
    event: &'a str,
    payload: &'a EventPayload,
}

enum Ended {
    Exit(i32),
    Error(ServiceError),
}

fn parse_emit(arg: &str) -> Result<(String, EventPayload), String> {
    let (name, json) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got '{}'", arg))?;
    if name.is_empty() {
        return Err("event name must not be empty".to_string());
    }
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON for '{}': {}", name, e))?;
    Ok((name.to_string(), value.into()))
}

fn main() -> Result<()> {
    // V8 must be initialized on the main thread before the tokio runtime starts
    microsvc_js_runtime::init_platform();

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())?;
    std::process::exit(code);
}

async fn async_main() -> Result<i32> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("microsvc=info"));
    // stdout carries event lines, so logs go to stderr
    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let start_timeout_ms = match &args.command {
        Command::Run { start_timeout_ms, .. } => *start_timeout_ms,
        _ => None,
    };
    let config = config::load(
        &args.config,
        &Overrides {
            cache_dir: args.cache_dir.clone(),
            bundle_root: args.bundle_root.clone(),
            fetch_timeout_ms: args.fetch_timeout_ms,
            start_timeout_ms,
        },
    )?;
    tracing::debug!(?config, "Loaded configuration");

    let host = ServiceHost::new(config, Arc::new(JsEngine::new()))?;

    match args.command {
        Command::Run {
            uri,
            emit,
            listen,
            timeout_ms,
            ..
        } => run(&host, &uri, emit, listen, timeout_ms.map(Duration::from_millis)).await,
        Command::Install { uri, force } => {
            let entry = host.install(&uri, force).await?;
            info!(uri = %entry.uri, sha256 = %entry.sha256, size = entry.size, "Installed");
            Ok(0)
        }
        Command::Uninstall { uri } => {
            if !host.uninstall(&uri).await? {
                warn!(%uri, "Not installed");
            }
            Ok(0)
        }
        Command::List => {
            for entry in host.installed().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(0)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

async fn run(
    host: &ServiceHost,
    uri: &str,
    emits: Vec<(String, EventPayload)>,
    listen: Vec<String>,
    timeout: Option<Duration>,
) -> Result<i32> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();

    let svc = host
        .service(uri)
        .on_start(move |svc, sync| {
            for name in &listen {
                svc.add_event_listener(name, |_, event, payload| {
                    match serde_json::to_string(&EventLine { event, payload }) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(%event, "Failed to encode event: {}", e),
                    }
                });
            }
            sync.release();
            // Queued until the script is running
            for (name, payload) in &emits {
                if let Err(e) = svc.emit(name, payload.clone()) {
                    warn!(event = %name, "Emit failed: {}", e);
                }
            }
        })
        .on_error(move |_, e| {
            let _ = error_tx.send(Ended::Error(e.clone()));
        })
        .on_exit(move |_, code| {
            let _ = tx.send(Ended::Exit(code));
        })
        .build();

    svc.start()?;
    info!(%uri, instance = %svc.id(), "Starting service");

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut stopping = false;

    let ended = loop {
        tokio::select! {
            ended = rx.recv() => break ended,
            _ = &mut deadline, if !stopping => {
                warn!(%uri, "Timed out, stopping service");
                stopping = true;
                svc.process().exit(TIMEOUT_EXIT_CODE);
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!(%uri, "Interrupted, stopping service");
                stopping = true;
                svc.process().exit(INTERRUPT_EXIT_CODE);
            }
        }
    };

    match ended {
        Some(Ended::Exit(code)) => {
            info!(%uri, code, "Service exited");
            Ok(code)
        }
        Some(Ended::Error(e)) => {
            error!(%uri, "Service failed: {}", e);
            Ok(svc.exit_code().unwrap_or(1))
        }
        None => bail!("service {} ended without reporting an outcome", uri),
    }
}
