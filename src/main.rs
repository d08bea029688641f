//! Engine service host (v1)
//!
//! Runs a proxy engine process and fans its runtime events out to observers.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────────┐
//!                 │                        ENGINE SERVICE                        │
//!                 │                                                              │
//!   engine        │  ┌───────────┐   status    ┌───────────┐  PROCESS / zeros    │
//!   process ──────┼─▶│  engine   │────watch───▶│  service  │─────────────┐       │
//!   (REST ctl)    │  │ controller│             │ transition│             ▼       │
//!                 │  └─────▲─────┘             └─────┬─────┘      ┌────────────┐ │
//!                 │        │                         │ reload     │ dispatcher │─┼──▶ observers
//!                 │        │ load / select           ▼            └─────▲──────┘ │   (built-in,
//!                 │        └──────────────── ┌────────────┐            │        │    WebSocket)
//!                 │                          │   reload   │────────────┤        │
//!                 │        poll_*            │   worker   │            │        │
//!                 │   ┌──────────────────────└────────────┘            │        │
//!                 │   │   ┌───────────────┐   mask watch  ┌──────────┐ │        │
//!                 │   └──▶│ poll loops    │◀──────────────│ registry │ │        │
//!                 │       │ traffic/bw/log│───────────────┼──────────┼─┘        │
//!                 │       └───────────────┘               └──────────┘          │
//!                 │                                                              │
//!                 │  config + watcher · admin API · logging · metrics · signals  │
//!                 └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use engine_service::admin::{self, AdminState};
use engine_service::config::watcher::ConfigWatcher;
use engine_service::config::{load_config, ServiceConfig};
use engine_service::engine::{ConfigProfileStore, ControllerEngine, LogNotification};
use engine_service::lifecycle::signals;
use engine_service::observability::{logging, metrics};
use engine_service::EngineService;

#[derive(Parser)]
#[command(name = "engine-service")]
#[command(about = "Runs the proxy engine and serves its events", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "engine-service starting");
    tracing::info!(
        service_id = %config.service.id,
        engine = %config.engine.command,
        controller = %config.engine.controller_url,
        profiles = config.profiles.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(ConfigProfileStore::from_config(&config));
    let engine = Arc::new(ControllerEngine::new(config.engine.clone())?);
    let notification = Arc::new(LogNotification::new());
    let service = EngineService::new(&config, engine, store.clone(), notification);

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState {
            service: service.clone(),
            api_key: config.admin.api_key.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    // Keep the watcher alive for the lifetime of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, &config);
            let handle = watcher.run()?;

            let service = service.clone();
            let mut shutdown = service.subscribe_shutdown();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = updates.recv() => {
                            let Some(update) = update else { break };
                            store.replace(&update);
                            service.on_profile_changed();
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    #[cfg(unix)]
    {
        let reloads = service.clone();
        tokio::spawn(signals::forward_hangups(service.subscribe_shutdown(), move || {
            reloads.request_reload();
        }));
    }

    if let Err(e) = service.start_engine().await {
        tracing::error!(error = %e, "Failed to start engine");
        service.destroy().await;
        return Err(e.into());
    }

    tokio::select! {
        _ = signals::termination_signal() => {
            tracing::info!("Termination requested");
        }
        _ = service.terminated() => {
            tracing::info!("Engine stopped, service terminating");
        }
    }

    service.destroy().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
