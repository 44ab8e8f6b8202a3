//! space-status - makerspace open-status aggregation daemon
//!
//! Ingests raw space telemetry over MQTT, reconciles it into the canonical
//! public open state (including the synthetic `closing` value), and fans the
//! result out to SQLite persistence, a webhook announcer and an HTTP/SSE API.
//!
//! Module structure:
//! - `domain/` - Open values, places, shared live state
//! - `io/` - External interfaces (MQTT, SQLite, webhook, HTTP)
//! - `services/` - Event bus, debouncing, reconciliation, statistics
//! - `infra/` - Infrastructure (Config, embedded broker)

use clap::Parser;
use space_status::domain::AppState;
use space_status::infra::Config;
use space_status::io::{
    start_devices_sampler, start_open_state_recorder, start_web_server, Announcer, Store,
};
use space_status::services::{EventBus, SpaceStateReconciler};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// space-status - makerspace open-status aggregation daemon
#[derive(Parser, Debug)]
#[command(name = "space-status", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("space-status starting");

    let args = Args::parse();
    let config = Config::load(&args.config);

    // Start embedded MQTT broker if configured (dev setups)
    if config.broker.enabled {
        space_status::infra::broker::start_embedded_broker(&config);
    }

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt.host,
        mqtt_port = %config.mqtt.port,
        db_path = %config.db.path,
        web_port = %config.web.port,
        announcer_enabled = %config.announcer.enabled,
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let state = Arc::new(AppState::new());
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(Store::connect(&config.db.path).await?);

    // Downstream consumers register on the bus before any feed flows
    start_open_state_recorder(&bus, Arc::clone(&state), Arc::clone(&store)).await?;
    start_devices_sampler(
        Arc::clone(&store),
        Arc::clone(&state),
        config.db.save_devices_interval_secs,
        shutdown_rx.clone(),
    );
    Announcer::start(&config.announcer, &bus, Arc::clone(&state));

    let reconciler = Arc::new(SpaceStateReconciler::new(Arc::clone(&state), Arc::clone(&bus)));

    // Start MQTT client
    let mqtt_config = config.clone();
    let mqtt_state = Arc::clone(&state);
    let mqtt_bus = Arc::clone(&bus);
    let mqtt_reconciler = Arc::clone(&reconciler);
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = space_status::io::start_mqtt_client(
            &mqtt_config,
            mqtt_state,
            mqtt_bus,
            mqtt_reconciler,
            mqtt_shutdown,
        )
        .await
        {
            tracing::error!(error = %e, "MQTT client error");
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run web server - serves until shutdown
    if let Err(e) =
        start_web_server(&config.web, state, bus, store, shutdown_rx).await
    {
        tracing::error!(error = %e, "web server error");
    }

    info!("space-status shutdown complete");
    Ok(())
}
