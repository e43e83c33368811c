//! Hostbay Supervisor - Main Entry Point
//! Composition root: config, persistence, sandbox, supervisor, transport

mod telemetry;
mod transport;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use hostbay_core::application::supervisor::shutdown_channel;
use hostbay_core::application::{OutputRouter, Supervisor};
use hostbay_core::config::SupervisorConfig;
use hostbay_core::port::id_provider::UuidProvider;
use hostbay_core::port::sandbox::ResourceLimits;
use hostbay_core::port::time_provider::SystemTimeProvider;
use hostbay_infra_sandbox::{ProcessSandbox, ProcessSandboxConfig};
use hostbay_infra_sqlite::{create_pool, run_migrations, SqlitePersistenceGateway};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_DB_PATH: &str = "~/.hostbay/hostbay.db";
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> SupervisorConfig {
    let defaults = SupervisorConfig::default();
    let default_limits = ResourceLimits::default();

    let admin_tenants = std::env::var("HOSTBAY_ADMINS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    SupervisorConfig {
        tenant_quota: env_parse("HOSTBAY_TENANT_QUOTA", defaults.tenant_quota),
        submit_window: Duration::from_secs(env_parse(
            "HOSTBAY_SUBMIT_WINDOW_SECS",
            defaults.submit_window.as_secs(),
        )),
        submit_max: env_parse("HOSTBAY_SUBMIT_MAX", defaults.submit_max),
        limits: ResourceLimits {
            max_memory_bytes: env_parse(
                "HOSTBAY_MAX_MEMORY_MB",
                default_limits.max_memory_bytes / (1024 * 1024),
            ) * 1024
                * 1024,
            max_cpu_secs: env_parse("HOSTBAY_MAX_CPU_SECS", default_limits.max_cpu_secs),
            wall_clock: std::env::var("HOSTBAY_WALL_CLOCK_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs),
        },
        restart_base_delay_ms: env_parse("HOSTBAY_RESTART_BASE_MS", defaults.restart_base_delay_ms),
        restart_max_delay_ms: env_parse("HOSTBAY_RESTART_CAP_MS", defaults.restart_max_delay_ms),
        clean_run_threshold_ms: env_parse(
            "HOSTBAY_CLEAN_RUN_SECS",
            defaults.clean_run_threshold_ms / 1_000,
        ) * 1_000,
        global_slot_ceiling: env_parse("HOSTBAY_GLOBAL_SLOTS", defaults.global_slot_ceiling),
        grace_period: Duration::from_secs(env_parse(
            "HOSTBAY_GRACE_PERIOD_SECS",
            defaults.grace_period.as_secs(),
        )),
        admin_tenants,
        outbox_capacity: env_parse("HOSTBAY_OUTBOX_CAPACITY", defaults.outbox_capacity),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging (stderr) and optional OTLP export
    telemetry::init_logging()?;
    if let Err(e) = telemetry::init_telemetry() {
        tracing::warn!(error = ?e, "Failed to initialize OpenTelemetry (continuing without it)");
    }

    info!("Hostbay supervisor v{} starting...", VERSION);

    // 2. Configuration
    let config = load_config();
    let db_path = std::env::var("HOSTBAY_DB_PATH")
        .unwrap_or_else(|_| shellexpand::tilde(DEFAULT_DB_PATH).into_owned());
    let run_root = PathBuf::from(
        std::env::var("HOSTBAY_RUN_ROOT").unwrap_or_else(|_| "/tmp/hostbay".to_string()),
    );

    info!(db_path = %db_path, run_root = %run_root.display(), "Initializing storage...");

    // 3. Database
    let pool = create_pool(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    // 4. Dependencies (DI wiring)
    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);
    let gateway = Arc::new(SqlitePersistenceGateway::new(pool));

    let sandbox = Arc::new(ProcessSandbox::new(ProcessSandboxConfig {
        root: run_root,
        interpreter: std::env::var("HOSTBAY_INTERPRETER")
            .unwrap_or_else(|_| "python3".to_string()),
        ..ProcessSandboxConfig::default()
    }));

    let router = Arc::new(OutputRouter::new(
        config.outbox_capacity,
        time_provider.clone(),
    ));

    // 5. Supervisor (cold-start recovery happens inside run())
    let (supervisor, command_tx) = Supervisor::new(
        config,
        sandbox,
        gateway,
        Arc::clone(&router),
        time_provider,
        id_provider,
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    info!("Starting supervisor loop...");
    let supervisor_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.run(shutdown_rx).await {
                tracing::error!(error = ?e, "Supervisor failed");
            }
        })
    };

    // 6. Transport shim (stdin commands, stdout events)
    info!("Starting stdio transport...");
    let transport_handle = tokio::spawn(transport::run(command_tx, router, shutdown_rx));

    info!("System ready. Waiting for commands...");
    info!("Press Ctrl+C to shutdown");

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 8. Graceful shutdown: the supervisor terminates live slots itself
    shutdown_tx.shutdown();
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, supervisor_handle).await;
    transport_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
