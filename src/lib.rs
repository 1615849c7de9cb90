//! Sales Desk - sales-order management backend.
//!
//! Customers, catalog, orders, payment tables and delivery routes over an
//! interchangeable [`store::Store`], plus the reconciliation of orders
//! captured offline on field devices (see [`mobile_import`]). The binary is
//! a thin CLI over [`run`].

use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod mobile_import;
pub mod models;
pub mod orders;
pub mod payment_tables;
pub mod products;
pub mod reports;
pub mod repository;
pub mod routes;
pub mod store;

use config::AppConfig;
use repository::Repositories;

const DEFAULT_LOG_FILTER: &str = "info,sales_desk_lib=debug";

/// Set up console and rolling-file logging.
///
/// `RUST_LOG` wins over the configured filter. Console output goes to stderr
/// so command output on stdout stays machine readable. Keep the returned
/// guard alive until exit; dropping it flushes the file writer.
pub fn init_logging(config: &AppConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let configured = config
            .logging
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER);
        EnvFilter::try_new(configured).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    });

    let (json_console, text_console) = if config.logging.json {
        (
            Some(fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(fmt::layer().with_target(true).with_writer(std::io::stderr)),
        )
    };

    // Rolling file appender: one file per day in the logs directory
    let mut file_layer = None;
    let mut file_guard = None;
    if config.logging.file {
        let log_dir = diagnostics::log_dir(config);
        diagnostics::prune_old_logs(&log_dir);
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender =
                tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            file_guard = Some(guard);
            file_layer = Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            );
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_console)
        .with(text_console)
        .with(file_layer)
        .try_init();
    file_guard
}

/// CLI entry point.
pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli::apply_overrides(&cli, &mut config)?;
    let _log_guard = init_logging(&config);

    info!(
        "Starting Sales Desk v{} ({} backend)",
        env!("CARGO_PKG_VERSION"),
        config.store.backend.as_str()
    );

    if !cli::needs_store(&cli.command) {
        return cli::execute_offline(&cli.command, &config);
    }

    let store = store::open_store(&config)?;
    let repos = Repositories::new(store);
    let result = cli::execute(cli.command, &config, &repos);
    if let Err(e) = &result {
        warn!("Command failed: {e:#}");
    }
    result
}
