pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use modules::system::logger;
use tracing::{error, info, warn};

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_MIGRATION_ERROR: i32 = 2;
const EXIT_INVALID_ARGUMENT: i32 = 64;

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.proxy.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }
}

fn validate_args(args: &[String]) -> Result<(), String> {
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--headless" => {}
            other => return Err(format!("unrecognized argument: {}", other)),
        }
    }
    Ok(())
}

pub fn run() {
    logger::init_logger();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = validate_args(&args) {
        error!("[E-ARG-INVALID] {}", e);
        eprintln!("Usage: hivegate [--headless]");
        std::process::exit(EXIT_INVALID_ARGUMENT);
    }

    let mut config = match modules::system::config::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            error!("[E-CONFIG-LOAD] failed_to_load_config: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    apply_env_overrides(&mut config);
    if let Err(errors) = models::config::validate_app_config(&config) {
        error!(
            "[E-CONFIG-INVALID] configuration_validation_failed:\n{}",
            errors.join("\n")
        );
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    let data_dir = match modules::system::config::get_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("[E-DATA-DIR] failed_to_resolve_data_directory: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    let store = match modules::persistence::store::AccountStore::open(&data_dir.join("hivegate.db"))
    {
        Ok(store) => Arc::new(store),
        Err(error::AppError::Migration(e)) => {
            error!("[E-DB-MIGRATION] database_migration_failed: {}", e);
            std::process::exit(EXIT_MIGRATION_ERROR);
        }
        Err(e) => {
            error!("[E-DB-OPEN] failed_to_open_database: {}", e);
            std::process::exit(EXIT_MIGRATION_ERROR);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let (state, server_handle) = match proxy::server::start(&config, store).await {
            Ok(started) => started,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] failed_to_start_proxy_service: {}", e);
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        };

        info!("Service is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");

        server_handle.abort();
        state
            .writer
            .shutdown(Duration::from_secs(config.proxy.shutdown_grace_secs))
            .await;
    });
}
