#![warn(missing_docs)]
//! # scenecap-app binary
//!
//! Minimal CLI entry point: initializes logging, prints the crate version,
//! and validates a config file passed as the first argument. Driving the
//! orchestrator with a live frame source is the host's job — this binary
//! exists for local config validation and smoke-testing, not production
//! deployment.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

/// CLI entry point.
fn main() {
    init_logging();

    println!("scenecap-app {}", scenecap_app::app_version());

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        println!("usage: scenecap-app <config.json>");
        return;
    };

    if let Err(error) = validate_config_file(&config_path.into()) {
        eprintln!("config validation failed: {error}");
        std::process::exit(1);
    }

    println!("config is valid");
}

fn validate_config_file(path: &PathBuf) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|error| format!("reading {}: {error}", path.display()))?;
    scenecap_app::Config::from_json_str(&raw).map_err(|error| error.to_string())?;
    Ok(())
}

/// Installs a global `tracing` subscriber filtered by the `SCENECAP_LOG`
/// environment variable (mirroring the `LOCAL_GUARD_CAPTURE_ENABLED`
/// env-var idiom this workspace already uses for runtime configuration),
/// defaulting to the `info` level when unset.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SCENECAP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
