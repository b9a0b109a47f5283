//! Intake Resilience host
//!
//! Loads the resilience configuration, builds the core and runs its
//! maintenance tasks until interrupted. `--check` validates a configuration
//! and prints the effective result instead.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use intake_resilience::{ResilienceConfig, ResilienceCore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML, or TOML with a .toml extension)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level, overriding the configured one
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ResilienceConfig::load(args.config.as_deref())?;

    if args.check {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level)?;

    info!("Starting Intake Resilience v{}", env!("CARGO_PKG_VERSION"));

    let core = ResilienceCore::builder(config).build()?;
    info!(
        max_retries = core.config().retry.max_retries,
        failure_threshold = core.config().circuit_breaker.failure_threshold,
        rate_limit = core.config().rate_limit.max_requests,
        alert_rules = core.alerts().rules().len(),
        "Configuration loaded successfully"
    );

    let maintenance = core.start_maintenance();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    maintenance.shutdown().await;
    info!("Intake Resilience stopped");

    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("Invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::parse_from(["test"]);

        assert!(args.config.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.check);
    }

    #[test]
    fn test_args_custom_values() {
        let args = Args::parse_from([
            "test",
            "-l", "debug",
            "--check",
            "-c", "/path/to/resilience.yaml",
        ]);

        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.check);
        assert_eq!(
            args.config.unwrap().to_string_lossy(),
            "/path/to/resilience.yaml"
        );
    }
}
