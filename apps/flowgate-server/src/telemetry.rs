//! Log output for the orchestrator binary.
//!
//! Logs always go to stderr so that stdout carries nothing but the envelope
//! stream of a `--workflow` run. Without `RUST_LOG` the chosen level applies
//! to the flowgate crates only; dependencies stay at `warn`.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;

const FLOWGATE_TARGETS: &[&str] = &[
    "flowgate_core",
    "flowgate_agents",
    "flowgate_workflow",
    "flowgate_server",
];

/// Kept alive by `main` until shutdown
pub struct TelemetryGuards;

pub fn init_telemetry(args: &Args) -> Result<TelemetryGuards> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(get_log_level(&args.log_level)))
            .context("Failed to build log filter")?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if use_json(args) {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    Ok(TelemetryGuards)
}

/// JSON when asked for, and always in production
fn use_json(args: &Args) -> bool {
    args.json_logs || args.env == "prod"
}

/// `warn` globally, `level` for the flowgate crates
fn default_directives(level: Level) -> String {
    let level = level.to_string().to_lowercase();
    std::iter::once("warn".to_string())
        .chain(
            FLOWGATE_TARGETS
                .iter()
                .map(|target| format!("{}={}", target, level)),
        )
        .collect::<Vec<_>>()
        .join(",")
}

pub fn get_log_level(level_str: &str) -> Level {
    level_str.parse().unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_get_log_level() {
        assert_eq!(get_log_level("trace"), Level::TRACE);
        assert_eq!(get_log_level("DEBUG"), Level::DEBUG);
        assert_eq!(get_log_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_default_directives_scope_level_to_flowgate() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,flowgate_core=debug,flowgate_agents=debug,flowgate_workflow=debug,flowgate_server=debug"
        );
        assert!(EnvFilter::try_new(default_directives(Level::TRACE)).is_ok());
    }

    #[test]
    fn test_production_logs_are_json() {
        let dev = Args::parse_from(["flowgate-server"]);
        assert!(!use_json(&dev));

        let prod = Args::parse_from(["flowgate-server", "--env", "prod"]);
        assert!(use_json(&prod));

        let json = Args::parse_from(["flowgate-server", "--json-logs"]);
        assert!(use_json(&json));
    }
}
