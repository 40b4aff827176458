mod app;
mod cli;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use flowgate_core::OrchestratorConfig;
use tracing::{error, info};

use crate::app::App;
use crate::cli::Args;
use crate::telemetry::{get_log_level, init_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    let _guards = init_telemetry(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %args.env,
        log_level = %get_log_level(&args.log_level),
        config = %args.config.display(),
        "Starting Flowgate orchestrator"
    );

    let result = run_application(args).await;
    if let Err(ref e) = result {
        error!(error = %format!("{:#}", e), "Orchestrator exited with an error");
    }

    info!("Orchestrator shutdown complete");
    result
}

async fn run_application(args: Args) -> Result<()> {
    let app = App::build(args).await?;
    log_settings(app.config());
    app.run().await
}

/// Settings that decide when work is queued, escalated or flagged
fn log_settings(config: &OrchestratorConfig) {
    info!(
        queue_wait_secs = config.coordinator.queue_wait_secs,
        heartbeat_timeout_secs = config.registry.heartbeat_timeout_secs,
        max_node_visits = config.engine.max_node_visits,
        "Coordination settings"
    );
    info!(
        poll_interval_secs = config.monitor.poll_interval_secs,
        stall_threshold_secs = config.monitor.stall_threshold_secs,
        stall_alert_cooldown_secs = config.monitor.stall_alert_cooldown_secs,
        long_running_threshold_secs = config.monitor.long_running_threshold_secs,
        "Monitor settings"
    );
    info!(
        subscriber_capacity = config.events.subscriber_capacity,
        history_limit = config.events.history_limit,
        "Event bus settings"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert()
    }
}
