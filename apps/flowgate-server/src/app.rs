//! Application state and initialization

use anyhow::{bail, Context, Result};
use flowgate_agents::{AgentBuilder, EchoHandler, LocalWorkerPool};
use flowgate_core::{AgentSeedConfig, Envelope, OrchestratorConfig, Scope};
use flowgate_workflow::{ExecutionStatus, Orchestrator, WorkflowDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::Args;

/// Upper bound on how long a single `--workflow` run is awaited
const MAX_RUN_WAIT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Main application
pub struct App {
    args: Args,
    orchestrator: Arc<Orchestrator>,
    agent_ids: Vec<String>,
}

impl App {
    /// Build the application with all dependencies
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("Invalid command line arguments")?;

        let config = load_config(&args.config)?;
        let seeds = if config.agents.is_empty() {
            default_agents()
        } else {
            config.agents.clone()
        };

        let pool = Arc::new(LocalWorkerPool::new());
        for seed in &seeds {
            let handler =
                EchoHandler::new(&seed.id).with_latency(Duration::from_millis(seed.latency_ms));
            pool.add_handler(&seed.id, Arc::new(handler));
        }

        let orchestrator =
            Orchestrator::new(config, pool).context("Failed to build orchestrator")?;

        for seed in &seeds {
            let mut builder = AgentBuilder::new(&seed.id).capabilities(seed.capabilities.iter().cloned());
            if let Some(max) = seed.max_concurrent_tasks {
                builder = builder.max_concurrent_tasks(max);
            }
            orchestrator
                .register_agent(builder.build())
                .with_context(|| format!("Failed to register agent {}", seed.id))?;
        }
        info!(agents = seeds.len(), "In-process agents registered");

        Ok(Self {
            args,
            orchestrator: Arc::new(orchestrator),
            agent_ids: seeds.into_iter().map(|seed| seed.id).collect(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.orchestrator.config()
    }

    /// Run the application
    pub async fn run(self) -> Result<()> {
        let Some(path) = self.args.workflow.clone() else {
            return self.serve().await;
        };

        let definition = load_definition(&path)?;
        if self.args.validate_only {
            let report = self.orchestrator.validate(&definition);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                bail!("workflow {} is invalid", definition.id);
            }
            return Ok(());
        }

        let input = parse_input(self.args.input.as_deref())?;
        self.orchestrator.start();
        let heartbeats = self.spawn_heartbeats();

        let result = self.run_workflow(definition, input).await;

        heartbeats.abort();
        self.orchestrator.shutdown().await;
        result
    }

    /// Run one definition to completion, streaming its envelopes
    async fn run_workflow(
        &self,
        definition: WorkflowDefinition,
        input: HashMap<String, Value>,
    ) -> Result<()> {
        let mut events = self.orchestrator.subscribe(Scope::All);
        let execution_id = self
            .orchestrator
            .submit(definition, input)
            .await
            .context("Failed to submit workflow")?;
        info!(execution_id = %execution_id, "Workflow submitted");

        let waiter = self.orchestrator.wait_for_terminal(&execution_id, MAX_RUN_WAIT);
        tokio::pin!(waiter);

        let report = loop {
            tokio::select! {
                report = &mut waiter => break report?,
                Some(envelope) = events.recv() => {
                    if envelope.execution_id.as_deref() == Some(execution_id.as_str()) {
                        print_envelope(&envelope)?;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!(execution_id = %execution_id, "Interrupted, cancelling execution");
                    if let Err(e) = self.orchestrator.cancel(&execution_id).await {
                        warn!(error = %e, "Cancel failed");
                    }
                }
            }
        };

        for envelope in events.drain() {
            if envelope.execution_id.as_deref() == Some(execution_id.as_str()) {
                print_envelope(&envelope)?;
            }
        }
        println!("{}", serde_json::to_string_pretty(&report)?);

        if report.status != ExecutionStatus::Completed {
            bail!(
                "execution {} finished as {}: {}",
                execution_id,
                report.status,
                report.error.as_deref().unwrap_or("no error recorded")
            );
        }
        Ok(())
    }

    /// Stream every envelope until Ctrl-C
    async fn serve(self) -> Result<()> {
        self.orchestrator.start();
        let heartbeats = self.spawn_heartbeats();
        let mut events = self.orchestrator.subscribe(Scope::All);
        info!("Streaming events, press Ctrl-C to stop");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                envelope = events.recv() => match envelope {
                    Some(envelope) => print_envelope(&envelope)?,
                    None => break,
                },
            }
        }

        heartbeats.abort();
        self.orchestrator.shutdown().await;
        Ok(())
    }

    /// In-process agents report liveness like remote ones would
    fn spawn_heartbeats(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let agent_ids = self.agent_ids.clone();
        let timeout_secs = orchestrator.config().registry.heartbeat_timeout_secs;
        let interval = Duration::from_secs((timeout_secs / 3).max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for agent_id in &agent_ids {
                    if let Err(e) = orchestrator.heartbeat(agent_id) {
                        warn!(agent_id = %agent_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    }
}

fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let config = if path.exists() {
        let path_str = path
            .to_str()
            .with_context(|| format!("Config path {} is not valid UTF-8", path.display()))?;
        info!(path = %path.display(), "Loading configuration file");
        OrchestratorConfig::load_from_file(path_str)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        info!(path = %path.display(), "No configuration file, using defaults and environment");
        OrchestratorConfig::load().context("Failed to load configuration from environment")?
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    WorkflowDefinition::from_json(&raw)
        .with_context(|| format!("Failed to parse workflow {}", path.display()))
}

fn parse_input(input: Option<&str>) -> Result<HashMap<String, Value>> {
    match input {
        None => Ok(HashMap::new()),
        Some(raw) => serde_json::from_str(raw).context("--input must be a JSON object"),
    }
}

fn print_envelope(envelope: &Envelope) -> Result<()> {
    println!("{}", serde_json::to_string(envelope)?);
    Ok(())
}

/// Echo agents covering the actions of the demo workflows
fn default_agents() -> Vec<AgentSeedConfig> {
    [
        ("echo-triage", vec!["scan", "analyze", "classify"]),
        ("echo-response", vec!["isolate", "notify", "remediate"]),
        ("echo-general", vec!["scan", "notify", "report"]),
    ]
    .into_iter()
    .map(|(id, capabilities)| AgentSeedConfig {
        id: id.to_string(),
        capabilities: capabilities.into_iter().map(str::to_string).collect(),
        max_concurrent_tasks: Some(2),
        latency_ms: 100,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_input() {
        assert!(parse_input(None).unwrap().is_empty());

        let input = parse_input(Some(r#"{"host": "web-1", "count": 3}"#)).unwrap();
        assert_eq!(input["host"], "web-1");

        assert!(parse_input(Some("[1, 2]")).is_err());
    }

    #[test]
    fn test_load_definition() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id": "wf", "name": "Demo", "nodes": [{{"id": "start", "type": "start"}}], "edges": []}}"#
        )
        .unwrap();

        let definition = load_definition(file.path()).unwrap();
        assert_eq!(definition.id, "wf");
        assert!(definition.validate().valid);
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/flowgate.toml")).unwrap();
        assert_eq!(config.engine.max_node_visits, 100);
    }

    #[test]
    fn test_default_agents_are_distinct() {
        let agents = default_agents();
        let mut ids: Vec<_> = agents.iter().map(|a| a.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), agents.len());
    }
}
