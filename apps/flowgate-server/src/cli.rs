//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "flowgate-server",
    about = "Flowgate workflow orchestrator",
    version,
    long_about = "Runs workflow graphs across a pool of agents with human approval \
                  gates, execution monitoring and a live event stream."
)]
pub struct Args {
    /// Path to configuration file; defaults and FLOWGATE__* variables apply when it is missing
    #[arg(short, long, env = "FLOWGATE_CONFIG", default_value = "flowgate.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Environment (dev, staging, prod)
    #[arg(
        short,
        long,
        env = "ENVIRONMENT",
        default_value = "dev",
        value_parser = ["dev", "staging", "prod"]
    )]
    pub env: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Workflow definition (JSON) to validate or run
    #[arg(short, long)]
    pub workflow: Option<PathBuf>,

    /// Input variables for the workflow as a JSON object
    #[arg(short, long, requires = "workflow")]
    pub input: Option<String>,

    /// Only validate the workflow definition and print the report
    #[arg(long, requires = "workflow")]
    pub validate_only: bool,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(workflow) = &self.workflow {
            if !workflow.exists() {
                anyhow::bail!("workflow file {} does not exist", workflow.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_workflow_file_fails_validation() {
        let args = Args::parse_from(["flowgate-server", "--workflow", "/nonexistent/flow.json"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_only_requires_workflow() {
        assert!(Args::try_parse_from(["flowgate-server", "--validate-only"]).is_err());
    }

    #[test]
    fn test_existing_workflow_file_passes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        let args = Args::parse_from(["flowgate-server", "--workflow", &path, "--validate-only"]);
        assert!(args.validate().is_ok());
        assert!(args.validate_only);
    }
}
