use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use buildspace_engine::{AcquirerConfig, HttpPlanSource, WorkspaceAcquirer};
use buildspace_server::{Gateway, ServerConfig};
use buildspace_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "buildspace", version, about = "MCP gateways for learning plans and repository analysis")]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "BUILDSPACE_HOST", default_value = "0.0.0.0", global = true)]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8080, global = true)]
    port: u16,

    /// Close sessions idle this many seconds with no open stream.
    #[arg(long, env = "BUILDSPACE_SESSION_IDLE_SECS", default_value_t = 1800, global = true)]
    session_idle_secs: u64,

    /// Log output: json or pretty.
    #[arg(long, env = "BUILDSPACE_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    gateway: GatewayCommand,
}

#[derive(Subcommand, Debug)]
enum GatewayCommand {
    /// Serve learning-plan tools at /mcp/{plan_id}.
    Learning {
        /// Base URL of the backend serving plan context.
        #[arg(long, env = "BACKEND_URL")]
        backend_url: String,
    },
    /// Serve repository tools at /mcp.
    Repo {
        /// Parent directory for cloned workspaces (defaults to the system temp dir).
        #[arg(long, env = "BUILDSPACE_WORKSPACE_ROOT")]
        workspace_root: Option<PathBuf>,

        #[arg(long, env = "BUILDSPACE_CLONE_TIMEOUT_SECS", default_value_t = 120)]
        clone_timeout_secs: u64,

        #[arg(long, env = "BUILDSPACE_MAX_TREE_ENTRIES", default_value_t = 5000)]
        max_tree_entries: usize,
    },
}

impl GatewayCommand {
    fn into_gateway(self) -> Gateway {
        match self {
            Self::Learning { backend_url } => {
                tracing::info!(backend = %backend_url, "Using plan backend");
                Gateway::learning(Arc::new(HttpPlanSource::new(backend_url)))
            }
            Self::Repo {
                workspace_root,
                clone_timeout_secs,
                max_tree_entries,
            } => {
                let defaults = AcquirerConfig::default();
                let config = AcquirerConfig {
                    root: workspace_root.unwrap_or(defaults.root),
                    clone_timeout: Duration::from_secs(clone_timeout_secs),
                    max_tree_entries,
                };
                tracing::info!(root = %config.root.display(), "Using workspace root");
                Gateway::repository(Arc::new(WorkspaceAcquirer::new(config)))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        session_idle_timeout: Duration::from_secs(cli.session_idle_secs),
        ..Default::default()
    };
    let gateway = cli.gateway.into_gateway();

    let handle = buildspace_server::start(config, gateway)
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.local_addr, "Buildspace gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repo_flags() {
        let cli = Cli::try_parse_from([
            "buildspace",
            "--port",
            "9000",
            "--log-format",
            "pretty",
            "repo",
            "--clone-timeout-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.log_format, LogFormat::Pretty);
        match cli.gateway {
            GatewayCommand::Repo {
                clone_timeout_secs, ..
            } => assert_eq!(clone_timeout_secs, 30),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn learning_requires_backend() {
        let cli = Cli::try_parse_from([
            "buildspace",
            "learning",
            "--backend-url",
            "http://backend:3000",
        ])
        .unwrap();
        assert!(matches!(cli.gateway, GatewayCommand::Learning { ref backend_url } if backend_url == "http://backend:3000"));
    }
}
