#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swarmlet::config::Config;
use swarmlet::protocol::Priority;
use swarmlet::service;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "swarmlet", version, about = "Per-user agent fleet orchestrator")]
struct Cli {
    /// Path to config.toml (default: ~/.swarmlet/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator control plane
    Serve,
    /// Run a worker instance (started by the orchestrator inside containers)
    Worker,
    /// Report user activity, creating or waking the user's agent
    Activity {
        user_id: String,
        /// Optionally send a message to the agent after it is ready
        #[arg(long)]
        message: Option<String>,
    },
    /// Terminate every live agent
    KillAll,
    /// Show fleet status counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => service::run_orchestrator(config).await,
        Commands::Worker => service::run_worker(config).await,
        Commands::Activity { user_id, message } => {
            let command_timeout =
                std::time::Duration::from_secs(config.lifecycle.command_timeout_secs);
            let (bus, lifecycle) = service::connect_control_plane(config).await?;

            let agent_id = lifecycle.handle_user_activity(&user_id).await?;
            println!("agent: {agent_id}");

            if let Some(message) = message {
                let gateway = swarmlet::Gateway::new(bus.clone());
                let response = gateway
                    .send_and_await(&agent_id, &user_id, &message, Priority::Medium, command_timeout)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            bus.cleanup().await?;
            Ok(())
        }
        Commands::KillAll => {
            let (bus, lifecycle) = service::connect_control_plane(config).await?;
            let report = lifecycle.kill_all_agents().await?;
            println!(
                "terminated: {}, failed: {}",
                report.terminated.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!("  {}: {}", failure.agent_id, failure.error);
            }
            bus.cleanup().await?;
            if report.success {
                Ok(())
            } else {
                anyhow::bail!("some agents could not be terminated")
            }
        }
        Commands::Status => {
            let (bus, lifecycle) = service::connect_control_plane(config).await?;
            let status = lifecycle.termination_status().await?;
            println!(
                "active: {}, frozen: {}, failed: {}",
                status.active_agents, status.frozen_agents, status.failed_agents
            );
            bus.cleanup().await?;
            Ok(())
        }
    }
}
