//! Capsule Control - CLI client for the capsule daemon.

mod rpc_client;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use capsule_common::ipc::{Method, ResponseData};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use rpc_client::RpcClient;

#[derive(Parser)]
#[command(name = "capsulectl")]
#[command(about = "Manage capsule package images", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon socket path (defaults to $CAPSULED_SOCKET or the system socket)
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,

    /// List staged sessions
    Sessions,

    /// List active capsules
    Active,

    /// Submit a staged session from its staging directory
    Submit {
        /// Session id
        #[arg(long)]
        session_id: u64,

        /// Child session ids for a multi-package install
        #[arg(long = "child")]
        children: Vec<u64>,

        /// Mark this submission as a rollback of an earlier session
        #[arg(long)]
        rollback_of: Option<u64>,
    },

    /// Mark a staged session ready for the next boot
    MarkReady {
        session_id: u64,
    },

    /// Accept an activated session
    MarkSuccessful {
        session_id: u64,
    },

    /// Abort a session, reverting any partial activation
    Abort {
        session_id: u64,
    },

    /// Verify and activate a single image immediately
    Activate {
        /// Path to the capsule image file
        path: PathBuf,
    },

    /// Deactivate the instance at a version-qualified mount point
    Deactivate {
        mount_point: PathBuf,
    },

    /// Revert the most recent activated session
    Rollback,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = RpcClient::connect(cli.socket.as_deref()).await?;

    match cli.command {
        Commands::Status => {
            let data = client.request(Method::Status).await?;
            let ResponseData::Status(status) = data else {
                return Err(anyhow!("unexpected response"));
            };
            println!("{}  v{}", "capsuled".green().bold(), status.version);
            println!("  uptime:            {}s", status.uptime_seconds);
            println!("  mounted instances: {}", status.mounted_instances);
            println!("  active capsules:   {}", status.active_capsules);
            println!("  open sessions:     {}", status.open_sessions);
        }

        Commands::Sessions => {
            let data = client.request(Method::GetSessions).await?;
            let ResponseData::Sessions(sessions) = data else {
                return Err(anyhow!("unexpected response"));
            };
            if sessions.is_empty() {
                println!("No sessions");
                return Ok(());
            }
            for session in sessions {
                let state = session.state.to_string();
                let state = match state.as_str() {
                    "success" => state.green().to_string(),
                    "aborted" | "reverted" => state.red().to_string(),
                    _ => state.yellow().to_string(),
                };
                let mut line = format!("session {:<6} {}", session.id, state);
                if !session.child_ids.is_empty() {
                    line.push_str(&format!("  children: {:?}", session.child_ids));
                }
                for image in &session.images {
                    line.push_str(&format!("  {image}"));
                }
                if session.is_rollback {
                    line.push_str("  (rollback)");
                }
                println!("{line}");
            }
        }

        Commands::Active => {
            let data = client.request(Method::GetActiveCapsules).await?;
            let ResponseData::ActiveCapsules(capsules) = data else {
                return Err(anyhow!("unexpected response"));
            };
            if capsules.is_empty() {
                println!("No active capsules");
                return Ok(());
            }
            for capsule in capsules {
                println!(
                    "{}@{}  {}  ({})",
                    capsule.name.bold(),
                    capsule.version,
                    capsule.mount_point.display(),
                    capsule.backing_file.display()
                );
            }
        }

        Commands::Submit {
            session_id,
            children,
            rollback_of,
        } => {
            let data = client
                .request(Method::Submit {
                    session_id,
                    child_session_ids: children,
                    is_rollback: rollback_of.is_some(),
                    rollback_of,
                })
                .await?;
            let ResponseData::Submitted(images) = data else {
                return Err(anyhow!("unexpected response"));
            };
            println!("Session {session_id} staged:");
            for image in images {
                println!("  {image}  {}", image.path.display());
            }
        }

        Commands::MarkReady { session_id } => {
            client.request(Method::MarkReady { session_id }).await?;
            println!("Session {session_id} marked ready");
        }

        Commands::MarkSuccessful { session_id } => {
            client
                .request(Method::MarkSuccessful { session_id })
                .await?;
            println!("Session {session_id} marked successful");
        }

        Commands::Abort { session_id } => {
            client.request(Method::Abort { session_id }).await?;
            println!("Session {session_id} aborted");
        }

        Commands::Activate { path } => {
            let data = client.request(Method::Activate { path }).await?;
            let ResponseData::Submitted(images) = data else {
                return Err(anyhow!("unexpected response"));
            };
            for image in images {
                println!("Activated {image}");
            }
        }

        Commands::Deactivate { mount_point } => {
            client.request(Method::Deactivate { mount_point }).await?;
            println!("Deactivated");
        }

        Commands::Rollback => {
            client.request(Method::Rollback).await?;
            println!("Rolled back the active session");
        }
    }

    Ok(())
}
