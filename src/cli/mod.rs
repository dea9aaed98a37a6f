use crate::config::load_config;
use crate::ledger::MessageLedger;
use crate::registry::SessionRegistry;
use anyhow::Result;
use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relaydesk")]
#[command(about = "Support chat mediator: bot/human routing with reconciled delivery")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Path to the config file (defaults to ./relaydesk.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// List active (unarchived) sessions
    Sessions,
    /// Print the transcript of one session
    History {
        #[arg(long)]
        session: String,
        #[arg(long)]
        customer: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            crate::gateway::serve(config).await
        }
        Commands::Sessions => {
            let registry = SessionRegistry::open(
                &config.storage.db_path,
                Duration::hours(config.sessions.reuse_window_hours),
            )?;
            let sessions = registry.list_active()?;
            if sessions.is_empty() {
                println!("no active sessions");
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  customer={}  agent={}  messages={}  last_active={}",
                    s.session_id,
                    s.customer_id,
                    s.current_agent.as_str(),
                    s.message_count,
                    s.last_interaction.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::History {
            session,
            customer,
            limit,
        } => {
            let ledger = MessageLedger::open(&config.storage.db_path)?;
            for m in ledger.read(&session, &customer, limit)? {
                println!(
                    "[{}] {:>11}: {}",
                    m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    m.role.as_str(),
                    m.content
                );
            }
            Ok(())
        }
    }
}
