#![warn(missing_docs)]

//! ldsync replication daemon: hosts a replication server and/or replication
//! domains as described by a configuration file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ldsync_repl::backend::MemoryBackend;
use ldsync_repl::session::{Connector, TcpConnector};
use ldsync_repl::{ReplConfig, ReplicationDomain, ReplicationServer};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ldsync-repl", about = "Multi-master directory replication")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "LDSYNC_CONFIG", default_value = "ldsync.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, env = "LDSYNC_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured replication server and domains (default).
    Serve {
        /// Seconds between monitor snapshots in the log; 0 disables them.
        #[arg(long, default_value_t = 60)]
        monitor_interval_secs: u64,
    },
    /// Validate the configuration and print it.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    }

    let config = ReplConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Serve {
        monitor_interval_secs: 60,
    }) {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve {
            monitor_interval_secs,
        } => serve(config, monitor_interval_secs).await,
    }
}

async fn serve(config: ReplConfig, monitor_interval_secs: u64) -> Result<()> {
    tracing::info!(
        broker = config.broker.is_some(),
        domains = config.domains.len(),
        "ldsync replication starting"
    );

    let mut tasks = tokio::task::JoinSet::new();

    let server = match &config.broker {
        Some(broker_config) => {
            let server =
                ReplicationServer::open(broker_config.clone(), Arc::new(MemoryBackend::new()))?;
            let listener = TcpListener::bind(&broker_config.listen_addr)
                .await
                .with_context(|| format!("binding {}", broker_config.listen_addr))?;
            server.spawn_maintenance();
            let serving = server.clone();
            tasks.spawn(async move {
                if let Err(e) = serving.serve_tcp(listener).await {
                    tracing::error!(error = %e, "replication server stopped");
                }
            });
            Some(server)
        }
        None => None,
    };

    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::default());
    let mut domains = Vec::new();
    for domain_config in &config.domains {
        let domain =
            ReplicationDomain::open(domain_config.clone(), Arc::new(MemoryBackend::new()))?;
        let runner = domain.clone();
        let connector = Arc::clone(&connector);
        tasks.spawn(async move {
            if let Err(e) = runner.run(connector).await {
                tracing::error!(base_dn = %runner.base_dn(), error = %e, "replication domain stopped");
            }
        });
        domains.push(domain);
    }

    if monitor_interval_secs > 0 {
        let server = server.clone();
        let domains = domains.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(monitor_interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_monitors(server.as_ref(), &domains);
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    for domain in &domains {
        domain.shutdown().await;
    }
    if let Some(server) = &server {
        server.shutdown();
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn log_monitors(server: Option<&ReplicationServer>, domains: &[ReplicationDomain]) {
    for domain in domains {
        match domain.monitor() {
            Ok(monitor) => tracing::info!(
                base_dn = %monitor.base_dn,
                status = %monitor.status,
                state = %monitor.server_state,
                pending = monitor.pending_updates,
                conflicts = monitor.naming_conflicts,
                "domain"
            ),
            Err(e) => tracing::warn!(base_dn = %domain.base_dn(), error = %e, "domain monitor failed"),
        }
    }
    if let Some(server) = server {
        match server.monitors() {
            Ok(monitors) => {
                for monitor in monitors {
                    tracing::info!(
                        base_dn = %monitor.base_dn,
                        records = monitor.changelog_records,
                        peers = monitor.peers.len(),
                        "replication server"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "replication server monitor failed"),
        }
    }
}
