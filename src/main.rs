//! inventory-agent entrypoint: `inventory-agent [config path]`.
//! The config path may also come from `INVENTORY_AGENT_CONFIG`.

use inventory_agent::{logging::StructuredLogger, Agent, AgentConfig};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "/etc/inventory-agent/config.yml";
const CONFIG_PATH_ENV: &str = "INVENTORY_AGENT_CONFIG";

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AgentConfig::load(&config_path)?;

    StructuredLogger::init(config.log.json, &config.log.level);
    info!(
        config = %config_path.display(),
        data_dir = %config.data_dir.display(),
        mode = config.run_mode.as_str(),
        "inventory agent starting"
    );

    let agent = Agent::new(config)?;
    info!(entity = agent.entity_key(), agent_id = %agent.store().agent_id()?, "agent ready");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(agent.run(shutdown_rx));

    wait_for_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    running.await??;
    Ok(())
}
