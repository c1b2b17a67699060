//! powchain node entry point.

use anyhow::Context;
use clap::Parser;
use powchain_network::NodeRole;
use powchain_node::{api, init_logging, Node, NodeConfig, NodeError};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "powchain")]
#[command(about = "A peer-to-peer proof-of-work blockchain node", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Flags override its values.
    #[arg(long, env = "POWCHAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Node role: "initial", "regular" or "bootstrap-secondary".
    #[arg(long, env = "POWCHAIN_ROLE")]
    role: Option<NodeRole>,

    /// Port for the HTTP API and peer protocol.
    #[arg(long, env = "POWCHAIN_PORT")]
    port: Option<u16>,

    /// Bootstrap peer (`host:port`).
    #[arg(long, env = "POWCHAIN_BOOTSTRAP")]
    bootstrap: Option<String>,

    /// Address advertised to peers (`host:port`).
    #[arg(long, env = "POWCHAIN_ADVERTISE")]
    advertise: Option<String>,

    /// Data directory for chain storage.
    #[arg(long, env = "POWCHAIN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Hex address credited with mining rewards. Enables mining.
    #[arg(long, env = "POWCHAIN_MINER_ADDRESS")]
    miner_address: Option<String>,

    /// Mine blocks even when no transactions are pending.
    #[arg(long)]
    mine_empty_blocks: bool,

    /// Log format: "human" or "json".
    #[arg(long, env = "POWCHAIN_LOG_FORMAT")]
    log_format: Option<String>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "POWCHAIN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(NodeConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(port) = self.port {
            config.set_port(port);
        }
        if let Some(bootstrap) = self.bootstrap {
            config.bootstrap = Some(bootstrap);
        }
        if let Some(advertise) = self.advertise {
            config.advertised_addr = Some(advertise);
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(miner_address) = self.miner_address {
            config.miner_address = Some(miner_address);
        }
        if self.mine_empty_blocks {
            config.mine_empty_blocks = true;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok((config, self.print_config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, print_config) = Cli::parse().into_config()?;

    if print_config {
        print!("{}", config.to_toml_string());
        return Ok(());
    }

    init_logging(config.log_format()?, &config.log_level);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let node = Arc::new(Node::open(config)?);

    let server = tokio::spawn(api::serve(
        Arc::clone(&node),
        listener,
        node.shutdown_signal(),
    ));

    if let Err(e) = node.start().await {
        node.shutdown()?;
        return match e {
            NodeError::BootstrapFailed(_) => Err(anyhow::Error::new(e).context(format!(
                "could not join the network through bootstrap peer {}",
                node.config().bootstrap.as_deref().unwrap_or("<none>")
            ))),
            other => Err(other.into()),
        };
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    node.shutdown()?;
    server.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "powchain",
            "--role",
            "regular",
            "--port",
            "9100",
            "--bootstrap",
            "10.0.0.1:8333",
            "--mine-empty-blocks",
        ]);
        let (config, print_config) = cli.into_config().unwrap();

        assert_eq!(config.role, NodeRole::Regular);
        assert_eq!(config.listen_addr, "0.0.0.0:9100");
        assert_eq!(config.bootstrap.as_deref(), Some("10.0.0.1:8333"));
        assert!(config.mine_empty_blocks);
        assert!(!print_config);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert!(Cli::try_parse_from(["powchain", "--role", "leader"]).is_err());
    }
}
