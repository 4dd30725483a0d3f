use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "mesh-relay",
    author,
    version,
    about = "Rendezvous relay for mesh peers"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "MESH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "MESH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_port_3000() {
        let cli = Cli::try_parse_from(["mesh-relay"]).unwrap();
        let config = ServerConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed_listen_addr() {
        let cli = Cli::try_parse_from(["mesh-relay", "--listen-addr", "not-an-addr"]).unwrap();
        let err = ServerConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("not-an-addr"));
    }
}
