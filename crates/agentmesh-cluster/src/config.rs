//! Node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentmesh_transport::{ConnectorConfig, NodeId, TcpTransportConfig, TlsConfig};
use serde::{Deserialize, Serialize};

/// PEM files for node-to-node TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// CA certificate all peers are signed by.
    pub ca_cert: PathBuf,
    /// This node's certificate chain.
    pub cert_chain: PathBuf,
    /// This node's private key.
    pub private_key: PathBuf,
}

/// Configuration of one management node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's id.
    pub node_id: u64,
    /// Address the link server binds.
    pub listen_addr: String,
    /// Port peers listen on.
    pub peer_port: u16,
    /// Period of the direct-host scan.
    pub direct_scan_interval_secs: u64,
    /// Delay before the first direct-host scan.
    pub startup_delay_secs: u64,
    /// Period of the transfer scan.
    pub transfer_check_interval_secs: u64,
    /// Delay before the first transfer scan.
    pub transfer_scan_initial_delay_secs: u64,
    /// A requested transfer that makes no progress for this long is abandoned.
    pub rebalance_timeout_secs: u64,
    /// Maximum hosts loaded per direct-host scan.
    pub load_size: usize,
    /// Expected host heartbeat interval; three missed pings make a host loadable.
    pub ping_interval_secs: u64,
    /// Bound on acquiring the cluster-wide scan lock.
    pub lock_timeout_secs: u64,
    /// Send attempts per peer route.
    pub route_attempts: u32,
    /// Read/write timeout on peer links.
    pub socket_timeout_secs: u64,
    /// Peer connect timeout.
    pub connect_timeout_ms: u64,
    /// Whether this node takes part in agent rebalancing.
    pub rebalance_enabled: bool,
    /// Delay before the one-shot load balancer run.
    pub load_balance_delay_secs: u64,
    /// Default deadline for requests sent through the manager.
    pub request_timeout_secs: u64,
    /// Peer link TLS material; plain TCP when absent.
    pub tls: Option<TlsPaths>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: String::from("0.0.0.0:9090"),
            peer_port: 9090,
            direct_scan_interval_secs: 90,
            startup_delay_secs: 5,
            transfer_check_interval_secs: 10,
            transfer_scan_initial_delay_secs: 60,
            rebalance_timeout_secs: 300,
            load_size: 16,
            ping_interval_secs: 60,
            lock_timeout_secs: 5,
            route_attempts: 5,
            socket_timeout_secs: 60,
            connect_timeout_ms: 5000,
            rebalance_enabled: false,
            load_balance_delay_secs: 30,
            request_timeout_secs: 60,
            tls: None,
        }
    }
}

impl ClusterConfig {
    /// Loads a `.toml` or `.json` config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        let config: ClusterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the scanners and connector cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("direct_scan_interval_secs", self.direct_scan_interval_secs),
            ("transfer_check_interval_secs", self.transfer_check_interval_secs),
            ("rebalance_timeout_secs", self.rebalance_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("socket_timeout_secs", self.socket_timeout_secs),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.load_size == 0 {
            anyhow::bail!("load_size must be greater than zero");
        }
        if self.route_attempts == 0 {
            anyhow::bail!("route_attempts must be greater than zero");
        }
        if !NodeId::new(self.node_id).is_known() {
            anyhow::bail!("node_id {} is reserved", self.node_id);
        }
        Ok(())
    }

    /// This node's id.
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    /// TCP settings for peer links.
    pub fn tcp_transport(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            io_timeout_ms: self.socket_timeout_secs * 1000,
            ..TcpTransportConfig::default()
        }
    }

    /// Peer connector settings.
    pub fn connector(&self) -> ConnectorConfig {
        ConnectorConfig { route_attempts: self.route_attempts }
    }

    /// Reads the TLS material, if configured.
    pub fn tls_config(&self) -> anyhow::Result<Option<TlsConfig>> {
        match &self.tls {
            Some(paths) => Ok(Some(TlsConfig::from_files(&paths.ca_cert, &paths.cert_chain, &paths.private_key)?)),
            None => Ok(None),
        }
    }

    /// Hosts whose last ping is older than this are loadable.
    pub fn host_dead_after(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs * 3)
    }

    /// Transfer abandonment deadline.
    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_secs(self.rebalance_timeout_secs)
    }

    /// Request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.direct_scan_interval_secs, 90);
        assert_eq!(config.startup_delay_secs, 5);
        assert_eq!(config.rebalance_timeout_secs, 300);
        assert_eq!(config.load_size, 16);
        assert_eq!(config.route_attempts, 5);
        assert!(!config.rebalance_enabled);
        assert!(config.tls.is_none());
        assert_eq!(config.host_dead_after(), Duration::from_secs(180));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_id = 7
listen_addr = "10.0.0.7:9090"
load_size = 4
rebalance_enabled = true

[tls]
ca_cert = "/etc/agentmesh/ca.pem"
cert_chain = "/etc/agentmesh/node.pem"
private_key = "/etc/agentmesh/node.key"
            "#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node(), NodeId::new(7));
        assert_eq!(config.listen_addr, "10.0.0.7:9090");
        assert_eq!(config.load_size, 4);
        assert!(config.rebalance_enabled);
        assert_eq!(config.ping_interval_secs, 60);
        assert_eq!(config.tls.unwrap().ca_cert, PathBuf::from("/etc/agentmesh/ca.pem"));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "node_id": 3, "route_attempts": 2, "socket_timeout_secs": 5 }}"#).unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.connector().route_attempts, 2);
        assert_eq!(config.tcp_transport().io_timeout_ms, 5000);
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "load_size = 0").unwrap();
        assert!(ClusterConfig::from_file(file.path()).is_err());

        let config = ClusterConfig { transfer_check_interval_secs: 0, ..ClusterConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ClusterConfig::from_file(file.path()).is_err());
    }
}
