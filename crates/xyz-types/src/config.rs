//! Node configuration.
//!
//! A node is described by three sections: `[self]` (its own identity),
//! `[system]` (the statically known peers) and `[rpc]` (call tuning).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node.
    #[serde(rename = "self")]
    pub self_conf: SelfConf,
    /// Peers this node may call.
    #[serde(rename = "system", default)]
    pub system_conf: SystemConf,
    /// Call deadline and authentication.
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl NodeConfig {
    /// A config with the given identity, no peers and default RPC settings.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            self_conf: SelfConf {
                name: name.into(),
                host: host.into(),
                port,
            },
            system_conf: SystemConf::default(),
            rpc: RpcConfig::default(),
        }
    }
}

/// Identity of the local node. Immutable once the node starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfConf {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

impl SelfConf {
    /// `host:port` string suitable for binding.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Statically configured peer set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConf {
    #[serde(default)]
    pub microservices: Vec<MicroserviceConf>,
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroserviceConf {
    /// Service name the peer is addressed by.
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Actions the peer is known to serve. A bare call name that matches
    /// one of these resolves to this peer.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl MicroserviceConf {
    /// `host:port` string suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// RPC tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Deadline for a single outbound call (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Pre-shared key for HMAC handshake authentication. Empty disables it.
    #[serde(default)]
    pub shared_secret: String,
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            shared_secret: String::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_call_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [self]
            name = "stringMS"
            host = "127.0.0.1"
            port = 3334

            [system]
            microservices = [
                { name = "mathMS", host = "10.0.0.2", port = 3333, actions = ["mul"] },
            ]

            [rpc]
            call_timeout_secs = 3
            shared_secret = "s3cret"
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.self_conf.name, "stringMS");
        assert_eq!(config.self_conf.listen_address(), "127.0.0.1:3334");
        assert_eq!(config.system_conf.microservices.len(), 1);
        let math = &config.system_conf.microservices[0];
        assert_eq!(math.address(), "10.0.0.2:3333");
        assert_eq!(math.actions, vec!["mul".to_string()]);
        assert_eq!(config.rpc.call_timeout(), Duration::from_secs(3));
        assert_eq!(config.rpc.shared_secret, "s3cret");
    }

    #[test]
    fn test_defaults_for_optional_sections() {
        let raw = r#"
            [self]
            name = "solo"
            port = 4000
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.self_conf.host, "127.0.0.1");
        assert!(config.system_conf.microservices.is_empty());
        assert_eq!(config.rpc.call_timeout_secs, 10);
        assert!(config.rpc.shared_secret.is_empty());
    }

    #[test]
    fn test_missing_self_section_is_rejected() {
        let raw = r#"
            [system]
            microservices = []
        "#;
        assert!(toml::from_str::<NodeConfig>(raw).is_err());
    }
}
