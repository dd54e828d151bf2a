//! Peer directory: resolves service names to network addresses.
//!
//! Built once from `[system].microservices` and read-only afterwards. A call
//! path is either `service/action` or a bare name; a bare name is looked up as
//! a service first and then among the actions each peer advertises.

use std::collections::HashMap;
use tracing::warn;
use xyz_types::{MicroserviceConf, SystemConf, XyzError, XyzResult};

/// A statically configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Actions this peer is declared to serve.
    pub actions: Vec<String>,
}

impl PeerDescriptor {
    /// `host:port` string used to connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&MicroserviceConf> for PeerDescriptor {
    fn from(conf: &MicroserviceConf) -> Self {
        Self {
            name: conf.name.clone(),
            host: conf.host.clone(),
            port: conf.port,
            actions: conf.actions.clone(),
        }
    }
}

/// A parsed call path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    /// Name to resolve in the directory.
    pub service: String,
    /// Action to invoke on the resolved peer.
    pub action: String,
}

impl CallTarget {
    /// Parse `service/action` or a bare `name` (used as both).
    pub fn parse(path: &str) -> XyzResult<Self> {
        let path = path.trim();
        match path.split_once('/') {
            Some((service, action)) => {
                if service.is_empty() {
                    return Err(XyzError::ServiceNotFound(path.to_string()));
                }
                if action.is_empty() {
                    return Err(XyzError::InvalidActionName(path.to_string()));
                }
                Ok(Self {
                    service: service.to_string(),
                    action: action.to_string(),
                })
            }
            None if path.is_empty() => Err(XyzError::ServiceNotFound(String::new())),
            None => Ok(Self {
                service: path.to_string(),
                action: path.to_string(),
            }),
        }
    }
}

/// Service name → peer lookup table.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerDescriptor>,
    /// Advertised action → owning service name.
    actions: HashMap<String, String>,
}

impl PeerDirectory {
    /// Build the directory from the system configuration.
    ///
    /// A repeated service name replaces the earlier entry. An action
    /// advertised by several peers routes to the first one declared.
    pub fn from_config(conf: &SystemConf) -> Self {
        let mut peers = HashMap::new();
        let mut actions: HashMap<String, String> = HashMap::new();

        for service in &conf.microservices {
            let descriptor = PeerDescriptor::from(service);
            for action in &descriptor.actions {
                match actions.get(action) {
                    Some(owner) if owner != &descriptor.name => {
                        warn!(
                            action = %action,
                            owner = %owner,
                            ignored = %descriptor.name,
                            "Action advertised by more than one service, keeping first"
                        );
                    }
                    _ => {
                        actions.insert(action.clone(), descriptor.name.clone());
                    }
                }
            }
            if peers
                .insert(descriptor.name.clone(), descriptor)
                .is_some()
            {
                warn!(service = %service.name, "Duplicate service name in config, last entry wins");
            }
        }

        Self { peers, actions }
    }

    /// Look up a peer by service name, falling back to advertised actions.
    pub fn resolve(&self, name: &str) -> XyzResult<&PeerDescriptor> {
        if let Some(peer) = self.peers.get(name) {
            return Ok(peer);
        }
        self.actions
            .get(name)
            .and_then(|service| self.peers.get(service))
            .ok_or_else(|| XyzError::ServiceNotFound(name.to_string()))
    }

    /// Parse a call path and resolve its peer.
    pub fn route(&self, path: &str) -> XyzResult<(PeerDescriptor, String)> {
        let target = CallTarget::parse(path)?;
        let peer = self.resolve(&target.service)?;
        Ok((peer.clone(), target.action))
    }

    /// All configured service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of configured peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are configured.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
