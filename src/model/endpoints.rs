//! Cluster endpoint policy and the `kube-system` artifacts that encode it.
//!
//! Two Services split user traffic from cluster (agent) traffic, and one
//! ConfigMap records the advertise addresses the operator reads on startup.
//! The artifacts keep their historical names so existing cluster images keep
//! resolving them.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

pub const PUBLIC_SERVICE: &str = "gravity-public";
pub const AGENTS_SERVICE: &str = "gravity-agents";
pub const HUB_CONFIG_MAP: &str = "gravity-opscenter";

/// Port serving the web UI / portal API.
const PORT_WEB: u16 = 443;
/// Port agents use for RPC with the installer/operator.
const PORT_AGENTS: u16 = 3012;
/// Port serving the reverse-tunnel listener.
const PORT_TUNNEL: u16 = 3024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

impl ServicePort {
    fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
        }
    }
}

/// Rendered Service value for the `kube-system` namespace. The engine only
/// renders these; applying them is the Kubernetes collaborator's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterService {
    pub name: String,
    pub namespace: String,
    pub ports: Vec<ServicePort>,
}

/// Advertise addresses for the two traffic classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Address users hit for UI and API traffic, `host:port`.
    pub public_addr: String,
    /// Address cluster agents hit, `host:port`. Empty means "same as
    /// public".
    #[serde(default)]
    pub agents_addr: String,
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

impl Endpoints {
    pub fn new(public_addr: &str, agents_addr: &str) -> Self {
        Self {
            public_addr: public_addr.to_string(),
            agents_addr: agents_addr.to_string(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.public_addr.is_empty() {
            return Err(EngineError::bad_parameter("public_addr is required"));
        }
        Ok(())
    }

    pub fn agents_addr_or_public(&self) -> &str {
        if self.agents_addr.is_empty() {
            &self.public_addr
        } else {
            &self.agents_addr
        }
    }

    /// Render the endpoint policy as `kube-system` Services.
    ///
    /// - Addresses equal: one combined `gravity-public` Service carries
    ///   every port, no `gravity-agents`.
    /// - Same host, different ports: both Services exist and split the port
    ///   sets so the single load balancer can route by port.
    /// - Different hosts: both Services exist, each carrying the full port
    ///   set of its traffic class on its own address.
    pub fn cluster_services(&self) -> Result<Vec<ClusterService>> {
        self.check()?;
        let agents = self.agents_addr_or_public();

        let web = ServicePort::new("web", PORT_WEB);
        let agent_ports = vec![
            ServicePort::new("agents", PORT_AGENTS),
            ServicePort::new("tunnel", PORT_TUNNEL),
        ];

        if agents == self.public_addr {
            let mut ports = vec![web];
            ports.extend(agent_ports);
            return Ok(vec![ClusterService {
                name: PUBLIC_SERVICE.to_string(),
                namespace: "kube-system".to_string(),
                ports,
            }]);
        }

        let public = ClusterService {
            name: PUBLIC_SERVICE.to_string(),
            namespace: "kube-system".to_string(),
            ports: vec![web],
        };
        let agents_svc = ClusterService {
            name: AGENTS_SERVICE.to_string(),
            namespace: "kube-system".to_string(),
            ports: if host_of(agents) == host_of(&self.public_addr) {
                // shared host: agents service carries only the agent ports
                agent_ports
            } else {
                // dedicated host: also serve the web port for tooling that
                // reaches the operator through the agents address
                let mut ports = vec![ServicePort::new("web", PORT_WEB)];
                ports.extend(agent_ports);
                ports
            },
        };
        Ok(vec![public, agents_svc])
    }

    /// Render the ConfigMap the operator reads its advertise addresses from.
    pub fn config_map(&self) -> Result<(String, std::collections::BTreeMap<String, String>)> {
        self.check()?;
        let mut data = std::collections::BTreeMap::new();
        data.insert("public_addr".to_string(), self.public_addr.clone());
        data.insert("agents_addr".to_string(), self.agents_addr_or_public().to_string());
        Ok((HUB_CONFIG_MAP.to_string(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_addresses_render_one_combined_service() {
        let endpoints = Endpoints::new("ops.example.com:443", "ops.example.com:443");
        let services = endpoints.cluster_services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, PUBLIC_SERVICE);
        assert_eq!(services[0].ports.len(), 3);
    }

    #[test]
    fn empty_agents_addr_defaults_to_public() {
        let endpoints = Endpoints::new("ops.example.com:443", "");
        let services = endpoints.cluster_services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(endpoints.agents_addr_or_public(), "ops.example.com:443");
    }

    #[test]
    fn shared_host_splits_port_sets() {
        let endpoints = Endpoints::new("ops.example.com:443", "ops.example.com:3012");
        let services = endpoints.cluster_services().unwrap();
        assert_eq!(services.len(), 2);
        let agents = services.iter().find(|s| s.name == AGENTS_SERVICE).unwrap();
        assert!(agents.ports.iter().all(|p| p.name != "web"));
    }

    #[test]
    fn distinct_hosts_carry_web_on_both() {
        let endpoints = Endpoints::new("ops.example.com:443", "agents.example.com:443");
        let services = endpoints.cluster_services().unwrap();
        let agents = services.iter().find(|s| s.name == AGENTS_SERVICE).unwrap();
        assert!(agents.ports.iter().any(|p| p.name == "web"));
    }

    #[test]
    fn config_map_records_both_addresses() {
        let endpoints = Endpoints::new("ops.example.com:443", "");
        let (name, data) = endpoints.config_map().unwrap();
        assert_eq!(name, HUB_CONFIG_MAP);
        assert_eq!(data["public_addr"], "ops.example.com:443");
        assert_eq!(data["agents_addr"], "ops.example.com:443");
    }

    #[test]
    fn missing_public_addr_is_rejected() {
        let endpoints = Endpoints::new("", "agents.example.com:443");
        assert!(endpoints.cluster_services().is_err());
    }
}
