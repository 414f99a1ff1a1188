//! Trusted clusters: persistent bidirectional trust links to a Hub.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

/// A trust link between this cluster and a Hub. Storing an enabled trusted
/// cluster causes the trust provider to open a reverse tunnel to
/// `reverse_tunnel_address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedCluster {
    pub name: String,
    pub enabled: bool,
    /// Join token the Hub issued for this link.
    pub token: String,
    /// Address of the Hub's proxy service.
    pub proxy_address: String,
    pub reverse_tunnel_address: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_host: Option<String>,
    /// The installer<->Hub bootstrap tunnel, removed at the end of install.
    #[serde(default)]
    pub system: bool,
    /// Marks the installer process itself.
    #[serde(default)]
    pub wizard: bool,
    /// Whether the periodic-updates loop polls this Hub.
    #[serde(default)]
    pub pull_updates: bool,
}

impl TrustedCluster {
    pub fn new(name: &str, token: &str, proxy_address: &str, reverse_tunnel_address: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            token: token.to_string(),
            proxy_address: proxy_address.to_string(),
            reverse_tunnel_address: reverse_tunnel_address.to_string(),
            roles: Vec::new(),
            sni_host: None,
            system: false,
            wizard: false,
            pull_updates: false,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::bad_parameter("trusted cluster name is required"));
        }
        if self.token.is_empty() {
            return Err(EngineError::bad_parameter("trusted cluster token is required"));
        }
        if self.proxy_address.is_empty() || self.reverse_tunnel_address.is_empty() {
            return Err(EngineError::bad_parameter(
                "trusted cluster proxy and reverse tunnel addresses are required",
            ));
        }
        Ok(())
    }

    /// Whether an existing record may be replaced by `next`. Identity and
    /// the `system`/`wizard` markers are immutable; address changes require
    /// the cluster to be disabled first.
    pub fn can_change_state_to(&self, next: &TrustedCluster) -> Result<()> {
        if self.name != next.name {
            return Err(EngineError::bad_parameter("trusted cluster name cannot change"));
        }
        if self.system != next.system || self.wizard != next.wizard {
            return Err(EngineError::bad_parameter(
                "trusted cluster system and wizard flags cannot change",
            ));
        }
        let addresses_change = self.proxy_address != next.proxy_address
            || self.reverse_tunnel_address != next.reverse_tunnel_address;
        if addresses_change && self.enabled && next.enabled {
            return Err(EngineError::bad_parameter(
                "disable the trusted cluster before changing its addresses",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> TrustedCluster {
        TrustedCluster::new("hub.example.com", "tok-1", "hub.example.com:3024", "hub.example.com:3023")
    }

    #[test]
    fn check_requires_identity_and_addresses() {
        assert!(cluster().check().is_ok());

        let mut c = cluster();
        c.token.clear();
        assert!(c.check().is_err());

        let mut c = cluster();
        c.reverse_tunnel_address.clear();
        assert!(c.check().is_err());
    }

    #[test]
    fn system_flag_is_immutable() {
        let existing = cluster();
        let mut next = cluster();
        next.system = true;
        assert!(existing.can_change_state_to(&next).is_err());
    }

    #[test]
    fn enabled_toggle_is_allowed() {
        let existing = cluster();
        let mut next = cluster();
        next.enabled = false;
        next.pull_updates = true;
        assert!(existing.can_change_state_to(&next).is_ok());
    }

    #[test]
    fn address_change_requires_disable() {
        let existing = cluster();
        let mut next = cluster();
        next.proxy_address = "other.example.com:3024".into();
        assert!(existing.can_change_state_to(&next).is_err());

        next.enabled = false;
        assert!(existing.can_change_state_to(&next).is_ok());
    }
}
