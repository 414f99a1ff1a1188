//! Servers participating in an operation and their role profiles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    #[default]
    Node,
    Master,
    /// Worker that also runs kubelet system services.
    Knode,
}

impl ServerRole {
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Node => "node",
            Self::Master => "master",
            Self::Knode => "knode",
        };
        f.write_str(s)
    }
}

/// One server enrolled in an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    pub role: ServerRole,
}

impl Server {
    pub fn new(hostname: &str, advertise_ip: &str, role: ServerRole) -> Self {
        Self {
            hostname: hostname.to_string(),
            advertise_ip: advertise_ip.to_string(),
            role,
        }
    }
}

/// Requested server count per role, carried in the operation's provisioning
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub role: ServerRole,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_predicates() {
        assert!(ServerRole::Master.is_master());
        assert!(!ServerRole::Node.is_master());
        assert!(!ServerRole::Knode.is_master());
    }

    #[test]
    fn role_wire_spelling() {
        assert_eq!(serde_json::to_string(&ServerRole::Knode).unwrap(), "\"knode\"");
    }
}
