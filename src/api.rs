//! Wire types of the portal API shared by the server and its clients.

use serde::{Deserialize, Serialize};

use crate::model::{Operation, Site};
use crate::pack::{Envelope, Locator};
use crate::plan::AgentCredentials;

pub use crate::election::{RegisterAgentRequest, RegisterAgentResponse};

/// Asks an installer to replicate a cluster from the named Hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCopyRequest {
    pub account_id: String,
    pub cluster_name: String,
    pub operation_id: String,
    pub ops_url: String,
    pub ops_token: String,
}

/// Hub-side mirror entry created when a cluster connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRemoteClusterRequest {
    pub account_id: String,
    pub site: Site,
    pub agent: AgentCredentials,
    /// The connecting cluster's CA package bytes.
    pub ca_package: Vec<u8>,
    /// Copy of the install operation, so the Hub can display history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_operation: Option<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRemoteClusterRequest {
    pub account_id: String,
    pub site_domain: String,
}

/// One package with its payload, as served over the portal API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDocument {
    pub envelope: Envelope,
    pub data: Vec<u8>,
}

/// Latest application version available for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLicenseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<usize>,
    #[serde(default)]
    pub stop_app: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseResponse {
    pub license: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLicenseRequest {
    pub license: String,
}

/// Generic acknowledgement body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Error body returned by the portal API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
