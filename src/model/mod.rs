//! Persistent entities of the operation engine.
//!
//! Everything here is a plain serde document: the backend stores these
//! records as JSON columns keyed by their natural identifiers, and the
//! portal API serves them unchanged. Behaviour that belongs to the entity
//! itself (state-machine transitions, validation, rendering) lives next to
//! the type; orchestration lives in `fsm`, `install` and `hub`.

mod endpoints;
mod license;
mod operation;
mod progress;
mod server;
mod site;
mod token;
mod trust;

pub use endpoints::{ClusterService, Endpoints, ServicePort, AGENTS_SERVICE, HUB_CONFIG_MAP, PUBLIC_SERVICE};
pub use license::{License, LicensePayload};
pub use operation::{Operation, OperationKey, OperationState, OperationType};
pub use progress::{ProgressEntry, ProgressState};
pub use server::{Server, ServerProfile, ServerRole};
pub use site::{DnsConfig, ServiceUser, Site, SiteReason, SiteState};
pub use token::{ProvisioningToken, TokenType};
pub use trust::TrustedCluster;

/// Repository that holds system packages shipped inside every cluster
/// image. Kept under the historical name for compatibility with existing
/// images.
pub const SYSTEM_REPOSITORY: &str = "gravitational.io";

/// Locator of the trusted-cluster definition bundled in installer tarballs.
pub const TRUSTED_CLUSTER_PACKAGE: &str = "trusted-cluster";
