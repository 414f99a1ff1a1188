//! The joining agent's registration loop.
//!
//! Every agent keeps registering with the Hub until the operation starts.
//! The first response decides its role; afterwards the loop only watches
//! for two things: the operation reaching deployment (normal exit) and a
//! *changed* installer identity, which means the elected installer died
//! and this agent's connection can no longer be re-pointed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{RegisterAgentRequest, RegisterAgentResponse};
use crate::errors::Result;
use crate::hub::HubClient;
use crate::model::{Operation, OperationKey};

/// Cadence of the registration poll.
pub const REGISTRATION_INTERVAL: Duration = Duration::from_secs(2);

/// The Hub surface the loop needs; substituted in tests.
#[async_trait]
pub trait RegistrationRemote: Send + Sync {
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse>;
    async fn get_site_operation(&self, key: &OperationKey) -> Result<Operation>;
}

#[async_trait]
impl RegistrationRemote for HubClient {
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse> {
        HubClient::register_agent(self, request).await
    }

    async fn get_site_operation(&self, key: &OperationKey) -> Result<Operation> {
        HubClient::get_site_operation(self, key).await
    }
}

/// Why the registration loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The operation started deploying; no more elections happen.
    OperationStarted,
    /// The elected installer went away and a different agent took the
    /// slot. The caller must abort (exit code 255).
    InstallerChanged { installer_ip: String },
    Cancelled,
}

/// One registration round; the first call decides this agent's role.
pub async fn register_once(
    remote: &dyn RegistrationRemote,
    request: &RegisterAgentRequest,
) -> Result<RegisterAgentResponse> {
    let response = remote.register_agent(request).await?;
    if response.installer_id == request.agent_id {
        info!(agent = %request.agent_id, "elected installer");
    } else {
        info!(agent = %request.agent_id, installer = %response.installer_id, "joining installer");
    }
    Ok(response)
}

/// Keep the registration alive until the operation starts. `elected` is
/// the response of the first round.
pub async fn supervise_registration(
    remote: &dyn RegistrationRemote,
    request: &RegisterAgentRequest,
    elected: RegisterAgentResponse,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinOutcome> {
    let key = request.key();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(JoinOutcome::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        // re-register: refreshes the installer's TTL, and tells joiners
        // whether the installer is still the one they dialed
        match remote.register_agent(request).await {
            Ok(response) if response.installer_id != elected.installer_id => {
                return Ok(JoinOutcome::InstallerChanged {
                    installer_ip: elected.installer_ip,
                });
            }
            Ok(_) => {}
            Err(e) if e.is_compare_failed() => {
                // registration window closed: the operation has started
                return Ok(JoinOutcome::OperationStarted);
            }
            Err(e) => debug!(error = %e, "registration poll failed, retrying"),
        }

        match remote.get_site_operation(&key).await {
            Ok(operation) if operation.state.is_deploying() => {
                return Ok(JoinOutcome::OperationStarted);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "operation poll failed, retrying"),
        }
    }
}
