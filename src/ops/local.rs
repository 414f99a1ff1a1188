//! The installer-local operator: backend-backed reads and writes plus the
//! agent election endpoint.

use std::sync::Arc;

use tracing::info;

use crate::api::{RegisterAgentRequest, RegisterAgentResponse};
use crate::backend::Backend;
use crate::election::InstallGroups;
use crate::errors::{EngineError, Result};
use crate::model::{
    Operation, OperationKey, OperationState, ProgressEntry, ProvisioningToken, Site,
};
use crate::pack::PackageService;

#[derive(Clone)]
pub struct LocalOperator {
    backend: Backend,
    packages: PackageService,
    install_groups: Arc<InstallGroups>,
}

impl LocalOperator {
    pub fn new(backend: Backend, packages: PackageService, install_groups: Arc<InstallGroups>) -> Self {
        Self {
            backend,
            packages,
            install_groups,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn packages(&self) -> &PackageService {
        &self.packages
    }

    pub fn install_groups(&self) -> &Arc<InstallGroups> {
        &self.install_groups
    }

    pub fn get_site(&self, domain: &str) -> Result<Site> {
        self.backend.get_site(domain)
    }

    pub fn upsert_site(&self, site: &Site) -> Result<()> {
        self.backend.upsert_site(site)
    }

    pub fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.backend.get_operation(key)
    }

    pub fn list_operations(&self, domain: &str) -> Result<Vec<Operation>> {
        self.backend.list_operations(domain)
    }

    pub fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        self.backend.create_progress_entry(entry)
    }

    pub fn last_progress_entry(&self, key: &OperationKey) -> Result<Option<ProgressEntry>> {
        self.backend.last_progress_entry(key)
    }

    pub fn create_log_entry(&self, key: &OperationKey, message: &str) -> Result<()> {
        self.backend.append_log_entry(key, message)
    }

    pub fn create_provisioning_token(&self, token: &ProvisioningToken) -> Result<()> {
        self.backend.create_token(token)
    }

    /// Resolve one agent registration against the operation's install
    /// group. Registration closes once the operation starts deploying.
    pub fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse> {
        let key = request.key();
        let operation = self.backend.get_operation(&key)?;
        if operation.state.is_deploying() || operation.state.is_terminal() {
            return Err(EngineError::compare_failed(format!(
                "operation {} has already started",
                key.operation_id
            )));
        }
        Ok(self.install_groups.register(request.clone()))
    }

    /// Transition the operation into deployment and close its install
    /// group so no more agents elect.
    pub fn start_operation(&self, key: &OperationKey) -> Result<()> {
        let mut op = self.backend.get_operation(key)?;
        let target = OperationState::deploying_for(op.op_type);
        while op.state != target {
            let next = match op.state {
                OperationState::Created => OperationState::Ready,
                OperationState::Ready if op.op_type == crate::model::OperationType::Expand => {
                    OperationState::ExpandInitiated
                }
                OperationState::Ready => OperationState::InstallInitiated,
                OperationState::InstallInitiated => OperationState::InstallProvisioning,
                OperationState::InstallProvisioning => OperationState::InstallDeploying,
                OperationState::ExpandInitiated => OperationState::ExpandProvisioning,
                OperationState::ExpandProvisioning => OperationState::ExpandDeploying,
                other => {
                    return Err(EngineError::compare_failed(format!(
                        "cannot start operation from state {other}"
                    )))
                }
            };
            self.backend.compare_and_swap_operation_state(&mut op, next)?;
        }
        self.install_groups.remove(key);
        info!(op_id = %key.operation_id, "operation started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Db;
    use crate::model::OperationType;
    use crate::pack::Locator;

    fn operator() -> LocalOperator {
        let backend = Backend::new(Db::in_memory().unwrap());
        let packages = PackageService::new(backend.db().clone());
        LocalOperator::new(backend, packages, Arc::new(InstallGroups::default()))
    }

    fn request(op: &Operation, agent: &str, ip: &str) -> RegisterAgentRequest {
        RegisterAgentRequest {
            account_id: op.account_id.clone(),
            cluster_name: op.site_domain.clone(),
            operation_id: op.id.clone(),
            agent_id: agent.into(),
            advertise_ip: ip.into(),
        }
    }

    #[test]
    fn registration_closes_once_deploying() {
        let operator = operator();
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        operator.backend().create_operation(&op).unwrap();

        let response = operator.register_agent(&request(&op, "a1", "10.0.0.1")).unwrap();
        assert_eq!(response.installer_id, "a1");

        operator.start_operation(&op.key()).unwrap();
        op = operator.get_operation(&op.key()).unwrap();
        assert!(op.state.is_deploying());

        let err = operator.register_agent(&request(&op, "a2", "10.0.0.2")).unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[test]
    fn start_operation_walks_the_expand_track() {
        let operator = operator();
        let site = Site::new("acc", "example.com", Locator::new("example.io", "app", "1.0.0"), "onprem");
        operator.backend().create_site(&site).unwrap();
        let op = Operation::new("acc", "example.com", OperationType::Expand, "onprem");
        operator.backend().create_operation(&op).unwrap();

        operator.start_operation(&op.key()).unwrap();
        let op = operator.get_operation(&op.key()).unwrap();
        assert_eq!(op.state, OperationState::ExpandDeploying);
    }

    #[test]
    fn registration_requires_an_operation() {
        let operator = operator();
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let err = operator.register_agent(&request(&op, "a1", "10.0.0.1")).unwrap_err();
        assert!(err.is_not_found());
    }
}
