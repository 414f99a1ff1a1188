//! Caller-checking operator wrapper.

use crate::api::{RegisterAgentRequest, RegisterAgentResponse};
use crate::errors::{EngineError, Result};
use crate::model::{Operation, OperationKey, ProgressEntry, Site};
use crate::ops::Operator;

/// Who is making the call. Agents act with their provisioning token's
/// identity; operators act as admins.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_email: String,
    pub admin: bool,
}

impl Caller {
    pub fn admin(user_email: &str) -> Self {
        Self {
            user_email: user_email.to_string(),
            admin: true,
        }
    }

    pub fn agent(user_email: &str) -> Self {
        Self {
            user_email: user_email.to_string(),
            admin: false,
        }
    }
}

/// Wraps an operator and refuses mutations from non-admin callers, except
/// the writes agents legitimately perform (registration, progress, logs).
pub struct AclOperator {
    inner: Operator,
    caller: Caller,
}

impl AclOperator {
    pub fn new(inner: Operator, caller: Caller) -> Self {
        Self { inner, caller }
    }

    fn require_admin(&self, action: &str) -> Result<()> {
        if self.caller.admin {
            Ok(())
        } else {
            Err(EngineError::access_denied(format!(
                "{} is not allowed to {action}",
                self.caller.user_email
            )))
        }
    }

    pub async fn get_site(&self, account_id: &str, domain: &str) -> Result<Site> {
        self.inner.get_site(account_id, domain).await
    }

    pub async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.inner.get_operation(key).await
    }

    pub async fn list_operations(&self, account_id: &str, domain: &str) -> Result<Vec<Operation>> {
        self.inner.list_operations(account_id, domain).await
    }

    pub async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        self.inner.create_progress_entry(entry).await
    }

    pub async fn last_progress_entry(&self, key: &OperationKey) -> Result<Option<ProgressEntry>> {
        self.inner.last_progress_entry(key).await
    }

    pub async fn create_log_entry(&self, key: &OperationKey, message: &str) -> Result<()> {
        self.inner.create_log_entry(key, message).await
    }

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse> {
        self.inner.register_agent(request).await
    }

    pub async fn start_operation(&self, key: &OperationKey) -> Result<()> {
        self.require_admin("start operations")?;
        self.inner.start_operation(key).await
    }
}
