//! Operator variants.
//!
//! The operator is the façade the CLI, the portal API and the FSM write
//! through. It is a tagged variant, not a trait object hierarchy:
//! `Local` works against the backend, `Remote` against a Hub's portal
//! API, `FanOut` mirrors writes from local to remote, and `Acl` checks a
//! caller before delegating.

pub mod acl;
pub mod fanout;
pub mod local;

use async_trait::async_trait;

use crate::api::{RegisterAgentRequest, RegisterAgentResponse};
use crate::errors::Result;
use crate::fsm::ProgressSink;
use crate::hub::HubClient;
use crate::model::{Operation, OperationKey, ProgressEntry, Site};

pub use acl::{AclOperator, Caller};
pub use fanout::FanoutOperator;
pub use local::LocalOperator;

pub enum Operator {
    Local(LocalOperator),
    Remote(HubClient),
    FanOut(FanoutOperator),
    Acl(Box<AclOperator>),
}

impl Operator {
    pub async fn get_site(&self, account_id: &str, domain: &str) -> Result<Site> {
        match self {
            Self::Local(local) => local.get_site(domain),
            Self::Remote(remote) => remote.get_site_by_domain(account_id, domain).await,
            Self::FanOut(fanout) => fanout.local().get_site(domain),
            Self::Acl(acl) => Box::pin(acl.get_site(account_id, domain)).await,
        }
    }

    pub async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        match self {
            Self::Local(local) => local.get_operation(key),
            Self::Remote(remote) => remote.get_site_operation(key).await,
            Self::FanOut(fanout) => fanout.local().get_operation(key),
            Self::Acl(acl) => Box::pin(acl.get_operation(key)).await,
        }
    }

    pub async fn list_operations(&self, account_id: &str, domain: &str) -> Result<Vec<Operation>> {
        match self {
            Self::Local(local) => local.list_operations(domain),
            Self::Remote(remote) => remote.get_site_operations(account_id, domain).await,
            Self::FanOut(fanout) => fanout.local().list_operations(domain),
            Self::Acl(acl) => Box::pin(acl.list_operations(account_id, domain)).await,
        }
    }

    pub async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        match self {
            Self::Local(local) => local.create_progress_entry(entry),
            Self::Remote(remote) => remote.create_progress_entry(entry).await,
            Self::FanOut(fanout) => fanout.create_progress_entry(entry).await,
            Self::Acl(acl) => Box::pin(acl.create_progress_entry(entry)).await,
        }
    }

    pub async fn last_progress_entry(&self, key: &OperationKey) -> Result<Option<ProgressEntry>> {
        match self {
            Self::Local(local) => local.last_progress_entry(key),
            Self::Remote(remote) => remote.get_site_operation_progress(key).await,
            Self::FanOut(fanout) => fanout.local().last_progress_entry(key),
            Self::Acl(acl) => Box::pin(acl.last_progress_entry(key)).await,
        }
    }

    pub async fn create_log_entry(&self, key: &OperationKey, message: &str) -> Result<()> {
        match self {
            Self::Local(local) => local.create_log_entry(key, message),
            Self::Remote(remote) => remote.create_log_entry(key, message).await.map(|_| ()),
            Self::FanOut(fanout) => fanout.create_log_entry(key, message).await,
            Self::Acl(acl) => Box::pin(acl.create_log_entry(key, message)).await,
        }
    }

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse> {
        match self {
            Self::Local(local) => local.register_agent(request),
            Self::Remote(remote) => remote.register_agent(request).await,
            Self::FanOut(fanout) => fanout.local().register_agent(request),
            Self::Acl(acl) => Box::pin(acl.register_agent(request)).await,
        }
    }

    pub async fn start_operation(&self, key: &OperationKey) -> Result<()> {
        match self {
            Self::Local(local) => local.start_operation(key),
            Self::Remote(remote) => remote.start_operation(key).await.map(|_| ()),
            Self::FanOut(fanout) => fanout.local().start_operation(key),
            Self::Acl(acl) => Box::pin(acl.start_operation(key)).await,
        }
    }
}

#[async_trait]
impl ProgressSink for Operator {
    async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        Operator::create_progress_entry(self, entry).await
    }
}
