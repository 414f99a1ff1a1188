//! The fan-out operator: local writes first, Hub writes best-effort.
//!
//! The remote side is held weakly; it lives exactly as long as the trust
//! relationship that created it. Once the Hub client is dropped (or was
//! never there), the fan-out degrades to the local operator without
//! failing the install.

use std::sync::Weak;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use crate::errors::Result;
use crate::hub::HubClient;
use crate::model::{OperationKey, ProgressEntry};
use crate::ops::LocalOperator;

pub struct FanoutOperator {
    local: LocalOperator,
    remote: Weak<HubClient>,
}

impl FanoutOperator {
    pub fn new(local: LocalOperator, remote: Weak<HubClient>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalOperator {
        &self.local
    }

    /// Local write first; its failure fails the call. The Hub mirror is
    /// logged and ignored so Hub availability never gates an install.
    pub async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        let stored = self.local.create_progress_entry(entry)?;
        if let Some(remote) = self.remote.upgrade()
            && let Err(e) = remote.create_progress_entry(&stored).await
        {
            warn!(error = %e, "failed to mirror progress entry to the Hub");
        }
        Ok(stored)
    }

    pub async fn create_log_entry(&self, key: &OperationKey, message: &str) -> Result<()> {
        self.local.create_log_entry(key, message)?;
        if let Some(remote) = self.remote.upgrade()
            && let Err(e) = remote.create_log_entry(key, message).await
        {
            warn!(error = %e, "failed to mirror log entry to the Hub");
        }
        Ok(())
    }

    /// Duplicate a log byte stream onto the local sink and the Hub.
    /// Local failures fail the call; the Hub side may drop out mid-stream
    /// while the local copy continues.
    pub async fn stream_operation_logs<R>(&self, key: &OperationKey, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut hub_alive = true;
        while let Some(line) = lines.next_line().await? {
            self.local.create_log_entry(key, &line)?;
            if hub_alive
                && let Some(remote) = self.remote.upgrade()
                && let Err(e) = remote.create_log_entry(key, &line).await
            {
                warn!(error = %e, "hub log stream closed, continuing locally");
                hub_alive = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Db};
    use crate::election::InstallGroups;
    use crate::model::{Operation, OperationType};
    use crate::pack::PackageService;
    use std::sync::Arc;

    fn fanout_without_hub() -> (FanoutOperator, Backend, OperationKey) {
        let backend = Backend::new(Db::in_memory().unwrap());
        let local = LocalOperator::new(
            backend.clone(),
            PackageService::new(backend.db().clone()),
            Arc::new(InstallGroups::default()),
        );
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let key = op.key();
        // a Weak that never upgrades: the trust relationship is gone
        let remote = {
            let arc = Arc::new(HubClient::new("http://127.0.0.1:1", "token").unwrap());
            Arc::downgrade(&arc)
        };
        (FanoutOperator::new(local, remote), backend, key)
    }

    #[tokio::test]
    async fn local_write_succeeds_without_a_hub() {
        let (fanout, backend, key) = fanout_without_hub();
        let entry = ProgressEntry::new(&key, 10, "pulling");
        let stored = fanout.create_progress_entry(&entry).await.unwrap();
        assert!(stored.sequence > 0);
        assert!(backend.last_progress_entry(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn unreachable_hub_does_not_fail_the_write() {
        let backend = Backend::new(Db::in_memory().unwrap());
        let local = LocalOperator::new(
            backend.clone(),
            PackageService::new(backend.db().clone()),
            Arc::new(InstallGroups::default()),
        );
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let key = op.key();
        // a live client pointed at a dead address: the mirror call fails,
        // the local write must not
        let remote = Arc::new(HubClient::new("http://127.0.0.1:1", "token").unwrap());
        let fanout = FanoutOperator::new(local, Arc::downgrade(&remote));

        fanout
            .create_progress_entry(&ProgressEntry::new(&key, 10, "pulling"))
            .await
            .unwrap();
        fanout.create_log_entry(&key, "line one").await.unwrap();
        assert_eq!(backend.list_log_entries(&key).unwrap(), vec!["line one"]);
    }

    #[tokio::test]
    async fn stream_copies_every_line_locally() {
        let (fanout, backend, key) = fanout_without_hub();
        let stream = std::io::Cursor::new(b"alpha\nbeta\ngamma\n".to_vec());
        fanout.stream_operation_logs(&key, stream).await.unwrap();
        assert_eq!(
            backend.list_log_entries(&key).unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
    }
}
