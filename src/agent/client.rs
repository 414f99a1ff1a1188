//! The agent process on a target server.
//!
//! Connects to the installer's agent server, long-polls for phase
//! assignments and executes them through a [`HostRunner`]. The runner is
//! the seam to the actual host-mutation code (package unpacking, system
//! service installation), which belongs to the host tooling.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{
    AgentProgress, AgentUrl, AssignmentKind, AssignmentResult, PhaseAssignment, RegisterPeerRequest,
};
use crate::errors::{EngineError, Result};
use crate::plan::PhaseData;

/// Executes phase bodies on the local host.
#[async_trait]
pub trait HostRunner: Send + Sync {
    async fn run_phase(&self, phase_id: &str, data: &PhaseData) -> Result<()>;
    async fn rollback_phase(&self, phase_id: &str, data: &PhaseData) -> Result<()>;
}

pub struct LoggingRunner;

#[async_trait]
impl HostRunner for LoggingRunner {
    async fn run_phase(&self, phase_id: &str, _data: &PhaseData) -> Result<()> {
        info!(phase = %phase_id, "phase executed");
        Ok(())
    }

    async fn rollback_phase(&self, phase_id: &str, _data: &PhaseData) -> Result<()> {
        info!(phase = %phase_id, "phase rolled back");
        Ok(())
    }
}

pub struct AgentClient {
    url: AgentUrl,
    agent_id: String,
    advertise_ip: String,
    runner: std::sync::Arc<dyn HostRunner>,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(
        url: AgentUrl,
        agent_id: &str,
        advertise_ip: &str,
        runner: std::sync::Arc<dyn HostRunner>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::bad_parameter(format!("building http client: {e}")))?;
        Ok(Self {
            url,
            agent_id: agent_id.to_string(),
            advertise_ip: advertise_ip.to_string(),
            runner,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}?access_token={}&ip={}",
            self.url.http_base(),
            path,
            self.url.access_token,
            self.advertise_ip
        )
    }

    pub async fn register(&self) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint("/agent/register"))
            .json(&RegisterPeerRequest {
                agent_id: self.agent_id.clone(),
                advertise_ip: self.advertise_ip.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::access_denied(format!(
                "agent registration rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Serve assignments until shutdown. Registration retries while the
    /// installer comes up; poll misses are normal (the server holds polls
    /// open and returns empty on timeout).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            match self.register().await {
                Ok(()) => break,
                Err(e) if matches!(e, EngineError::AccessDenied(_)) => return Err(e),
                Err(e) => {
                    debug!(error = %e, "installer not reachable yet, retrying registration");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(agent = %self.agent_id, "agent stopping");
                    return Ok(());
                }
                polled = self.poll_next() => {
                    match polled {
                        Ok(Some(assignment)) => self.handle(assignment).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "assignment poll failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn poll_next(&self) -> Result<Option<PhaseAssignment>> {
        let response = self.http.get(self.endpoint("/agent/next")).send().await?;
        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(EngineError::connection_problem(format!(
                "assignment poll returned {status}"
            ))),
        }
    }

    async fn handle(&self, assignment: PhaseAssignment) {
        info!(phase = %assignment.phase_id, kind = ?assignment.kind, "assignment received");
        let outcome = match assignment.kind {
            AssignmentKind::Execute => self.runner.run_phase(&assignment.phase_id, &assignment.data).await,
            AssignmentKind::Rollback => {
                self.runner.rollback_phase(&assignment.phase_id, &assignment.data).await
            }
        };
        let result = AssignmentResult {
            id: assignment.id.clone(),
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        };
        if let Err(e) = self
            .http
            .post(self.endpoint("/agent/result"))
            .json(&result)
            .send()
            .await
        {
            warn!(error = %e, "failed to report assignment result");
        }
    }

    /// Report phase progress attributable to this agent.
    pub async fn report_progress(&self, phase_id: &str, completion: u8, message: &str) -> Result<()> {
        self.http
            .post(self.endpoint("/agent/progress"))
            .json(&AgentProgress {
                phase_id: phase_id.to_string(),
                completion,
                message: message.to_string(),
            })
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentServer;
    use crate::backend::{Backend, Db};
    use crate::election::InstallGroups;
    use crate::fsm::AgentRouter;
    use crate::model::{Operation, OperationType, Server, ServerRole};
    use crate::ops::{LocalOperator, Operator};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostRunner for RecordingRunner {
        async fn run_phase(&self, phase_id: &str, _data: &PhaseData) -> Result<()> {
            self.calls.lock().unwrap().push(format!("run {phase_id}"));
            Ok(())
        }

        async fn rollback_phase(&self, phase_id: &str, _data: &PhaseData) -> Result<()> {
            self.calls.lock().unwrap().push(format!("rollback {phase_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_dispatch_round_trip() {
        let backend = Backend::new(Db::in_memory().unwrap());
        let local = LocalOperator::new(
            backend.clone(),
            crate::pack::PackageService::new(backend.db().clone()),
            Arc::new(InstallGroups::default()),
        );
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let agent_server = AgentServer::new("tok-1", op.key(), Arc::new(Operator::Local(local)));
        let bound = agent_server
            .start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let url = AgentUrl::new("127.0.0.1", bound.port(), "node", "tok-1");
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let client = AgentClient::new(url, "agent-1", "10.0.0.1", runner.clone()).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client_task = tokio::spawn(async move { client.run(shutdown_rx).await });

        // wait until the agent registered, then dispatch a phase
        for _ in 0..50 {
            if agent_server.connected_agents() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let target = Server::new("node-1", "10.0.0.1", ServerRole::Master);
        agent_server
            .execute_on(&target, "/pull/node-1", &PhaseData::default())
            .await
            .unwrap();
        assert_eq!(*runner.calls.lock().unwrap(), vec!["run /pull/node-1"]);

        shutdown_tx.send(true).unwrap();
        client_task.await.unwrap().unwrap();
        agent_server.stop();
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let backend = Backend::new(Db::in_memory().unwrap());
        let local = LocalOperator::new(
            backend.clone(),
            crate::pack::PackageService::new(backend.db().clone()),
            Arc::new(InstallGroups::default()),
        );
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let agent_server = AgentServer::new("tok-1", op.key(), Arc::new(Operator::Local(local)));
        let bound = agent_server
            .start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let url = AgentUrl::new("127.0.0.1", bound.port(), "node", "wrong-token");
        let client = AgentClient::new(url, "agent-1", "10.0.0.1", Arc::new(LoggingRunner)).unwrap();
        let err = client.register().await.unwrap_err();
        assert!(matches!(err, EngineError::AccessDenied(_)));
        agent_server.stop();
    }
}
