//! The installer-hosted agent server.
//!
//! Binds an HTTP endpoint agents connect to for the duration of the
//! operation: they register, long-poll `/agent/next` for assignments,
//! and post results and progress. The server implements
//! [`AgentRouter`], so the FSM dispatches per-server phases by awaiting
//! the agent's result for each assignment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{
    AgentProgress, AssignmentKind, AssignmentResult, PhaseAssignment, RegisterPeerRequest,
};
use crate::errors::{EngineError, Result};
use crate::fsm::AgentRouter;
use crate::model::{OperationKey, ProgressEntry, Server};
use crate::ops::Operator;
use crate::plan::PhaseData;

/// How long `/agent/next` holds a poll open before returning empty.
const POLL_WINDOW: Duration = Duration::from_secs(20);
/// How long the router waits for an agent to finish one phase.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(600);

struct Peer {
    assignments: mpsc::Sender<PhaseAssignment>,
}

struct ServerState {
    access_token: String,
    key: OperationKey,
    operator: Arc<Operator>,
    peers: Mutex<HashMap<String, Arc<Mutex<Option<Peer>>>>>,
    queues: Mutex<HashMap<String, mpsc::Receiver<PhaseAssignment>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<AssignmentResult>>>,
}

/// Agent server handle: serves the HTTP surface and routes phases.
#[derive(Clone)]
pub struct AgentServer {
    state: Arc<ServerState>,
    addr: Arc<Mutex<Option<SocketAddr>>>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AgentServer {
    pub fn new(access_token: &str, key: OperationKey, operator: Arc<Operator>) -> Self {
        Self {
            state: Arc::new(ServerState {
                access_token: access_token.to_string(),
                key,
                operator,
                peers: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
            addr: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Mutex::new(None)),
        }
    }

    /// Bind and serve. `addr` may carry port 0 for a dynamic port; the
    /// bound address is returned.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.addr.lock().expect("addr mutex poisoned") = Some(bound);

        let app = self.router();
        let (tx, rx) = oneshot::channel::<()>();
        *self.shutdown.lock().expect("shutdown mutex poisoned") = Some(tx);

        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "agent server stopped");
            }
        });
        info!(addr = %bound, "agent server listening");
        Ok(bound)
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().expect("shutdown mutex poisoned").take() {
            let _ = tx.send(());
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock().expect("addr mutex poisoned")
    }

    pub fn connected_agents(&self) -> usize {
        self.state.peers.lock().expect("peer mutex poisoned").len()
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/agent/register", post(register_peer))
            .route("/agent/next", get(next_assignment))
            .route("/agent/result", post(post_result))
            .route("/agent/progress", post(post_progress))
            .with_state(self.state.clone())
    }

    async fn dispatch(&self, server: &Server, assignment: PhaseAssignment) -> Result<()> {
        let sender = {
            let peers = self.state.peers.lock().expect("peer mutex poisoned");
            let peer_cell = peers.get(&server.advertise_ip).cloned();
            match peer_cell.as_ref().and_then(|cell| {
                cell.lock()
                    .expect("peer cell poisoned")
                    .as_ref()
                    .map(|p| p.assignments.clone())
            }) {
                Some(sender) => sender,
                None => {
                    // not connected yet: transient, the FSM retries
                    return Err(EngineError::retry(format!(
                        "agent on {} has not connected",
                        server.advertise_ip
                    )));
                }
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        self.state
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(assignment.id.clone(), result_tx);

        if sender.send(assignment.clone()).await.is_err() {
            self.state
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&assignment.id);
            return Err(EngineError::retry(format!(
                "agent on {} dropped its assignment queue",
                server.advertise_ip
            )));
        }

        match tokio::time::timeout(DISPATCH_TIMEOUT, result_rx).await {
            Ok(Ok(result)) if result.success => Ok(()),
            Ok(Ok(result)) => Err(EngineError::retry(result.error.unwrap_or_else(|| {
                format!("phase {} failed on {}", assignment.phase_id, server.hostname)
            }))),
            Ok(Err(_)) => Err(EngineError::connection_problem(format!(
                "agent on {} disconnected mid-phase",
                server.advertise_ip
            ))),
            Err(_) => Err(EngineError::retry(format!(
                "agent on {} did not finish phase {} in time",
                server.advertise_ip, assignment.phase_id
            ))),
        }
    }
}

#[async_trait]
impl AgentRouter for AgentServer {
    async fn execute_on(&self, server: &Server, phase_id: &str, data: &PhaseData) -> Result<()> {
        self.dispatch(
            server,
            PhaseAssignment {
                id: Uuid::new_v4().to_string(),
                phase_id: phase_id.to_string(),
                kind: AssignmentKind::Execute,
                data: data.clone(),
            },
        )
        .await
    }

    async fn rollback_on(&self, server: &Server, phase_id: &str, data: &PhaseData) -> Result<()> {
        self.dispatch(
            server,
            PhaseAssignment {
                id: Uuid::new_v4().to_string(),
                phase_id: phase_id.to_string(),
                kind: AssignmentKind::Rollback,
                data: data.clone(),
            },
        )
        .await
    }
}

#[derive(serde::Deserialize)]
struct AuthQuery {
    access_token: String,
    #[serde(default)]
    ip: Option<String>,
}

fn authorize(state: &ServerState, query: &AuthQuery) -> std::result::Result<(), Response> {
    if query.access_token != state.access_token {
        return Err((StatusCode::FORBIDDEN, "invalid access token").into_response());
    }
    Ok(())
}

async fn register_peer(
    State(state): State<Arc<ServerState>>,
    Query(auth): Query<AuthQuery>,
    Json(request): Json<RegisterPeerRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &auth) {
        return response;
    }
    let (tx, rx) = mpsc::channel(16);
    let peer = Peer { assignments: tx };
    state
        .peers
        .lock()
        .expect("peer mutex poisoned")
        .insert(request.advertise_ip.clone(), Arc::new(Mutex::new(Some(peer))));
    state
        .queues
        .lock()
        .expect("queue mutex poisoned")
        .insert(request.advertise_ip.clone(), rx);
    info!(agent = %request.agent_id, ip = %request.advertise_ip, "agent connected");
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

async fn next_assignment(
    State(state): State<Arc<ServerState>>,
    Query(auth): Query<AuthQuery>,
) -> Response {
    if let Err(response) = authorize(&state, &auth) {
        return response;
    }
    let Some(ip) = auth.ip.clone() else {
        return (StatusCode::BAD_REQUEST, "missing ip").into_response();
    };
    let mut queue = match state.queues.lock().expect("queue mutex poisoned").remove(&ip) {
        Some(queue) => queue,
        None => return (StatusCode::NOT_FOUND, "agent is not registered").into_response(),
    };

    let assignment = tokio::time::timeout(POLL_WINDOW, queue.recv()).await;
    state
        .queues
        .lock()
        .expect("queue mutex poisoned")
        .insert(ip, queue);

    match assignment {
        Ok(Some(assignment)) => (StatusCode::OK, Json(assignment)).into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn post_result(
    State(state): State<Arc<ServerState>>,
    Query(auth): Query<AuthQuery>,
    Json(result): Json<AssignmentResult>,
) -> Response {
    if let Err(response) = authorize(&state, &auth) {
        return response;
    }
    match state
        .pending
        .lock()
        .expect("pending mutex poisoned")
        .remove(&result.id)
    {
        Some(tx) => {
            let _ = tx.send(result);
            StatusCode::OK.into_response()
        }
        None => {
            debug!(id = %result.id, "result for unknown assignment");
            StatusCode::OK.into_response()
        }
    }
}

async fn post_progress(
    State(state): State<Arc<ServerState>>,
    Query(auth): Query<AuthQuery>,
    Json(progress): Json<AgentProgress>,
) -> Response {
    if let Err(response) = authorize(&state, &auth) {
        return response;
    }
    let entry = ProgressEntry::new(
        &state.key,
        progress.completion,
        format!("[{}] {}", progress.phase_id, progress.message),
    );
    if let Err(e) = state.operator.create_progress_entry(&entry).await {
        warn!(error = %e, "failed to record agent progress");
    }
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Db};
    use crate::election::InstallGroups;
    use crate::model::{Operation, OperationType, ServerRole};
    use crate::ops::LocalOperator;
    use crate::pack::PackageService;

    fn server_fixture() -> (AgentServer, OperationKey, Backend) {
        let backend = Backend::new(Db::in_memory().unwrap());
        let local = LocalOperator::new(
            backend.clone(),
            PackageService::new(backend.db().clone()),
            Arc::new(InstallGroups::default()),
        );
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        let key = op.key();
        let server = AgentServer::new("tok-1", key.clone(), Arc::new(Operator::Local(local)));
        (server, key, backend)
    }

    #[tokio::test]
    async fn dispatch_without_agent_is_transient() {
        let (agent_server, _, _) = server_fixture();
        let target = Server::new("node-1", "10.0.0.1", ServerRole::Master);
        let err = agent_server
            .execute_on(&target, "/pull/node-1", &PhaseData::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn server_binds_a_dynamic_port() {
        let (agent_server, _, _) = server_fixture();
        let bound = agent_server
            .start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(agent_server.local_addr(), Some(bound));
        agent_server.stop();
    }
}
