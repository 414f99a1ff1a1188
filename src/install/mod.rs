//! Installer entry points: local installs, Hub-initiated installs, and
//! the cluster replication they share.

pub mod join;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentServer, AgentUrl};
use crate::api::ClusterCopyRequest;
use crate::backend::{Backend, Db};
use crate::config::{Config, InstallMode};
use crate::election::InstallGroups;
use crate::errors::{ok_if_exists, EngineError, Result};
use crate::fsm::engine::PlanCompleteHook;
use crate::fsm::executors::{
    install_registry, AcceptingChecker, AlwaysReadyGate, BackendApplier, PhaseServices,
    PreflightChecker,
};
use crate::fsm::{FsmEngine, FsmResult};
use crate::hub::updates::{LoggingSync, NoRemote, UpdateRemote};
use crate::hub::{HubClient, LoggingTunnel, PortalHandshake, TrustManager, UpdateLoop};
use crate::model::{
    Operation, OperationKey, OperationState, OperationType, ProvisioningToken, Server, Site,
    TokenType, TrustedCluster,
};
use crate::ops::{FanoutOperator, LocalOperator, Operator};
use crate::pack::{license_ca_locator, PackageService};
use crate::plan::builder::{AppManifest, PlanBuilder};
use crate::plan::AgentCredentials;

/// Lifetime of the provisioning token created at operation start, hours.
const INSTALL_TOKEN_TTL_HOURS: i64 = 24;
/// Cadence of the agent-registration readiness poll.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Replicate a cluster from a Hub into the local backend. `already_exists`
/// means another replication pass got there first and the local record
/// wins; an empty operation list is a hard error.
pub async fn replicate_cluster(
    backend: &Backend,
    packages: &PackageService,
    hub: &HubClient,
    request: &ClusterCopyRequest,
) -> Result<Operation> {
    let site = hub
        .get_site_by_domain(&request.account_id, &request.cluster_name)
        .await?;
    ok_if_exists(backend.create_site(&site))?;

    let operations = hub
        .get_site_operations(&request.account_id, &request.cluster_name)
        .await?;
    if operations.is_empty() {
        return Err(EngineError::bad_parameter(format!(
            "Hub returned no operations for cluster {}",
            request.cluster_name
        )));
    }
    for operation in &operations {
        ok_if_exists(backend.create_operation(operation))?;
    }
    let install_op = operations
        .iter()
        .find(|op| op.id == request.operation_id)
        .or_else(|| operations.iter().find(|op| op.op_type == OperationType::Install))
        .cloned()
        .ok_or_else(|| EngineError::not_found(format!("install operation on {}", request.cluster_name)))?;

    if let Some(progress) = hub.get_site_operation_progress(&install_op.key()).await? {
        backend.create_progress_entry(&progress)?;
    }

    let agent = hub
        .get_cluster_agent(&request.account_id, &request.cluster_name)
        .await?;
    backend.upsert_resource(
        "agent-credentials",
        &request.cluster_name,
        &serde_json::to_value(&agent)?,
    )?;

    let expand_token = hub
        .get_expand_token(&request.account_id, &request.cluster_name)
        .await?;
    ok_if_exists(backend.create_token(&expand_token))?;

    // the license CA, so licenses verify without the Hub online
    match hub.get_license_ca().await {
        Ok(ca) if !ca.is_empty() => {
            packages.upsert_package(&license_ca_locator(), &ca, false)?;
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to fetch license CA from the Hub"),
    }

    info!(cluster = %request.cluster_name, "cluster replicated from the Hub");
    Ok(install_op)
}

/// Removes installer-scoped trust once the plan completes: the `system`
/// bootstrap tunnels have no business outliving the install.
struct TeardownHook {
    trust: Arc<TrustManager>,
    backend: Backend,
}

#[async_trait]
impl PlanCompleteHook for TeardownHook {
    async fn on_plan_complete(&self, key: &OperationKey) -> Result<()> {
        let mut errors = Vec::new();
        for cluster in self.backend.list_trusted_clusters()? {
            if cluster.system || cluster.wizard {
                if let Err(e) = self.trust.delete(&cluster.name, None).await {
                    errors.push(e);
                }
            }
        }
        info!(op_id = %key.operation_id, "operation complete, installer trust removed");
        EngineError::aggregate(errors)
    }
}

/// The installer process: owns the backend, the agent server and the
/// engine for one operation.
pub struct Installer {
    config: Config,
    backend: Backend,
    packages: PackageService,
    operator: Arc<Operator>,
    trust: Arc<TrustManager>,
    hub: Option<Arc<HubClient>>,
    agent_server: std::sync::Mutex<Option<AgentServer>>,
    access_token: String,
}

impl Installer {
    pub fn new(mut config: Config) -> Result<Self> {
        config.check_and_set_defaults()?;
        let db = Db::open(&config.db_path())?;
        let backend = Backend::new(db.clone());
        let packages = PackageService::new(db);
        let install_groups = Arc::new(InstallGroups::new(config.install_group_ttl));

        let hub = match (&config.remote_ops_url, &config.ops_tunnel_token) {
            (Some(url), Some(token)) => Some(Arc::new(HubClient::new(url, token)?)),
            _ => None,
        };

        let local = LocalOperator::new(backend.clone(), packages.clone(), install_groups);
        let operator = Arc::new(match &hub {
            Some(hub) => Operator::FanOut(FanoutOperator::new(local, Arc::downgrade(hub))),
            None => Operator::Local(local),
        });

        let update_remote: Arc<dyn UpdateRemote> = match &hub {
            Some(hub) => hub.clone(),
            None => Arc::new(NoRemote),
        };
        let updates = UpdateLoop::with_tick_interval(
            backend.clone(),
            packages.clone(),
            update_remote,
            Arc::new(LoggingSync),
            config.updates_tick,
        );
        let handshake = Arc::new(PortalHandshake::new(
            backend.clone(),
            packages.clone(),
            &config.account_id,
            &config.cluster_name,
        ));
        let trust = Arc::new(
            TrustManager::new(
                backend.clone(),
                Arc::new(LoggingTunnel),
                updates,
                handshake,
                &config.cluster_name,
            )
            .with_wizard_mode(true),
        );

        let access_token = uuid::Uuid::new_v4().simple().to_string();

        Ok(Self {
            config,
            backend,
            packages,
            operator,
            trust,
            hub,
            agent_server: std::sync::Mutex::new(None),
            access_token,
        })
    }

    /// Start (or return) the agent server bound to this operation.
    async fn start_agent_server(&self, key: &OperationKey) -> Result<AgentServer> {
        if let Some(existing) = self.agent_server.lock().expect("agent server mutex poisoned").clone() {
            return Ok(existing);
        }
        let server = AgentServer::new(&self.access_token, key.clone(), self.operator.clone());
        let bind: SocketAddr = ([0, 0, 0, 0], self.config.agent_port).into();
        server.start(bind).await?;
        *self.agent_server.lock().expect("agent server mutex poisoned") = Some(server.clone());
        Ok(server)
    }

    fn stop_agent_server(&self) {
        if let Some(server) = self.agent_server.lock().expect("agent server mutex poisoned").take() {
            server.stop();
        }
    }

    pub fn agent_server_addr(&self) -> Option<SocketAddr> {
        self.agent_server
            .lock()
            .expect("agent server mutex poisoned")
            .as_ref()
            .and_then(|server| server.local_addr())
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn operator(&self) -> &Arc<Operator> {
        &self.operator
    }

    pub fn agent_url(&self, role: &str) -> AgentUrl {
        AgentUrl::new(
            &self.config.advertise_addr,
            self.config.agent_port,
            role,
            &self.access_token,
        )
    }

    /// Run an install operation to completion.
    pub async fn install(
        &self,
        servers: Vec<Server>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<FsmResult> {
        let operation = match self.config.mode {
            InstallMode::Local => self.create_local_operation(servers)?,
            InstallMode::OpsCenter => self.hub_initiated_operation().await?,
        };
        let key = operation.key();

        let token = ProvisioningToken::new(
            TokenType::Install,
            &key.account_id,
            &key.site_domain,
            &key.operation_id,
            &format!("wizard@{}", key.site_domain),
            Some(chrono::Duration::hours(INSTALL_TOKEN_TTL_HOURS)),
        );
        ok_if_exists(self.backend.create_token(&token).map(|_| ()))?;

        let router = self.start_agent_server(&key).await?;
        self.ensure_plan(&operation)?;
        self.operator.start_operation(&key).await?;

        let result = self.engine(&key, router).run(shutdown).await?;
        self.stop_agent_server();
        Ok(result)
    }

    /// Resume an interrupted operation.
    pub async fn resume(&self, shutdown: watch::Receiver<bool>) -> Result<FsmResult> {
        let key = self.last_operation_key()?;
        let router = self.start_agent_server(&key).await?;
        let result = self.engine(&key, router).resume(shutdown).await?;
        self.stop_agent_server();
        Ok(result)
    }

    pub async fn rollback_phase(&self, phase_id: &str) -> Result<()> {
        let key = self.last_operation_key()?;
        let router = self.start_agent_server(&key).await?;
        let result = self.engine(&key, router).rollback_phase(phase_id).await;
        self.stop_agent_server();
        result
    }

    pub fn last_operation_key(&self) -> Result<OperationKey> {
        let operations = self.backend.list_operations(&self.config.cluster_name)?;
        operations
            .last()
            .map(|op| op.key())
            .ok_or_else(|| EngineError::not_found(format!("no operations on {}", self.config.cluster_name)))
    }

    fn create_local_operation(&self, servers: Vec<Server>) -> Result<Operation> {
        let app = self
            .config
            .app_package
            .clone()
            .ok_or_else(|| EngineError::bad_parameter("an application package is required"))?;
        let mut site = Site::new(
            &self.config.account_id,
            &self.config.cluster_name,
            app,
            &self.config.provider,
        );
        site.license = self.config.license.clone();
        site.local = true;
        ok_if_exists(self.backend.create_site(&site))?;

        // resume-friendly: reuse a live operation if one exists
        if let Some(existing) = self
            .backend
            .list_operations(&self.config.cluster_name)?
            .into_iter()
            .find(|op| !op.state.is_terminal())
        {
            return Ok(existing);
        }
        let mut operation = Operation::new(
            &self.config.account_id,
            &self.config.cluster_name,
            OperationType::Install,
            &self.config.provider,
        );
        operation.servers = servers;
        self.backend.create_operation(&operation)?;
        Ok(operation)
    }

    /// Hub-initiated flow: replicate, establish trust back to the Hub,
    /// then poll until agents have registered and the operation is ready.
    async fn hub_initiated_operation(&self) -> Result<Operation> {
        let hub = self
            .hub
            .as_ref()
            .ok_or_else(|| EngineError::bad_parameter("Hub-initiated install requires a Hub client"))?;

        let request = ClusterCopyRequest {
            account_id: self.config.account_id.clone(),
            cluster_name: self.config.cluster_name.clone(),
            operation_id: String::new(),
            ops_url: self.config.remote_ops_url.clone().unwrap_or_default(),
            ops_token: self.config.ops_tunnel_token.clone().unwrap_or_default(),
        };
        let operation = replicate_cluster(&self.backend, &self.packages, hub, &request).await?;

        // local preflight against the replicated application
        AcceptingChecker
            .run(&crate::plan::OperationPlan {
                operation_id: operation.id.clone(),
                operation_type: operation.op_type,
                account_id: operation.account_id.clone(),
                cluster_name: operation.site_domain.clone(),
                servers: operation.servers.clone(),
                dns_config: Default::default(),
                phases: Vec::new(),
            })
            .await?;

        self.establish_hub_trust().await?;
        self.poll_until_ready(hub, &operation.key(), &operation.provisioner).await?;
        hub.start_operation(&operation.key()).await?;
        self.backend.get_operation(&operation.key())
    }

    /// Insert the `system` trusted cluster pointing back at the Hub, which
    /// opens the reverse tunnel the Hub uses to reach this installer.
    async fn establish_hub_trust(&self) -> Result<()> {
        let (Some(url), Some(token)) = (&self.config.remote_ops_url, &self.config.ops_tunnel_token) else {
            return Ok(());
        };
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or(url)
            .split(':')
            .next()
            .unwrap_or(url)
            .to_string();
        let mut cluster =
            TrustedCluster::new(&host, token, &format!("{host}:3024"), &format!("{host}:3023"));
        cluster.system = true;
        self.trust.upsert(cluster).await
    }

    async fn poll_until_ready(
        &self,
        hub: &HubClient,
        key: &OperationKey,
        provisioner: &str,
    ) -> Result<()> {
        loop {
            if provisioner == "aws" {
                // pick up the provisioner-driven server list
                let refreshed = hub.update_operation_state(key).await?;
                self.backend.upsert_operation(&refreshed)?;
            }
            let operation = hub.get_site_operation(key).await?;
            self.backend.upsert_operation(&operation)?;
            match operation.state {
                OperationState::Ready => return Ok(()),
                state if state.is_terminal() => {
                    return Err(EngineError::bad_parameter(format!(
                        "operation {} ended before deployment: {state}",
                        key.operation_id
                    )))
                }
                _ => tokio::time::sleep(READY_POLL_INTERVAL).await,
            }
        }
    }

    fn ensure_plan(&self, operation: &Operation) -> Result<()> {
        let key = operation.key();
        if self.backend.get_plan(&key).is_ok() {
            return Ok(());
        }
        let site = self.backend.get_site(&operation.site_domain)?;
        let manifest = AppManifest::new(site.app_package.clone());
        let mut builder = PlanBuilder::new(&site, operation, &manifest, &self.packages);
        builder.preflight_checks = self.config.preflight_checks;
        builder.remote_ops_url = self.config.remote_ops_url.clone();
        builder.ops_tunnel_token = self.config.ops_tunnel_token.clone();
        builder.agent_credentials = Some(AgentCredentials {
            url: self.agent_url("node").to_string(),
            token: self.access_token.clone(),
        });
        builder.wizard_cluster = Some({
            let mut wizard = TrustedCluster::new(
                &format!("wizard.{}", site.domain),
                &self.access_token,
                &format!("{}:{}", self.config.advertise_addr, self.config.agent_port),
                &format!("{}:{}", self.config.advertise_addr, self.config.agent_port),
            );
            wizard.wizard = true;
            wizard
        });
        let plan = builder.build()?;
        ok_if_exists(self.backend.create_plan(&key, &plan))
    }

    fn engine(&self, key: &OperationKey, router: AgentServer) -> FsmEngine {
        let services = PhaseServices {
            backend: self.backend.clone(),
            packages: self.packages.clone(),
            router: Arc::new(router),
            checker: Arc::new(AcceptingChecker),
            gate: Arc::new(AlwaysReadyGate),
            applier: Arc::new(BackendApplier::new(self.backend.clone())),
            trust: self.trust.clone(),
        };
        FsmEngine::new(
            self.backend.clone(),
            key.clone(),
            Arc::new(install_registry(services)),
            self.operator.clone(),
            self.config.fsm_config(),
        )
        .with_complete_hook(Arc::new(TeardownHook {
            trust: self.trust.clone(),
            backend: self.backend.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerRole;
    use crate::pack::Locator;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            state_dir: dir.to_path_buf(),
            cluster_name: "example.com".to_string(),
            app_package: Some(Locator::new("example.io", "app", "1.0.0")),
            agent_port: 0, // dynamic for tests
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn local_install_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(config(dir.path())).unwrap();
        let (_tx, rx) = watch::channel(false);
        let servers = vec![Server::new("node-1", "127.0.0.1", ServerRole::Master)];

        // per-server phases need a connected agent; run one in-process
        let install_task = {
            let installer_servers = servers.clone();
            async { installer.install(installer_servers, rx).await }
        };
        let agent_task = async {
            // wait for the agent server to come up on the dynamic port
            loop {
                if let Some(addr) = installer.agent_server_addr() {
                    let url = AgentUrl::new("127.0.0.1", addr.port(), "node", &installer.access_token);
                    let client = crate::agent::AgentClient::new(
                        url,
                        "agent-1",
                        "127.0.0.1",
                        Arc::new(crate::agent::LoggingRunner),
                    )
                    .unwrap();
                    let (_tx2, rx2) = watch::channel(false);
                    let _ = client.run(rx2).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };

        let result = tokio::select! {
            result = install_task => result,
            _ = agent_task => unreachable!("agent loop does not exit on its own"),
        };
        assert_eq!(result.unwrap(), FsmResult::Completed);

        let key = installer.last_operation_key().unwrap();
        let operation = installer.backend.get_operation(&key).unwrap();
        assert_eq!(operation.state, OperationState::InstallCompleted);
        let plan = installer.backend.get_plan(&key).unwrap();
        assert!(plan.has_phase("/masters/node-1/planet"));
    }

    #[tokio::test]
    async fn replayed_install_reuses_the_live_operation() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(config(dir.path())).unwrap();
        let servers = vec![Server::new("node-1", "127.0.0.1", ServerRole::Master)];
        let first = installer.create_local_operation(servers.clone()).unwrap();
        let second = installer.create_local_operation(servers).unwrap();
        assert_eq!(first.id, second.id);
    }
}
