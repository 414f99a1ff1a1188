//! Built-in phase executors and the registry wiring them to phase ids.
//!
//! Executors are deliberately thin. Per-server phases route through the
//! [`AgentRouter`] so the work happens on the target host; cluster-level
//! phases drive small pluggable seams (`PreflightChecker`, `ClusterGate`,
//! `ResourceApplier`, `TrustControl`) whose production implementations
//! belong to the respective collaborator crates. Everything an executor
//! writes is keyed so re-running it converges instead of duplicating.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::errors::{EngineError, Result};
use crate::fsm::{AgentRouter, ExecutorParams, ExecutorRegistry, PhaseExecutor};
use crate::model::{Server, TrustedCluster, SYSTEM_REPOSITORY};
use crate::pack::{Locator, PackageService};
use crate::plan::OperationPlan;

/// Fleet-wide preflight checks. The real checker lives with the host
/// inspection code; the default accepts everything.
#[async_trait]
pub trait PreflightChecker: Send + Sync {
    async fn run(&self, plan: &OperationPlan) -> Result<()>;
}

pub struct AcceptingChecker;

#[async_trait]
impl PreflightChecker for AcceptingChecker {
    async fn run(&self, plan: &OperationPlan) -> Result<()> {
        debug!(servers = plan.servers.len(), "preflight checks accepted");
        Ok(())
    }
}

/// Cluster readiness gates consulted by the `wait` and `health` phases.
#[async_trait]
pub trait ClusterGate: Send + Sync {
    async fn control_plane_ready(&self) -> Result<()>;
    async fn cluster_healthy(&self) -> Result<()>;
}

pub struct AlwaysReadyGate;

#[async_trait]
impl ClusterGate for AlwaysReadyGate {
    async fn control_plane_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn cluster_healthy(&self) -> Result<()> {
        Ok(())
    }
}

/// Applies named cluster resources (RBAC bundles, config maps, secrets,
/// app records). Keyed by `(kind, name)` so application is idempotent.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn apply(&self, kind: &str, name: &str, doc: serde_json::Value) -> Result<()>;
    async fn remove(&self, kind: &str, name: &str) -> Result<()>;
    async fn get(&self, kind: &str, name: &str) -> Result<Option<serde_json::Value>>;
}

/// Records applied resources in the backend. Stands in for the Kubernetes
/// client, which is out of the engine's scope.
pub struct BackendApplier {
    backend: Backend,
}

impl BackendApplier {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn kind_key(kind: &str) -> String {
        format!("applied:{kind}")
    }
}

#[async_trait]
impl ResourceApplier for BackendApplier {
    async fn apply(&self, kind: &str, name: &str, doc: serde_json::Value) -> Result<()> {
        self.backend.upsert_resource(&Self::kind_key(kind), name, &doc)
    }

    async fn remove(&self, kind: &str, name: &str) -> Result<()> {
        match self.backend.delete_resource(&Self::kind_key(kind), name) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Option<serde_json::Value>> {
        match self.backend.get_resource(&Self::kind_key(kind), name) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Installs and removes trusted clusters. Implemented by the trust manager;
/// the connect phases treat failures as fatal.
#[async_trait]
pub trait TrustControl: Send + Sync {
    async fn upsert(&self, cluster: TrustedCluster) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Collaborators shared by every built-in executor.
#[derive(Clone)]
pub struct PhaseServices {
    pub backend: Backend,
    pub packages: PackageService,
    pub router: Arc<dyn AgentRouter>,
    pub checker: Arc<dyn PreflightChecker>,
    pub gate: Arc<dyn ClusterGate>,
    pub applier: Arc<dyn ResourceApplier>,
    pub trust: Arc<dyn TrustControl>,
}

/// Build the registry covering every phase the plan builder emits.
pub fn install_registry(services: PhaseServices) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    let s = services;

    macro_rules! exact {
        ($id:expr, $make:expr) => {{
            let s = s.clone();
            registry.register_exact($id, Arc::new(move |_params| $make(&s)));
        }};
    }

    exact!("/checks", |s: &PhaseServices| Ok(
        Box::new(ChecksExecutor { checker: s.checker.clone() }) as Box<dyn PhaseExecutor>
    ));
    exact!("/decrypt", |s: &PhaseServices| Ok(Box::new(DecryptExecutor {
        applier: s.applier.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/configure", |s: &PhaseServices| Ok(Box::new(ConfigureExecutor {
        packages: s.packages.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/wait", |s: &PhaseServices| Ok(Box::new(WaitExecutor {
        gate: s.gate.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/health", |s: &PhaseServices| Ok(Box::new(HealthExecutor {
        gate: s.gate.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/rbac", |s: &PhaseServices| Ok(Box::new(ResourceExecutor {
        applier: s.applier.clone(),
        kind: "rbac",
        name: "base".into(),
        completion: 60,
    }) as Box<dyn PhaseExecutor>));
    exact!("/coredns", |s: &PhaseServices| Ok(Box::new(CorednsExecutor {
        applier: s.applier.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/openebs", |s: &PhaseServices| Ok(Box::new(ResourceExecutor {
        applier: s.applier.clone(),
        kind: "operator",
        name: "openebs".into(),
        completion: 60,
    }) as Box<dyn PhaseExecutor>));
    exact!("/system_resources", |s: &PhaseServices| Ok(Box::new(ResourceExecutor {
        applier: s.applier.clone(),
        kind: "resource",
        name: "system".into(),
        completion: 70,
    }) as Box<dyn PhaseExecutor>));
    exact!("/user_resources", |s: &PhaseServices| Ok(Box::new(ResourceExecutor {
        applier: s.applier.clone(),
        kind: "resource",
        name: "user".into(),
        completion: 70,
    }) as Box<dyn PhaseExecutor>));
    exact!("/gravity_resources", |s: &PhaseServices| Ok(Box::new(ResourceExecutor {
        applier: s.applier.clone(),
        kind: "resource",
        name: "cluster-image".into(),
        completion: 95,
    }) as Box<dyn PhaseExecutor>));
    exact!("/license", |s: &PhaseServices| Ok(Box::new(LicenseExecutor {
        applier: s.applier.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/runtime", |s: &PhaseServices| Ok(Box::new(AppExecutor {
        applier: s.applier.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/install_overlay", |s: &PhaseServices| Ok(Box::new(AppExecutor {
        applier: s.applier.clone(),
    }) as Box<dyn PhaseExecutor>));
    exact!("/connect_installer", |s: &PhaseServices| Ok(Box::new(ConnectExecutor {
        trust: s.trust.clone(),
        optional: true,
    }) as Box<dyn PhaseExecutor>));
    exact!("/connect", |s: &PhaseServices| Ok(Box::new(ConnectExecutor {
        trust: s.trust.clone(),
        optional: false,
    }) as Box<dyn PhaseExecutor>));
    exact!("/enable_election", |s: &PhaseServices| Ok(Box::new(RemoteExecutor {
        router: s.router.clone(),
    }) as Box<dyn PhaseExecutor>));

    for prefix in [
        "/bootstrap_selinux/",
        "/init/",
        "/bootstrap/",
        "/pull/",
        "/masters/",
        "/nodes/",
        "/export/",
    ] {
        let s = s.clone();
        registry.register_prefix(
            prefix,
            Arc::new(move |_params| {
                Ok(Box::new(RemoteExecutor {
                    router: s.router.clone(),
                }) as Box<dyn PhaseExecutor>)
            }),
        );
    }
    registry.register_prefix("/app/", {
        let s = s.clone();
        Arc::new(move |_params| {
            Ok(Box::new(AppExecutor {
                applier: s.applier.clone(),
            }) as Box<dyn PhaseExecutor>)
        })
    });
    registry
}

/// Routes a per-server phase to the agent on that server. `exec_server`
/// overrides where the step physically runs.
struct RemoteExecutor {
    router: Arc<dyn AgentRouter>,
}

impl RemoteExecutor {
    fn target(params: &ExecutorParams) -> Result<Server> {
        let data = params.data();
        data.exec_server
            .or(data.server)
            .ok_or_else(|| EngineError::bad_parameter(format!("phase {} names no server", params.phase.id)))
    }
}

#[async_trait]
impl PhaseExecutor for RemoteExecutor {
    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        let server = Self::target(params)?;
        params
            .progress
            .report(10, format!("Executing on {}", server.hostname))
            .await;
        self.router
            .execute_on(&server, &params.phase.id, &params.data())
            .await
    }

    async fn rollback(&self, params: &ExecutorParams) -> Result<()> {
        let server = Self::target(params)?;
        self.router
            .rollback_on(&server, &params.phase.id, &params.data())
            .await
    }
}

struct ChecksExecutor {
    checker: Arc<dyn PreflightChecker>,
}

#[async_trait]
impl PhaseExecutor for ChecksExecutor {
    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(5, "Running preflight checks").await;
        self.checker.run(&params.plan).await
    }
}

/// Records the package decryption key so pulls can open encrypted blobs.
struct DecryptExecutor {
    applier: Arc<dyn ResourceApplier>,
}

impl DecryptExecutor {
    fn key_doc(params: &ExecutorParams) -> Result<serde_json::Value> {
        let key = params
            .data()
            .data
            .ok_or_else(|| EngineError::bad_parameter("decrypt phase carries no key"))?;
        Ok(serde_json::json!({ "encryption_key": key }))
    }
}

#[async_trait]
impl PhaseExecutor for DecryptExecutor {
    async fn pre_check(&self, params: &ExecutorParams) -> Result<bool> {
        let expected = Self::key_doc(params)?;
        Ok(self.applier.get("secret", "package-decryption-key").await? == Some(expected))
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(8, "Configuring package decryption").await;
        self.applier
            .apply("secret", "package-decryption-key", Self::key_doc(params)?)
            .await
    }

    async fn rollback(&self, _params: &ExecutorParams) -> Result<()> {
        self.applier.remove("secret", "package-decryption-key").await
    }
}

/// Emits one runtime-configuration package per server.
struct ConfigureExecutor {
    packages: PackageService,
}

impl ConfigureExecutor {
    fn locator(plan: &OperationPlan, server: &Server) -> Locator {
        Locator::new(
            SYSTEM_REPOSITORY,
            &format!("config-{}", server.hostname),
            &plan.operation_id,
        )
    }
}

#[async_trait]
impl PhaseExecutor for ConfigureExecutor {
    async fn pre_check(&self, params: &ExecutorParams) -> Result<bool> {
        for server in &params.plan.servers {
            match self.packages.read_envelope(&Self::locator(&params.plan, server)) {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(!params.plan.servers.is_empty())
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(15, "Generating node configuration").await;
        for server in &params.plan.servers {
            let config = serde_json::json!({
                "hostname": server.hostname,
                "advertise_ip": server.advertise_ip,
                "role": server.role,
                "dns": params.plan.dns_config,
            });
            self.packages.upsert_package(
                &Self::locator(&params.plan, server),
                &serde_json::to_vec(&config)?,
                false,
            )?;
        }
        Ok(())
    }

    async fn post_check(&self, params: &ExecutorParams) -> Result<()> {
        for server in &params.plan.servers {
            self.packages.read_envelope(&Self::locator(&params.plan, server))?;
        }
        Ok(())
    }
}

struct WaitExecutor {
    gate: Arc<dyn ClusterGate>,
}

#[async_trait]
impl PhaseExecutor for WaitExecutor {
    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(50, "Waiting for the control plane").await;
        self.gate.control_plane_ready().await
    }
}

struct HealthExecutor {
    gate: Arc<dyn ClusterGate>,
}

#[async_trait]
impl PhaseExecutor for HealthExecutor {
    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(80, "Waiting for the cluster to become healthy").await;
        self.gate.cluster_healthy().await
    }
}

/// Applies one named resource document; rollback removes it.
struct ResourceExecutor {
    applier: Arc<dyn ResourceApplier>,
    kind: &'static str,
    name: String,
    completion: u8,
}

#[async_trait]
impl PhaseExecutor for ResourceExecutor {
    async fn pre_check(&self, _params: &ExecutorParams) -> Result<bool> {
        Ok(self.applier.get(self.kind, &self.name).await?.is_some())
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params
            .progress
            .report(self.completion, format!("Applying {} {}", self.kind, self.name))
            .await;
        let doc = params
            .data()
            .data
            .map(serde_json::Value::String)
            .unwrap_or_else(|| serde_json::json!({ "phase": params.phase.id }));
        self.applier.apply(self.kind, &self.name, doc).await
    }

    async fn rollback(&self, _params: &ExecutorParams) -> Result<()> {
        self.applier.remove(self.kind, &self.name).await
    }
}

/// Writes the cluster DNS configuration consumed by the in-cluster DNS.
struct CorednsExecutor {
    applier: Arc<dyn ResourceApplier>,
}

#[async_trait]
impl PhaseExecutor for CorednsExecutor {
    async fn pre_check(&self, _params: &ExecutorParams) -> Result<bool> {
        Ok(self.applier.get("configmap", "coredns").await?.is_some())
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        params.progress.report(60, "Configuring cluster DNS").await;
        let doc = serde_json::json!({
            "addrs": params.plan.dns_config.addrs,
            "port": params.plan.dns_config.port,
        });
        self.applier.apply("configmap", "coredns", doc).await
    }

    async fn rollback(&self, _params: &ExecutorParams) -> Result<()> {
        self.applier.remove("configmap", "coredns").await
    }
}

/// Installs the cluster license as a secret.
struct LicenseExecutor {
    applier: Arc<dyn ResourceApplier>,
}

#[async_trait]
impl PhaseExecutor for LicenseExecutor {
    async fn pre_check(&self, _params: &ExecutorParams) -> Result<bool> {
        Ok(self.applier.get("secret", "license").await?.is_some())
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        let license = params
            .data()
            .license
            .ok_or_else(|| EngineError::bad_parameter("license phase carries no license"))?;
        params.progress.report(70, "Installing the cluster license").await;
        self.applier
            .apply("secret", "license", serde_json::json!({ "license": license }))
            .await
    }

    async fn rollback(&self, _params: &ExecutorParams) -> Result<()> {
        self.applier.remove("secret", "license").await
    }
}

/// Installs an application (runtime, dependency or user app).
struct AppExecutor {
    applier: Arc<dyn ResourceApplier>,
}

impl AppExecutor {
    fn app(params: &ExecutorParams) -> Result<Locator> {
        params
            .data()
            .install
            .map(|spec| spec.app)
            .ok_or_else(|| EngineError::bad_parameter(format!("phase {} names no application", params.phase.id)))
    }
}

#[async_trait]
impl PhaseExecutor for AppExecutor {
    async fn pre_check(&self, params: &ExecutorParams) -> Result<bool> {
        let app = Self::app(params)?;
        Ok(self.applier.get("app", &app.to_string()).await?.is_some())
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        let app = Self::app(params)?;
        params.progress.report(85, format!("Installing application {app}")).await;
        self.applier
            .apply("app", &app.to_string(), serde_json::json!({ "installed": true }))
            .await
    }

    async fn rollback(&self, params: &ExecutorParams) -> Result<()> {
        let app = Self::app(params)?;
        self.applier.remove("app", &app.to_string()).await
    }
}

/// Installs a trusted cluster. Trust establishment failures are fatal to
/// the operation, never downgraded to warnings.
struct ConnectExecutor {
    trust: Arc<dyn TrustControl>,
    /// The installer-trust phase tolerates a missing cluster definition
    /// (nothing to connect); the Hub phase does not.
    optional: bool,
}

#[async_trait]
impl PhaseExecutor for ConnectExecutor {
    async fn execute(&self, params: &ExecutorParams) -> Result<()> {
        let Some(cluster) = params.data().trusted_cluster else {
            if self.optional {
                info!(phase = %params.phase.id, "no trusted cluster to install");
                return Ok(());
            }
            return Err(EngineError::bad_parameter(format!(
                "phase {} carries no trusted cluster",
                params.phase.id
            )));
        };
        params
            .progress
            .report(90, format!("Connecting to {}", cluster.name))
            .await;
        self.trust.upsert(cluster).await
    }

    async fn rollback(&self, params: &ExecutorParams) -> Result<()> {
        match params.data().trusted_cluster {
            Some(cluster) => self.trust.delete(&cluster.name).await,
            None => Ok(()),
        }
    }
}
