//! Compiles a cluster, operation, manifest and server fleet into an
//! executable operation plan.
//!
//! The builder decides which phases exist, what data they carry, and how
//! they depend on each other. Conditional phases (preflight checks, package
//! decryption, license installation, Hub federation) appear only when their
//! precondition holds; dependency edges are added with require-if-present
//! semantics so a missing conditional phase never dangles an edge.

use crate::errors::{EngineError, Result};
use crate::model::{
    License, Operation, Server, Site, TrustedCluster, SYSTEM_REPOSITORY, TRUSTED_CLUSTER_PACKAGE,
};
use crate::pack::{Locator, PackageService};
use crate::plan::{
    AgentCredentials, InstallSpec, OperationPhase, OperationPlan, PhaseData, PullSpec,
};

const NO_REQUIRES: &[&str] = &[];

/// The slice of the application manifest the plan builder consumes. Full
/// manifest parsing and validation belong to the application layer; the
/// builder only needs locators and feature switches.
#[derive(Debug, Clone)]
pub struct AppManifest {
    /// The user application.
    pub app: Locator,
    /// The runtime application installed before any user app.
    pub runtime: Locator,
    /// System packages installed on every master.
    pub teleport: Locator,
    pub planet: Locator,
    /// Dependency applications, installed in order before `app`.
    pub dependencies: Vec<Locator>,
    pub selinux: bool,
    pub openebs: bool,
    /// Whether the app ships a network overlay hook.
    pub overlay: bool,
    /// Whether the operator supplied extra Kubernetes resources.
    pub user_resources: bool,
}

impl AppManifest {
    pub fn new(app: Locator) -> Self {
        Self {
            app,
            runtime: Locator::new(SYSTEM_REPOSITORY, "runtime", "0.0.0+latest"),
            teleport: Locator::new(SYSTEM_REPOSITORY, "teleport", "0.0.0+latest"),
            planet: Locator::new(SYSTEM_REPOSITORY, "planet", "0.0.0+latest"),
            dependencies: Vec::new(),
            selinux: true,
            openebs: false,
            overlay: false,
            user_resources: false,
        }
    }
}

/// Everything the builder needs to compile a plan.
pub struct PlanBuilder<'a> {
    pub site: &'a Site,
    pub operation: &'a Operation,
    pub manifest: &'a AppManifest,
    pub packages: &'a PackageService,
    /// Preflight checks can be disabled by the operator.
    pub preflight_checks: bool,
    /// Credentials joining agents use to reach the installer.
    pub agent_credentials: Option<AgentCredentials>,
    /// Trust link describing the installer process itself.
    pub wizard_cluster: Option<TrustedCluster>,
    /// Hub address and token supplied on the command line, the first stop
    /// of trusted-cluster resolution.
    pub remote_ops_url: Option<String>,
    pub ops_tunnel_token: Option<String>,
    /// Serialized extra resources applied at the end of the plan.
    pub gravity_resources: Option<String>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        site: &'a Site,
        operation: &'a Operation,
        manifest: &'a AppManifest,
        packages: &'a PackageService,
    ) -> Self {
        Self {
            site,
            operation,
            manifest,
            packages,
            preflight_checks: true,
            agent_credentials: None,
            wizard_cluster: None,
            remote_ops_url: None,
            ops_tunnel_token: None,
            gravity_resources: None,
        }
    }

    pub fn build(&self) -> Result<OperationPlan> {
        use crate::model::OperationType;
        let mut plan = OperationPlan {
            operation_id: self.operation.id.clone(),
            operation_type: self.operation.op_type,
            account_id: self.operation.account_id.clone(),
            cluster_name: self.site.domain.clone(),
            servers: self.operation.servers.clone(),
            dns_config: self.site.dns_config.clone(),
            phases: Vec::new(),
        };
        match self.operation.op_type {
            OperationType::Install => self.add_install_phases(&mut plan)?,
            OperationType::Expand => self.add_expand_phases(&mut plan)?,
            other => {
                return Err(EngineError::bad_parameter(format!(
                    "no plan builder for {other} operations"
                )))
            }
        }
        for (step, phase) in plan.phases.iter_mut().enumerate() {
            phase.step = step as i32;
        }
        plan.validate()?;
        Ok(plan)
    }

    fn add_install_phases(&self, plan: &mut OperationPlan) -> Result<()> {
        let servers = &self.operation.servers;
        if servers.is_empty() {
            return Err(EngineError::bad_parameter("install requires at least one server"));
        }
        let masters: Vec<&Server> = servers.iter().filter(|s| s.role.is_master()).collect();
        let workers: Vec<&Server> = servers.iter().filter(|s| !s.role.is_master()).collect();
        if masters.is_empty() {
            return Err(EngineError::bad_parameter("install requires at least one master"));
        }

        if self.manifest.selinux {
            plan.phases.push(self.per_server_group(
                "/bootstrap_selinux",
                "Configure SELinux on all servers",
                servers.iter().collect(),
                |server| PhaseData {
                    server: Some(server.clone()),
                    ..Default::default()
                },
                NO_REQUIRES,
            ));
        }

        plan.phases.push(self.per_server_group(
            "/init",
            "Create state directories and the service user",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                service_user: Some(self.site.service_user.clone()),
                ..Default::default()
            },
            NO_REQUIRES,
        ));

        if self.preflight_checks {
            plan.phases.push(
                OperationPhase::new("/checks")
                    .with_description("Run preflight checks across the fleet")
                    .with_requires(&require_if_present(plan, &["/init"])),
            );
        }

        if self.packages.repository_has_encrypted(SYSTEM_REPOSITORY)? {
            let raw = self
                .site
                .license
                .as_deref()
                .ok_or_else(|| EngineError::bad_parameter("encrypted packages require a license"))?;
            let key = License::parse(raw)?.encryption_key()?.to_string();
            plan.phases.push(
                OperationPhase::new("/decrypt")
                    .with_description("Supply the package decryption key")
                    .with_data(PhaseData {
                        license: self.site.license.clone(),
                        data: Some(key),
                        ..Default::default()
                    })
                    .with_requires(&require_if_present(plan, &["/init", "/checks"])),
            );
        }

        plan.phases.push(
            OperationPhase::new("/configure")
                .with_description("Generate per-node runtime configuration")
                .with_requires(&require_if_present(plan, &["/init", "/checks", "/decrypt"])),
        );

        plan.phases.push(self.per_server_group(
            "/bootstrap",
            "Install service user and agent credentials",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                service_user: Some(self.site.service_user.clone()),
                agent: self.agent_credentials.clone(),
                ..Default::default()
            },
            &["/configure"],
        ));

        plan.phases.push(self.per_server_group(
            "/pull",
            "Pull packages onto every server",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                pull: Some(self.pull_spec(server)),
                ..Default::default()
            },
            &["/configure", "/bootstrap"],
        ));

        // per-master subtree: system packages install sequentially on each
        // master, masters proceed in parallel
        let master_phases: Vec<OperationPhase> = masters
            .iter()
            .map(|server| {
                OperationPhase::new(&format!("/masters/{}", server.hostname)).with_children(vec![
                    OperationPhase::new(&format!("/masters/{}/teleport", server.hostname)).with_data(
                        PhaseData {
                            server: Some((*server).clone()),
                            package: Some(self.manifest.teleport.clone()),
                            ..Default::default()
                        },
                    ),
                    OperationPhase::new(&format!("/masters/{}/planet", server.hostname)).with_data(
                        PhaseData {
                            server: Some((*server).clone()),
                            package: Some(self.manifest.planet.clone()),
                            ..Default::default()
                        },
                    ),
                ])
            })
            .collect();
        plan.phases.push(
            OperationPhase::new("/masters")
                .with_description("Install system software on master nodes")
                .with_parallel(true)
                .with_children(master_phases)
                .with_requires(&["/pull"]),
        );

        if !workers.is_empty() {
            plan.phases.push(self.per_server_group(
                "/nodes",
                "Install system software on worker nodes",
                workers.clone(),
                |server| PhaseData {
                    server: Some(server.clone()),
                    package: Some(self.manifest.planet.clone()),
                    ..Default::default()
                },
                &["/pull"],
            ));
        }

        plan.phases.push(
            OperationPhase::new("/wait")
                .with_description("Wait for the control plane to come up")
                .with_requires(&require_if_present(plan, &["/masters", "/nodes"])),
        );
        plan.phases.push(
            OperationPhase::new("/rbac")
                .with_description("Apply base RBAC resources")
                .with_requires(&["/wait"]),
        );
        plan.phases.push(
            OperationPhase::new("/coredns")
                .with_description("Configure cluster DNS")
                .with_requires(&["/wait"]),
        );
        if self.manifest.openebs {
            plan.phases.push(
                OperationPhase::new("/openebs")
                    .with_description("Bootstrap the storage operator")
                    .with_requires(&["/wait"]),
            );
        }
        plan.phases.push(
            OperationPhase::new("/system_resources")
                .with_description("Apply the cluster resource bundle")
                .with_requires(&["/rbac"]),
        );
        if self.manifest.user_resources {
            plan.phases.push(
                OperationPhase::new("/user_resources")
                    .with_description("Apply user-supplied resources")
                    .with_requires(&["/rbac"]),
            );
        }
        if let Some(license) = &self.site.license {
            plan.phases.push(
                OperationPhase::new("/license")
                    .with_description("Install the cluster license")
                    .with_data(PhaseData {
                        license: Some(license.clone()),
                        ..Default::default()
                    })
                    .with_requires(&["/rbac"]),
            );
        }

        plan.phases.push(self.per_server_group(
            "/export",
            "Push application images to the in-cluster registry",
            masters.clone(),
            |server| PhaseData {
                server: Some(server.clone()),
                ..Default::default()
            },
            &["/wait"],
        ));

        if self.manifest.overlay {
            plan.phases.push(
                OperationPhase::new("/install_overlay")
                    .with_description("Run the network overlay hook")
                    .with_data(PhaseData {
                        install: Some(InstallSpec {
                            app: self.manifest.app.clone(),
                        }),
                        ..Default::default()
                    })
                    .with_requires(&["/export"]),
            );
        }
        plan.phases.push(
            OperationPhase::new("/health")
                .with_description("Wait for the cluster to pass health checks")
                .with_requires(&require_if_present(plan, &["/install_overlay", "/export"])),
        );
        plan.phases.push(
            OperationPhase::new("/runtime")
                .with_description("Install the runtime application")
                .with_data(PhaseData {
                    install: Some(InstallSpec {
                        app: self.manifest.runtime.clone(),
                    }),
                    ..Default::default()
                })
                .with_requires(&["/rbac"]),
        );

        // dependency apps in manifest order, the user app last
        let mut app_children: Vec<OperationPhase> = self
            .manifest
            .dependencies
            .iter()
            .map(|dep| {
                OperationPhase::new(&format!("/app/{}", dep.name)).with_data(PhaseData {
                    install: Some(InstallSpec { app: dep.clone() }),
                    ..Default::default()
                })
            })
            .collect();
        app_children.push(
            OperationPhase::new(&format!("/app/{}", self.manifest.app.name)).with_data(PhaseData {
                install: Some(InstallSpec {
                    app: self.manifest.app.clone(),
                }),
                ..Default::default()
            }),
        );
        plan.phases.push(
            OperationPhase::new("/app")
                .with_description("Install applications in dependency order")
                .with_children(app_children)
                .with_requires(&["/runtime"]),
        );

        plan.phases.push(
            OperationPhase::new("/connect_installer")
                .with_description("Establish trust with the installer")
                .with_data(PhaseData {
                    trusted_cluster: self.wizard_cluster.clone(),
                    ..Default::default()
                })
                .with_requires(&["/runtime"]),
        );
        if let Some(cluster) = self.resolve_trusted_cluster()? {
            plan.phases.push(
                OperationPhase::new("/connect")
                    .with_description("Establish trust with the Hub")
                    .with_data(PhaseData {
                        trusted_cluster: Some(cluster),
                        ..Default::default()
                    })
                    .with_requires(&["/runtime"]),
            );
        }
        plan.phases.push(
            OperationPhase::new("/enable_election")
                .with_description("Resume leader election among masters")
                .with_data(PhaseData {
                    server: masters.first().map(|s| (*s).clone()),
                    ..Default::default()
                })
                .with_requires(&["/app"]),
        );
        if let Some(resources) = &self.gravity_resources {
            plan.phases.push(
                OperationPhase::new("/gravity_resources")
                    .with_description("Apply cluster-image resources")
                    .with_data(PhaseData {
                        data: Some(resources.clone()),
                        ..Default::default()
                    })
                    .with_requires(&require_if_present(plan, &["/health", "/enable_election"])),
            );
        }
        Ok(())
    }

    /// Expand plans bring one or more joining servers into a running
    /// cluster: prepare the host, pull packages, install system software.
    fn add_expand_phases(&self, plan: &mut OperationPlan) -> Result<()> {
        let servers = &self.operation.servers;
        if servers.is_empty() {
            return Err(EngineError::bad_parameter("expand requires at least one joining server"));
        }

        plan.phases.push(self.per_server_group(
            "/init",
            "Prepare joining servers",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                service_user: Some(self.site.service_user.clone()),
                ..Default::default()
            },
            NO_REQUIRES,
        ));
        if self.preflight_checks {
            plan.phases.push(
                OperationPhase::new("/checks")
                    .with_description("Run preflight checks on joining servers")
                    .with_requires(&["/init"]),
            );
        }
        plan.phases.push(self.per_server_group(
            "/bootstrap",
            "Install service user and agent credentials",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                service_user: Some(self.site.service_user.clone()),
                agent: self.agent_credentials.clone(),
                ..Default::default()
            },
            &require_if_present(plan, &["/init", "/checks"]),
        ));
        plan.phases.push(self.per_server_group(
            "/pull",
            "Pull packages onto joining servers",
            servers.iter().collect(),
            |server| PhaseData {
                server: Some(server.clone()),
                pull: Some(self.pull_spec(server)),
                ..Default::default()
            },
            &["/bootstrap"],
        ));

        let masters: Vec<&Server> = servers.iter().filter(|s| s.role.is_master()).collect();
        let workers: Vec<&Server> = servers.iter().filter(|s| !s.role.is_master()).collect();
        if !masters.is_empty() {
            plan.phases.push(self.per_server_group(
                "/masters",
                "Install system software on joining masters",
                masters,
                |server| PhaseData {
                    server: Some(server.clone()),
                    package: Some(self.manifest.planet.clone()),
                    ..Default::default()
                },
                &["/pull"],
            ));
        }
        if !workers.is_empty() {
            plan.phases.push(self.per_server_group(
                "/nodes",
                "Install system software on joining workers",
                workers,
                |server| PhaseData {
                    server: Some(server.clone()),
                    package: Some(self.manifest.planet.clone()),
                    ..Default::default()
                },
                &["/pull"],
            ));
        }
        plan.phases.push(
            OperationPhase::new("/wait")
                .with_description("Wait for joining servers to become healthy")
                .with_requires(&require_if_present(plan, &["/masters", "/nodes"])),
        );
        Ok(())
    }

    fn per_server_group<F, S>(
        &self,
        id: &str,
        description: &str,
        servers: Vec<&Server>,
        data: F,
        requires: &[S],
    ) -> OperationPhase
    where
        F: Fn(&Server) -> PhaseData,
        S: AsRef<str>,
    {
        let children = servers
            .into_iter()
            .map(|server| {
                OperationPhase::new(&format!("{id}/{}", server.hostname)).with_data(data(server))
            })
            .collect();
        OperationPhase::new(id)
            .with_description(description)
            .with_parallel(true)
            .with_children(children)
            .with_requires(requires)
    }

    /// Masters pull the full application; workers pull the minimal runtime
    /// set.
    fn pull_spec(&self, server: &Server) -> PullSpec {
        if server.role.is_master() {
            PullSpec {
                packages: vec![
                    self.manifest.planet.clone(),
                    self.manifest.teleport.clone(),
                    self.manifest.runtime.clone(),
                    self.site.app_package.clone(),
                ],
                minimal: false,
            }
        } else {
            PullSpec {
                packages: vec![self.manifest.planet.clone()],
                minimal: true,
            }
        }
    }

    /// A `connect` phase is emitted iff a Hub trusted cluster is
    /// discoverable: first from the command-line flags, then from the
    /// trusted-cluster package bundled in the installer tarball.
    fn resolve_trusted_cluster(&self) -> Result<Option<TrustedCluster>> {
        if let (Some(url), Some(token)) = (&self.remote_ops_url, &self.ops_tunnel_token) {
            let host = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or(url);
            let name = host.split(':').next().unwrap_or(host);
            let mut cluster =
                TrustedCluster::new(name, token, &format!("{host}:3024"), &format!("{host}:3023"));
            cluster.pull_updates = true;
            return Ok(Some(cluster));
        }
        for version in ["0.0.1", "0.0.0+latest"] {
            let locator = Locator::new(SYSTEM_REPOSITORY, TRUSTED_CLUSTER_PACKAGE, version);
            match self.packages.read_package(&locator) {
                Ok((_, data)) => {
                    let cluster: TrustedCluster = serde_json::from_slice(&data)?;
                    return Ok(Some(cluster));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Keep only the requirement ids that actually exist in the plan so
/// conditional phases never produce dangling edges.
fn require_if_present(plan: &OperationPlan, ids: &[&str]) -> Vec<String> {
    ids.iter()
        .filter(|id| plan.has_phase(id))
        .map(|id| id.to_string())
        .collect()
}
