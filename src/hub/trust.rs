//! Trusted-cluster lifecycle: how a cluster connects to and disconnects
//! from a Hub.
//!
//! Storing an enabled trusted cluster is what opens the reverse tunnel;
//! the transport itself is behind [`ReverseTunnel`]. Hub-side mirror
//! bookkeeping happens through [`HubHandshake`]: fatal when establishing
//! trust, best-effort when tearing it down.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::api::{AcceptRemoteClusterRequest, RemoveRemoteClusterRequest};
use crate::backend::Backend;
use crate::errors::{EngineError, Result};
use crate::fsm::executors::TrustControl;
use crate::hub::{HubClient, UpdateLoop};
use crate::model::TrustedCluster;
use crate::pack::{ca_locator, PackageService};
use crate::plan::AgentCredentials;

/// Default polling interval when updates are enabled without an explicit
/// interval.
const DEFAULT_UPDATE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Opens and closes the reverse tunnel behind a trust record. The real
/// implementation lives with the transport layer.
pub trait ReverseTunnel: Send + Sync {
    fn open(&self, cluster: &TrustedCluster) -> Result<()>;
    fn close(&self, name: &str) -> Result<()>;
}

pub struct LoggingTunnel;

impl ReverseTunnel for LoggingTunnel {
    fn open(&self, cluster: &TrustedCluster) -> Result<()> {
        info!(cluster = %cluster.name, tunnel = %cluster.reverse_tunnel_address, "reverse tunnel opened");
        Ok(())
    }

    fn close(&self, name: &str) -> Result<()> {
        info!(cluster = %name, "reverse tunnel closed");
        Ok(())
    }
}

/// Hub-side mirror bookkeeping for a connecting cluster.
#[async_trait]
pub trait HubHandshake: Send + Sync {
    async fn accept(&self, cluster: &TrustedCluster) -> Result<()>;
    async fn remove(&self, cluster: &TrustedCluster) -> Result<()>;
}

/// Performs the handshake against the Hub's portal API, assembling the
/// mirror entry (agent credentials, CA package, install-operation copy)
/// from local state.
pub struct PortalHandshake {
    backend: Backend,
    packages: PackageService,
    account_id: String,
    local_domain: String,
}

impl PortalHandshake {
    pub fn new(backend: Backend, packages: PackageService, account_id: &str, local_domain: &str) -> Self {
        Self {
            backend,
            packages,
            account_id: account_id.to_string(),
            local_domain: local_domain.to_string(),
        }
    }
}

#[async_trait]
impl HubHandshake for PortalHandshake {
    async fn accept(&self, cluster: &TrustedCluster) -> Result<()> {
        let site = self.backend.get_site(&self.local_domain)?;
        let install_operation = self
            .backend
            .list_operations(&self.local_domain)?
            .into_iter()
            .find(|op| op.op_type == crate::model::OperationType::Install);
        let ca_package = match self.packages.read_package(&ca_locator(&self.local_domain)) {
            Ok((_, data)) => data,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let request = AcceptRemoteClusterRequest {
            account_id: self.account_id.clone(),
            site,
            agent: AgentCredentials {
                url: format!("agent://{}:3012/cluster", self.local_domain),
                token: cluster.token.clone(),
            },
            ca_package,
            install_operation,
        };
        let client = HubClient::new(&format!("https://{}", cluster.proxy_address), &cluster.token)?;
        client.accept_remote_cluster(&request).await?;
        Ok(())
    }

    async fn remove(&self, cluster: &TrustedCluster) -> Result<()> {
        let client = HubClient::new(&format!("https://{}", cluster.proxy_address), &cluster.token)?;
        client
            .remove_remote_cluster(&RemoveRemoteClusterRequest {
                account_id: self.account_id.clone(),
                site_domain: self.local_domain.clone(),
            })
            .await?;
        Ok(())
    }
}

/// Drives upserts and deletes of trust records with their side effects:
/// tunnel, audit events, periodic updates, Hub mirror.
pub struct TrustManager {
    backend: Backend,
    tunnel: Arc<dyn ReverseTunnel>,
    updates: UpdateLoop,
    handshake: Arc<dyn HubHandshake>,
    local_domain: String,
    /// The installer process may connect to a Hub named like the cluster
    /// it is creating.
    wizard_mode: bool,
}

impl TrustManager {
    pub fn new(
        backend: Backend,
        tunnel: Arc<dyn ReverseTunnel>,
        updates: UpdateLoop,
        handshake: Arc<dyn HubHandshake>,
        local_domain: &str,
    ) -> Self {
        Self {
            backend,
            tunnel,
            updates,
            handshake,
            local_domain: local_domain.to_string(),
            wizard_mode: false,
        }
    }

    pub fn with_wizard_mode(mut self, wizard_mode: bool) -> Self {
        self.wizard_mode = wizard_mode;
        self
    }

    fn is_regular(cluster: &TrustedCluster) -> bool {
        !cluster.system && !cluster.wizard
    }

    pub async fn upsert(&self, cluster: TrustedCluster) -> Result<()> {
        cluster.check()?;
        if cluster.name == self.local_domain && !self.wizard_mode {
            return Err(EngineError::bad_parameter(format!(
                "cannot connect to a Hub with the same name as this cluster ({})",
                cluster.name
            )));
        }

        let mut previous: Option<TrustedCluster> = None;
        for existing in self.backend.list_trusted_clusters()? {
            if existing.name == cluster.name {
                previous = Some(existing);
            } else if Self::is_regular(&existing) && Self::is_regular(&cluster) {
                // one Hub at a time
                return Err(EngineError::already_exists(format!(
                    "already connected to Hub (Ops Center) {}",
                    existing.name
                )));
            }
        }

        if let Some(previous) = &previous {
            previous.can_change_state_to(&cluster)?;
            if *previous == cluster {
                // idempotent upsert: no side effects, no repeated audits
                return Ok(());
            }
        }

        self.configure_access(&cluster, previous.as_ref())?;
        self.configure_updates(&cluster)?;

        if Self::is_regular(&cluster) {
            // core trust establishment is fatal, unlike the mirroring of
            // progress and logs
            self.handshake.accept(&cluster).await?;
        }
        Ok(())
    }

    /// Write the trust record and reconcile the tunnel, emitting the
    /// remote-support audit events for regular clusters.
    fn configure_access(&self, cluster: &TrustedCluster, previous: Option<&TrustedCluster>) -> Result<()> {
        self.backend.upsert_trusted_cluster(cluster)?;
        if cluster.enabled {
            self.tunnel.open(cluster)?;
        } else {
            self.tunnel.close(&cluster.name)?;
        }

        let enabled_changed = previous.map_or(true, |p| p.enabled != cluster.enabled);
        if Self::is_regular(cluster) && enabled_changed {
            let event = if cluster.enabled {
                "remote_support_enabled"
            } else {
                "remote_support_disabled"
            };
            self.backend
                .append_audit_event(event, serde_json::json!({ "cluster": cluster.name }))?;
        }
        Ok(())
    }

    fn configure_updates(&self, cluster: &TrustedCluster) -> Result<()> {
        if cluster.system || cluster.wizard {
            return Ok(());
        }
        if cluster.pull_updates && cluster.enabled {
            let interval = match self.backend.get_site(&self.local_domain) {
                Ok(site) if site.update_interval_secs > 0 => {
                    std::time::Duration::from_secs(site.update_interval_secs)
                }
                _ => DEFAULT_UPDATE_INTERVAL,
            };
            self.updates.enable(&self.local_domain, interval)?;
        } else {
            self.updates.disable(&self.local_domain).or_else(|e| {
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        Ok(())
    }

    /// Delete a trust record. A positive `delay` leaves the record (and
    /// its tunnel) alive until the TTL lapses.
    pub async fn delete(&self, name: &str, delay: Option<std::time::Duration>) -> Result<()> {
        let cluster = self.backend.get_trusted_cluster(name)?;

        if Self::is_regular(&cluster) {
            self.updates.stop(&self.local_domain);
        }

        match delay {
            Some(delay) if !delay.is_zero() => {
                let when = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|e| EngineError::bad_parameter(format!("bad delay: {e}")))?;
                info!(cluster = %name, ?delay, "trusted cluster scheduled for removal");
                self.backend.expire_trusted_cluster(name, when)?;
            }
            _ => {
                self.backend.delete_trusted_cluster(name)?;
                self.tunnel.close(name)?;
            }
        }

        if Self::is_regular(&cluster) {
            // best effort: the Hub may already be unreachable
            if let Err(e) = self.handshake.remove(&cluster).await {
                warn!(cluster = %name, error = %e, "failed to remove remote cluster mirror");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TrustControl for TrustManager {
    async fn upsert(&self, cluster: TrustedCluster) -> Result<()> {
        TrustManager::upsert(self, cluster).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        TrustManager::delete(self, name, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Db;
    use crate::hub::updates::LoggingSync;
    use crate::model::Site;
    use crate::pack::Locator;
    use std::sync::Mutex;

    struct RecordingTunnel {
        events: Mutex<Vec<String>>,
    }

    impl ReverseTunnel for RecordingTunnel {
        fn open(&self, cluster: &TrustedCluster) -> Result<()> {
            self.events.lock().unwrap().push(format!("open {}", cluster.name));
            Ok(())
        }

        fn close(&self, name: &str) -> Result<()> {
            self.events.lock().unwrap().push(format!("close {name}"));
            Ok(())
        }
    }

    struct RecordingHandshake {
        accepted: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl HubHandshake for RecordingHandshake {
        async fn accept(&self, cluster: &TrustedCluster) -> Result<()> {
            if self.fail {
                return Err(EngineError::connection_problem("hub unreachable"));
            }
            self.accepted.lock().unwrap().push(cluster.name.clone());
            Ok(())
        }

        async fn remove(&self, _cluster: &TrustedCluster) -> Result<()> {
            if self.fail {
                return Err(EngineError::connection_problem("hub unreachable"));
            }
            Ok(())
        }
    }

    struct Fixture {
        backend: Backend,
        tunnel: Arc<RecordingTunnel>,
        handshake: Arc<RecordingHandshake>,
    }

    struct NoUpdates;

    #[async_trait]
    impl crate::hub::updates::UpdateRemote for NoUpdates {
        async fn check_for_update(&self, _a: &str, _d: &str) -> Result<Option<Locator>> {
            Ok(None)
        }

        async fn download(&self, locator: &Locator) -> Result<crate::api::PackageDocument> {
            Err(EngineError::not_found(locator.to_string()))
        }
    }

    fn manager(fail_handshake: bool) -> (Fixture, TrustManager) {
        let backend = Backend::new(Db::in_memory().unwrap());
        backend
            .create_site(&Site::new(
                "acc",
                "example.com",
                Locator::new("example.io", "app", "1.0.0"),
                "onprem",
            ))
            .unwrap();
        let tunnel = Arc::new(RecordingTunnel {
            events: Mutex::new(Vec::new()),
        });
        let handshake = Arc::new(RecordingHandshake {
            accepted: Mutex::new(Vec::new()),
            fail: fail_handshake,
        });
        let updates = UpdateLoop::new(
            backend.clone(),
            PackageService::new(backend.db().clone()),
            Arc::new(NoUpdates),
            Arc::new(LoggingSync),
        );
        let manager = TrustManager::new(
            backend.clone(),
            tunnel.clone(),
            updates,
            handshake.clone(),
            "example.com",
        );
        (
            Fixture {
                backend,
                tunnel,
                handshake,
            },
            manager,
        )
    }

    fn hub_cluster() -> TrustedCluster {
        TrustedCluster::new("hub.example.io", "tok", "hub.example.io:3024", "hub.example.io:3023")
    }

    #[tokio::test]
    async fn upsert_opens_tunnel_and_emits_audit() {
        let (fx, manager) = manager(false);
        manager.upsert(hub_cluster()).await.unwrap();

        assert!(fx.backend.get_trusted_cluster("hub.example.io").is_ok());
        assert_eq!(*fx.tunnel.events.lock().unwrap(), vec!["open hub.example.io"]);
        let audit = fx.backend.list_audit_events().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].0, "remote_support_enabled");
        assert_eq!(*fx.handshake.accepted.lock().unwrap(), vec!["hub.example.io"]);
    }

    #[tokio::test]
    async fn identical_upsert_is_a_no_op() {
        let (fx, manager) = manager(false);
        manager.upsert(hub_cluster()).await.unwrap();
        manager.upsert(hub_cluster()).await.unwrap();

        // no second audit event, tunnel opened once, one handshake
        assert_eq!(fx.backend.list_audit_events().unwrap().len(), 1);
        assert_eq!(fx.tunnel.events.lock().unwrap().len(), 1);
        assert_eq!(fx.handshake.accepted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabling_emits_the_disabled_audit() {
        let (fx, manager) = manager(false);
        manager.upsert(hub_cluster()).await.unwrap();
        let mut disabled = hub_cluster();
        disabled.enabled = false;
        manager.upsert(disabled).await.unwrap();

        let audit = fx.backend.list_audit_events().unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].0, "remote_support_disabled");
        assert!(fx.tunnel.events.lock().unwrap().contains(&"close hub.example.io".to_string()));
    }

    #[tokio::test]
    async fn self_targeting_is_rejected_outside_wizard_mode() {
        let (_, manager) = manager(false);
        let mut cluster = hub_cluster();
        cluster.name = "example.com".into();
        let err = manager.upsert(cluster.clone()).await.unwrap_err();
        assert!(err.to_string().contains("same name"));

        let wizard = manager.with_wizard_mode(true);
        wizard.upsert(cluster).await.unwrap();
    }

    #[tokio::test]
    async fn second_hub_is_already_exists() {
        let (_, manager) = manager(false);
        manager.upsert(hub_cluster()).await.unwrap();
        let other = TrustedCluster::new("other.example.io", "tok", "other:3024", "other:3023");
        let err = manager.upsert(other).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn system_cluster_skips_mirror_and_audit() {
        let (fx, manager) = manager(true); // handshake would fail if called
        let mut cluster = hub_cluster();
        cluster.system = true;
        manager.upsert(cluster).await.unwrap();
        assert!(fx.backend.list_audit_events().unwrap().is_empty());
        assert!(fx.handshake.accepted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_handshake_is_fatal_for_regular_clusters() {
        let (_, manager) = manager(true);
        let err = manager.upsert(hub_cluster()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn delayed_delete_sets_a_ttl() {
        let (fx, manager) = manager(false);
        manager.upsert(hub_cluster()).await.unwrap();
        manager
            .delete("hub.example.io", Some(std::time::Duration::from_secs(3600)))
            .await
            .unwrap();
        // record still present until the TTL lapses
        assert!(fx.backend.get_trusted_cluster("hub.example.io").is_ok());

        manager.delete("hub.example.io", None).await.unwrap();
        assert!(fx.backend.get_trusted_cluster("hub.example.io").unwrap_err().is_not_found());
        assert!(fx.tunnel.events.lock().unwrap().contains(&"close hub.example.io".to_string()));
    }
}
