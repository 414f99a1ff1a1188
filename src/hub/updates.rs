//! Periodic application updates pulled from the Hub.
//!
//! One task per cluster while updates are enabled. Each tick loads the
//! site, honours `next_update_check`, asks the Hub for a newer version,
//! and on a hit downloads the package, re-syncs the application, and
//! advances the check time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::PackageDocument;
use crate::backend::Backend;
use crate::errors::Result;
use crate::hub::HubClient;
use crate::pack::{Locator, PackageService};

/// Tick interval of the updates loop.
pub const PERIODIC_UPDATES_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The Hub surface the loop talks to; substituted in tests.
#[async_trait]
pub trait UpdateRemote: Send + Sync {
    async fn check_for_update(&self, account_id: &str, domain: &str) -> Result<Option<Locator>>;
    async fn download(&self, locator: &Locator) -> Result<PackageDocument>;
}

#[async_trait]
impl UpdateRemote for HubClient {
    async fn check_for_update(&self, account_id: &str, domain: &str) -> Result<Option<Locator>> {
        HubClient::check_for_update(self, account_id, domain).await
    }

    async fn download(&self, locator: &Locator) -> Result<PackageDocument> {
        self.get_package(locator).await
    }
}

/// Remote for deployments without a Hub: never offers updates.
pub struct NoRemote;

#[async_trait]
impl UpdateRemote for NoRemote {
    async fn check_for_update(&self, _account_id: &str, _domain: &str) -> Result<Option<Locator>> {
        Ok(None)
    }

    async fn download(&self, locator: &Locator) -> Result<PackageDocument> {
        Err(crate::errors::EngineError::not_found(locator.to_string()))
    }
}

/// Post-download application sync (registry re-sync and app activation).
/// The production implementation belongs to the application layer.
#[async_trait]
pub trait AppSync: Send + Sync {
    async fn sync_app(&self, locator: &Locator) -> Result<()>;
}

pub struct LoggingSync;

#[async_trait]
impl AppSync for LoggingSync {
    async fn sync_app(&self, locator: &Locator) -> Result<()> {
        info!(app = %locator, "application synced");
        Ok(())
    }
}

/// Per-cluster updates supervisor. Cheap to clone; clones share the task
/// registry.
#[derive(Clone)]
pub struct UpdateLoop {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    packages: PackageService,
    remote: Arc<dyn UpdateRemote>,
    sync: Arc<dyn AppSync>,
    tick: Duration,
    /// Shutdown handles of running per-cluster tasks, single-owner after
    /// creation.
    services: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl UpdateLoop {
    pub fn new(
        backend: Backend,
        packages: PackageService,
        remote: Arc<dyn UpdateRemote>,
        sync: Arc<dyn AppSync>,
    ) -> Self {
        Self::with_tick_interval(backend, packages, remote, sync, PERIODIC_UPDATES_TICK_INTERVAL)
    }

    pub fn with_tick_interval(
        backend: Backend,
        packages: PackageService,
        remote: Arc<dyn UpdateRemote>,
        sync: Arc<dyn AppSync>,
        tick: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                packages,
                remote,
                sync,
                tick,
                services: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enable periodic updates: set the interval on the site and the
    /// pull-updates bit on every Hub trust record, then start the task.
    pub fn enable(&self, domain: &str, interval: Duration) -> Result<()> {
        let mut site = self.inner.backend.get_site(domain)?;
        site.update_interval_secs = interval.as_secs();
        site.next_update_check = Some(Utc::now());
        self.inner.backend.update_site(&site)?;
        self.set_pull_updates(true)?;
        self.start(domain);
        Ok(())
    }

    pub fn disable(&self, domain: &str) -> Result<()> {
        let mut site = self.inner.backend.get_site(domain)?;
        site.update_interval_secs = 0;
        site.next_update_check = None;
        self.inner.backend.update_site(&site)?;
        self.set_pull_updates(false)?;
        self.stop(domain);
        Ok(())
    }

    fn set_pull_updates(&self, enabled: bool) -> Result<()> {
        for mut cluster in self.inner.backend.list_trusted_clusters()? {
            if cluster.system || cluster.wizard {
                continue;
            }
            if cluster.pull_updates != enabled {
                cluster.pull_updates = enabled;
                self.inner.backend.upsert_trusted_cluster(&cluster)?;
            }
        }
        Ok(())
    }

    /// Start the per-cluster task if it is not already running.
    pub fn start(&self, domain: &str) {
        let mut services = self.inner.services.lock().expect("updates mutex poisoned");
        if services.contains_key(domain) {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        services.insert(domain.to_string(), tx);

        let this = self.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_once(&domain).await {
                            warn!(domain = %domain, error = %e, "update check failed");
                        }
                    }
                    _ = rx.changed() => {
                        debug!(domain = %domain, "updates loop stopped");
                        return;
                    }
                }
            }
        });
    }

    pub fn stop(&self, domain: &str) {
        if let Some(tx) = self
            .inner
            .services
            .lock()
            .expect("updates mutex poisoned")
            .remove(domain)
        {
            let _ = tx.send(true);
        }
    }

    pub fn is_running(&self, domain: &str) -> bool {
        self.inner
            .services
            .lock()
            .expect("updates mutex poisoned")
            .contains_key(domain)
    }

    /// One update check. Returns the downloaded version, if any.
    pub async fn run_once(&self, domain: &str) -> Result<Option<Locator>> {
        let mut site = self.inner.backend.get_site(domain)?;
        if site.update_interval_secs == 0 {
            return Ok(None);
        }
        let now = Utc::now();
        if site.next_update_check.is_some_and(|next| now < next) {
            return Ok(None);
        }
        let interval = chrono::Duration::seconds(site.update_interval_secs as i64);

        let newer = self
            .inner
            .remote
            .check_for_update(&site.account_id, &site.domain)
            .await?
            .filter(|locator| locator.newer_than(&site.app_package));

        let Some(locator) = newer else {
            site.next_update_check = Some(now + interval);
            self.inner.backend.update_site(&site)?;
            return Ok(None);
        };

        info!(domain = %domain, version = %locator, "downloading application update");
        let document = self.inner.remote.download(&locator).await?;
        self.inner.packages.upsert_package(
            &document.envelope.locator,
            &document.data,
            document.envelope.encrypted,
        )?;
        self.inner.sync.sync_app(&locator).await?;

        site.app_package = locator.clone();
        site.next_update_check = Some(now + interval);
        self.inner.backend.update_site(&site)?;
        self.inner.backend.append_audit_event(
            "updates_downloaded",
            serde_json::json!({ "version": locator.to_string() }),
        )?;
        Ok(Some(locator))
    }
}
