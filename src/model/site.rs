//! Site records: one deployed cluster per `domain`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::pack::Locator;

/// Lifecycle state of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiteState {
    /// Cluster is healthy and serving.
    #[default]
    Active,
    /// Cluster is up but impaired (for example an invalid license).
    Degraded,
    /// Cluster was switched off by an operator.
    Deactivated,
}

/// Why a site left the `active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteReason {
    LicenseInvalid,
}

/// Cluster DNS configuration carried into every plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub addrs: Vec<String>,
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["127.0.0.2".to_string()],
            port: 53,
        }
    }
}

/// Unprivileged user the runtime executes under on every server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl Default for ServiceUser {
    fn default() -> Self {
        Self {
            name: "planet".to_string(),
            uid: 1000,
            gid: 1000,
        }
    }
}

/// One deployed Kubernetes cluster managed by the engine, unique by
/// `domain`. Created when an install operation starts; mutated by operation
/// progress and license checks; never deleted while an operation is in
/// flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub account_id: String,
    pub domain: String,
    /// Application package this cluster runs.
    pub app_package: Locator,
    /// Infrastructure provider, e.g. `aws` or `onprem`.
    pub provider: String,
    pub dns_config: DnsConfig,
    /// Opaque license string, if the application requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub service_user: ServiceUser,
    pub state: SiteState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SiteReason>,
    /// How often the periodic-updates loop checks the Hub, in seconds.
    /// Zero disables the loop.
    #[serde(default)]
    pub update_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_update_check: Option<DateTime<Utc>>,
    /// True for the cluster this process itself runs in.
    #[serde(default)]
    pub local: bool,
    pub created: DateTime<Utc>,
}

impl Site {
    pub fn new(account_id: &str, domain: &str, app_package: Locator, provider: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            domain: domain.to_string(),
            app_package,
            provider: provider.to_string(),
            dns_config: DnsConfig::default(),
            license: None,
            service_user: ServiceUser::default(),
            state: SiteState::Active,
            reason: None,
            update_interval_secs: 0,
            next_update_check: None,
            local: false,
            created: Utc::now(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(EngineError::bad_parameter("site domain is required"));
        }
        if self.account_id.is_empty() {
            return Err(EngineError::bad_parameter("site account_id is required"));
        }
        Ok(())
    }

    /// Mark the site degraded with the given reason, or return it to
    /// `active` when the reason is cleared.
    pub fn set_reason(&mut self, reason: Option<SiteReason>) {
        self.reason = reason;
        self.state = if reason.is_some() {
            SiteState::Degraded
        } else {
            SiteState::Active
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Site {
        Site::new(
            "acc-1",
            "example.com",
            Locator::new("example.io", "app", "1.0.0"),
            "onprem",
        )
    }

    #[test]
    fn check_rejects_empty_domain() {
        let mut s = site();
        s.domain.clear();
        assert!(s.check().is_err());
    }

    #[test]
    fn reason_drives_state() {
        let mut s = site();
        s.set_reason(Some(SiteReason::LicenseInvalid));
        assert_eq!(s.state, SiteState::Degraded);

        s.set_reason(None);
        assert_eq!(s.state, SiteState::Active);
        assert!(s.reason.is_none());
    }

    #[test]
    fn site_roundtrips_through_json() {
        let s = site();
        let json = serde_json::to_string(&s).unwrap();
        let back: Site = serde_json::from_str(&json).unwrap();
        assert_eq!(back.domain, "example.com");
        assert_eq!(back.state, SiteState::Active);
    }
}
