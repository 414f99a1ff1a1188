//! Runtime configuration for the installer process.
//!
//! Every recognised option is an explicit field; `check_and_set_defaults`
//! is the single place defaults are applied and required fields are
//! enforced, producing `bad_parameter` for anything missing.

use std::path::PathBuf;
use std::time::Duration;

use crate::election::DEFAULT_INSTALL_GROUP_TTL;
use crate::errors::{EngineError, Result};
use crate::fsm::FsmConfig;
use crate::hub::updates::PERIODIC_UPDATES_TICK_INTERVAL;
use crate::pack::Locator;

/// How the installer acquires cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// All state is created locally.
    #[default]
    Local,
    /// State is replicated from the Hub that initiated the install.
    OpsCenter,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the installer keeps its database and logs.
    pub state_dir: PathBuf,
    pub account_id: String,
    /// Cluster domain, unique per deployment.
    pub cluster_name: String,
    /// Application package to install.
    pub app_package: Option<Locator>,
    pub provider: String,
    /// Address agents use to reach this installer.
    pub advertise_addr: String,
    /// Port of the installer agent server.
    pub agent_port: u16,
    pub mode: InstallMode,
    /// Hub address and tunnel token for Hub federation.
    pub remote_ops_url: Option<String>,
    pub ops_tunnel_token: Option<String>,
    pub license: Option<String>,
    pub preflight_checks: bool,
    /// Phase retry budget (see the FSM failure semantics).
    pub phase_retry_attempts: u32,
    pub phase_retry_base: Duration,
    pub phase_retry_cap: Duration,
    pub max_parallel_phases: usize,
    pub install_group_ttl: Duration,
    pub updates_tick: Duration,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::new(),
            account_id: "system".to_string(),
            cluster_name: String::new(),
            app_package: None,
            provider: "onprem".to_string(),
            advertise_addr: String::new(),
            agent_port: 61009,
            mode: InstallMode::Local,
            remote_ops_url: None,
            ops_tunnel_token: None,
            license: None,
            preflight_checks: true,
            phase_retry_attempts: 5,
            phase_retry_base: Duration::from_secs(1),
            phase_retry_cap: Duration::from_secs(60),
            max_parallel_phases: 4,
            install_group_ttl: DEFAULT_INSTALL_GROUP_TTL,
            updates_tick: PERIODIC_UPDATES_TICK_INTERVAL,
            verbose: false,
        }
    }
}

impl Config {
    /// Apply defaults and validate required fields.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            self.state_dir = dirs::home_dir()
                .map(|home| home.join(".anchorage"))
                .unwrap_or_else(|| PathBuf::from(".anchorage"));
        }
        if self.cluster_name.is_empty() {
            return Err(EngineError::bad_parameter("cluster name is required"));
        }
        if self.advertise_addr.is_empty() {
            self.advertise_addr = "127.0.0.1".to_string();
        }
        if self.mode == InstallMode::OpsCenter
            && (self.remote_ops_url.is_none() || self.ops_tunnel_token.is_none())
        {
            return Err(EngineError::bad_parameter(
                "Hub-initiated installs require remote_ops_url and ops_tunnel_token",
            ));
        }
        if self.phase_retry_attempts == 0 {
            return Err(EngineError::bad_parameter("phase_retry_attempts must be positive"));
        }
        if self.max_parallel_phases == 0 {
            return Err(EngineError::bad_parameter("max_parallel_phases must be positive"));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("anchorage.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn fsm_config(&self) -> FsmConfig {
        FsmConfig {
            retry_attempts: self.phase_retry_attempts,
            retry_base: self.phase_retry_base,
            retry_cap: self.phase_retry_cap,
            max_parallel: self.max_parallel_phases,
            ..FsmConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            cluster_name: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_applied() {
        let mut config = minimal();
        config.check_and_set_defaults().unwrap();
        assert!(config.state_dir.ends_with(".anchorage"));
        assert_eq!(config.advertise_addr, "127.0.0.1");
        assert_eq!(config.agent_port, 61009);
    }

    #[test]
    fn cluster_name_is_required() {
        let mut config = Config::default();
        let err = config.check_and_set_defaults().unwrap_err();
        assert!(err.to_string().contains("cluster name"));
    }

    #[test]
    fn ops_center_mode_requires_hub_parameters() {
        let mut config = minimal();
        config.mode = InstallMode::OpsCenter;
        assert!(config.check_and_set_defaults().is_err());

        config.remote_ops_url = Some("https://hub.example.com".into());
        config.ops_tunnel_token = Some("tok".into());
        config.check_and_set_defaults().unwrap();
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        let mut config = minimal();
        config.phase_retry_attempts = 0;
        assert!(config.check_and_set_defaults().is_err());
    }
}
