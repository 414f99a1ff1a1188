//! Operations: long-running stateful tasks attached to a single site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::model::server::{Server, ServerProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Expand,
    Upgrade,
    Shrink,
    Uninstall,
    UpdateEnvars,
    UpdateRuntimeEnv,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Expand => "expand",
            Self::Upgrade => "upgrade",
            Self::Shrink => "shrink",
            Self::Uninstall => "uninstall",
            Self::UpdateEnvars => "update_envars",
            Self::UpdateRuntimeEnv => "update_runtime_env",
        };
        f.write_str(s)
    }
}

/// Top-level operation state machine.
///
/// ```text
/// created -> ready -> install_initiated -> install_provisioning
///     -> install_deploying -> install_completed | install_failed
/// ```
///
/// Expand operations walk the mirrored `expand_*` track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Ready,
    InstallInitiated,
    InstallProvisioning,
    InstallDeploying,
    InstallCompleted,
    InstallFailed,
    ExpandInitiated,
    ExpandProvisioning,
    ExpandDeploying,
    ExpandCompleted,
    ExpandFailed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InstallCompleted | Self::InstallFailed | Self::ExpandCompleted | Self::ExpandFailed
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::InstallFailed | Self::ExpandFailed)
    }

    /// Whether the operation has started deploying: no more agents may be
    /// elected once this is reached.
    pub fn is_deploying(&self) -> bool {
        matches!(self, Self::InstallDeploying | Self::ExpandDeploying)
    }

    /// Valid forward transitions. Any state may fail.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        if matches!(next, InstallFailed | ExpandFailed) {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, Ready)
                | (Ready, InstallInitiated)
                | (InstallInitiated, InstallProvisioning)
                | (InstallProvisioning, InstallDeploying)
                | (InstallDeploying, InstallCompleted)
                | (Ready, ExpandInitiated)
                | (ExpandInitiated, ExpandProvisioning)
                | (ExpandProvisioning, ExpandDeploying)
                | (ExpandDeploying, ExpandCompleted)
        )
    }

    pub fn completed_for(op_type: OperationType) -> OperationState {
        match op_type {
            OperationType::Expand => Self::ExpandCompleted,
            _ => Self::InstallCompleted,
        }
    }

    pub fn failed_for(op_type: OperationType) -> OperationState {
        match op_type {
            OperationType::Expand => Self::ExpandFailed,
            _ => Self::InstallFailed,
        }
    }

    pub fn deploying_for(op_type: OperationType) -> OperationState {
        match op_type {
            OperationType::Expand => Self::ExpandDeploying,
            _ => Self::InstallDeploying,
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde snake_case is the canonical wire spelling
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Composite key addressing one operation of one site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub account_id: String,
    pub site_domain: String,
    pub operation_id: String,
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.site_domain, self.operation_id)
    }
}

/// Variables supplied when starting an install or expand operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallExpandVars {
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Requested server count per role, filled in by the provisioner.
    #[serde(default)]
    pub profiles: Vec<ServerProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub account_id: String,
    pub site_domain: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    /// Name of the external provisioner driving server bring-up.
    pub provisioner: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_expand_vars: Option<InstallExpandVars>,
}

impl Operation {
    pub fn new(account_id: &str, site_domain: &str, op_type: OperationType, provisioner: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            site_domain: site_domain.to_string(),
            op_type,
            state: OperationState::Created,
            provisioner: provisioner.to_string(),
            created: now,
            updated: now,
            servers: Vec::new(),
            install_expand_vars: None,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            site_domain: self.site_domain.clone(),
            operation_id: self.id.clone(),
        }
    }

    /// Validate and apply a state transition.
    pub fn transition(&mut self, next: OperationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::compare_failed(format!(
                "operation {} cannot move {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_happy_path_transitions() {
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        for next in [
            OperationState::Ready,
            OperationState::InstallInitiated,
            OperationState::InstallProvisioning,
            OperationState::InstallDeploying,
            OperationState::InstallCompleted,
        ] {
            op.transition(next).unwrap();
        }
        assert!(op.state.is_terminal());
    }

    #[test]
    fn any_live_state_may_fail() {
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        op.transition(OperationState::Ready).unwrap();
        op.transition(OperationState::InstallFailed).unwrap();
        assert!(op.state.is_failed());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        op.state = OperationState::InstallCompleted;
        let err = op.transition(OperationState::InstallFailed).unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        assert!(op.transition(OperationState::InstallDeploying).is_err());
        assert_eq!(op.state, OperationState::Created);
    }

    #[test]
    fn state_display_matches_wire_format() {
        assert_eq!(OperationState::InstallDeploying.to_string(), "install_deploying");
        assert_eq!(OperationState::Created.to_string(), "created");
    }
}
