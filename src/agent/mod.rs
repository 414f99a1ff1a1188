//! Agents: processes on target servers that execute per-server phases.
//!
//! The installer hosts an agent server; agents authenticate with the
//! operation's provisioning token, long-poll for phase assignments,
//! execute them through a [`HostRunner`], and post results and progress
//! back. The FSM reaches agents through the [`crate::fsm::AgentRouter`]
//! implementation in [`server`].

pub mod client;
pub mod server;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::plan::PhaseData;

pub use client::{AgentClient, HostRunner, LoggingRunner};
pub use server::AgentServer;

/// Wizard-specific agent URL:
/// `agent://<host:port>/<role>?access_token=<token>[&provisioner=<name>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUrl {
    pub host: String,
    pub port: u16,
    pub role: String,
    pub access_token: String,
    pub provisioner: Option<String>,
}

impl AgentUrl {
    pub fn new(host: &str, port: u16, role: &str, access_token: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            role: role.to_string(),
            access_token: access_token.to_string(),
            provisioner: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let re = Regex::new(r"^agent://([^/:]+):(\d+)/([^?/]+)\?(.+)$").expect("static regex");
        let captures = re
            .captures(raw)
            .ok_or_else(|| EngineError::bad_parameter(format!("malformed agent url {raw:?}")))?;
        let host = captures[1].to_string();
        let port: u16 = captures[2]
            .parse()
            .map_err(|_| EngineError::bad_parameter(format!("bad port in agent url {raw:?}")))?;
        let role = captures[3].to_string();

        let mut access_token = None;
        let mut provisioner = None;
        for pair in captures[4].split('&') {
            match pair.split_once('=') {
                Some(("access_token", value)) => access_token = Some(value.to_string()),
                Some(("provisioner", value)) => provisioner = Some(value.to_string()),
                _ => {}
            }
        }
        let access_token = access_token
            .ok_or_else(|| EngineError::bad_parameter(format!("agent url {raw:?} is missing access_token")))?;
        Ok(Self {
            host,
            port,
            role,
            access_token,
            provisioner,
        })
    }

    /// The HTTP endpoint underneath the agent scheme.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for AgentUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "agent://{}:{}/{}?access_token={}",
            self.host, self.port, self.role, self.access_token
        )?;
        if let Some(provisioner) = &self.provisioner {
            write!(f, "&provisioner={provisioner}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    Execute,
    Rollback,
}

/// One unit of work dispatched to an agent, tagged with the phase path so
/// progress is attributable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAssignment {
    pub id: String,
    pub phase_id: String,
    pub kind: AssignmentKind,
    pub data: PhaseData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPeerRequest {
    pub agent_id: String,
    pub advertise_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProgress {
    pub phase_id: String,
    pub completion: u8,
    pub message: String,
}
