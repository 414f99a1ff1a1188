//! Installer election for Hub-initiated installs.
//!
//! When a Hub starts an operation, agents boot on every participating
//! server at once and race to register. Exactly one must become the
//! installer; the rest join it. The Hub resolves the race with a
//! per-operation single-slot TTL cell: the first registration wins the
//! slot, later registrations read it, and the winner refreshes its TTL by
//! re-registering. If the winner dies and the TTL lapses, the next poller
//! takes the slot over.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::model::OperationKey;

/// Default slot TTL. The installer re-registers well inside this window.
pub const DEFAULT_INSTALL_GROUP_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub account_id: String,
    pub cluster_name: String,
    pub operation_id: String,
    pub agent_id: String,
    pub advertise_ip: String,
}

impl RegisterAgentRequest {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            site_domain: self.cluster_name.clone(),
            operation_id: self.operation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAgentResponse {
    pub installer_id: String,
    pub installer_ip: String,
}

struct Slot {
    request: RegisterAgentRequest,
    expires: Instant,
}

#[derive(Default)]
struct InstallGroup {
    slot: Option<Slot>,
}

/// Process-wide registry of per-operation install groups.
///
/// The outer map is guarded by one mutex; each group has its own, and
/// `register` is a single critical section over it: read the cell,
/// compare, write the cell, answer.
pub struct InstallGroups {
    ttl: Duration,
    groups: Mutex<HashMap<OperationKey, InstallGroup>>,
}

impl InstallGroups {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one registration. The caller either becomes the installer
    /// (its own identity echoes back) or learns who the installer is.
    pub fn register(&self, request: RegisterAgentRequest) -> RegisterAgentResponse {
        let key = request.key();
        let now = Instant::now();
        let mut groups = self.groups.lock().expect("install group mutex poisoned");
        let group = groups.entry(key).or_default();

        if let Some(slot) = &mut group.slot
            && slot.expires > now
        {
            if slot.request.agent_id == request.agent_id {
                slot.expires = now + self.ttl;
            }
            return RegisterAgentResponse {
                installer_id: slot.request.agent_id.clone(),
                installer_ip: slot.request.advertise_ip.clone(),
            };
        }

        // empty or lapsed slot: the caller becomes the installer
        let response = RegisterAgentResponse {
            installer_id: request.agent_id.clone(),
            installer_ip: request.advertise_ip.clone(),
        };
        group.slot = Some(Slot {
            request,
            expires: now + self.ttl,
        });
        response
    }

    /// Drop the group once the operation has started and no more agents
    /// may elect.
    pub fn remove(&self, key: &OperationKey) {
        self.groups
            .lock()
            .expect("install group mutex poisoned")
            .remove(key);
    }
}

impl Default for InstallGroups {
    fn default() -> Self {
        Self::new(DEFAULT_INSTALL_GROUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn request(agent: &str, ip: &str) -> RegisterAgentRequest {
        RegisterAgentRequest {
            account_id: "acc".into(),
            cluster_name: "example.com".into(),
            operation_id: "op-1".into(),
            agent_id: agent.into(),
            advertise_ip: ip.into(),
        }
    }

    #[test]
    fn first_caller_becomes_installer() {
        let groups = InstallGroups::default();
        let response = groups.register(request("a1", "10.0.0.1"));
        assert_eq!(response.installer_id, "a1");
        assert_eq!(response.installer_ip, "10.0.0.1");

        let response = groups.register(request("a2", "10.0.0.2"));
        assert_eq!(response.installer_id, "a1");
        assert_eq!(response.installer_ip, "10.0.0.1");
    }

    #[test]
    fn installer_re_registration_refreshes_ttl() {
        let groups = InstallGroups::new(Duration::from_millis(50));
        groups.register(request("a1", "10.0.0.1"));
        std::thread::sleep(Duration::from_millis(30));
        // refresh inside the window
        let response = groups.register(request("a1", "10.0.0.1"));
        assert_eq!(response.installer_id, "a1");
        std::thread::sleep(Duration::from_millis(30));
        // still within the refreshed TTL, a joiner sees the same installer
        let response = groups.register(request("a2", "10.0.0.2"));
        assert_eq!(response.installer_id, "a1");
    }

    #[test]
    fn lapsed_slot_elects_a_new_installer() {
        let groups = InstallGroups::new(Duration::from_millis(10));
        groups.register(request("a1", "10.0.0.1"));
        std::thread::sleep(Duration::from_millis(20));
        let response = groups.register(request("a2", "10.0.0.2"));
        assert_eq!(response.installer_id, "a2");
    }

    #[test]
    fn operations_elect_independently() {
        let groups = InstallGroups::default();
        groups.register(request("a1", "10.0.0.1"));
        let mut other = request("b1", "10.1.0.1");
        other.operation_id = "op-2".into();
        let response = groups.register(other);
        assert_eq!(response.installer_id, "b1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_agree_on_one_installer() {
        let groups = Arc::new(InstallGroups::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let groups = groups.clone();
            handles.push(tokio::spawn(async move {
                groups.register(request(&format!("a{i}"), &format!("10.0.0.{i}")))
            }));
        }
        let mut installers = HashSet::new();
        for handle in handles {
            installers.insert(handle.await.unwrap().installer_id);
        }
        assert_eq!(installers.len(), 1, "election returned multiple installers");
    }
}
