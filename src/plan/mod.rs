//! Operation plans: rooted trees of phases with dependency edges.
//!
//! A plan is a tree (`phases` nest arbitrarily) whose leaves are the units
//! of execution. `requires` edges reference phase ids anywhere in the plan;
//! for scheduling they are flattened to leaf-to-leaf edges, together with
//! the implicit edges of sequential (non-`parallel`) parents. The flattened
//! graph must be a DAG.

pub mod builder;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::model::{DnsConfig, OperationType, Server, ServiceUser, TrustedCluster};
use crate::pack::Locator;

/// State of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PhaseState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unstarted" => Ok(Self::Unstarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(EngineError::bad_parameter(format!("unknown phase state {other:?}"))),
        }
    }
}

/// Credentials a server agent uses to reach the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub url: String,
    pub token: String,
}

/// Packages to pull onto a server. Masters receive the full application;
/// workers receive the minimal runtime set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSpec {
    pub packages: Vec<Locator>,
    #[serde(default)]
    pub minimal: bool,
}

/// Application to install in-cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub app: Locator,
}

/// Typed payload attached to a phase. Which fields are set depends on the
/// phase; executors read only what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseData {
    /// Server this phase concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    /// Server that physically runs the step, when different from `server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_server: Option<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_user: Option<ServiceUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_cluster: Option<TrustedCluster>,
    /// Free-form payload, e.g. the package decryption key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPhase {
    /// Path-like id, `/`-separated, unique within the plan.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<OperationPhase>,
    /// Ids of phases this one depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Whether children may run concurrently; sequential otherwise.
    #[serde(default)]
    pub parallel: bool,
    /// Display ordering hint.
    #[serde(default)]
    pub step: i32,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationPhase {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            data: None,
            phases: Vec::new(),
            requires: Vec::new(),
            parallel: false,
            step: 0,
            state: PhaseState::Unstarted,
            updated: None,
            error: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_data(mut self, data: PhaseData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_requires<S: AsRef<str>>(mut self, requires: &[S]) -> Self {
        self.requires = requires.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_children(mut self, children: Vec<OperationPhase>) -> Self {
        self.phases = children;
        self
    }

    /// Only leaves have executors.
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    /// Effective state of a subtree: a non-leaf aggregates its children.
    pub fn effective_state(&self) -> PhaseState {
        if self.is_leaf() {
            return self.state;
        }
        let states: Vec<PhaseState> = self.phases.iter().map(|p| p.effective_state()).collect();
        if states.iter().any(|s| *s == PhaseState::Failed) {
            PhaseState::Failed
        } else if states.iter().all(|s| *s == PhaseState::Completed) {
            PhaseState::Completed
        } else if states.iter().all(|s| *s == PhaseState::RolledBack) {
            PhaseState::RolledBack
        } else if states.iter().all(|s| *s == PhaseState::Unstarted) {
            PhaseState::Unstarted
        } else {
            PhaseState::InProgress
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPlan {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub account_id: String,
    pub cluster_name: String,
    #[serde(default)]
    pub servers: Vec<Server>,
    pub dns_config: DnsConfig,
    pub phases: Vec<OperationPhase>,
}

impl OperationPlan {
    /// Every phase in the tree, depth-first, parents before children.
    pub fn all_phases(&self) -> Vec<&OperationPhase> {
        fn walk<'a>(phases: &'a [OperationPhase], out: &mut Vec<&'a OperationPhase>) {
            for phase in phases {
                out.push(phase);
                walk(&phase.phases, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.phases, &mut out);
        out
    }

    pub fn leaves(&self) -> Vec<&OperationPhase> {
        self.all_phases().into_iter().filter(|p| p.is_leaf()).collect()
    }

    pub fn get_phase(&self, id: &str) -> Option<&OperationPhase> {
        self.all_phases().into_iter().find(|p| p.id == id)
    }

    pub fn get_phase_mut(&mut self, id: &str) -> Option<&mut OperationPhase> {
        fn walk<'a>(phases: &'a mut [OperationPhase], id: &str) -> Option<&'a mut OperationPhase> {
            for phase in phases {
                if phase.id == id {
                    return Some(phase);
                }
                if let Some(found) = walk(&mut phase.phases, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.phases, id)
    }

    pub fn has_phase(&self, id: &str) -> bool {
        self.get_phase(id).is_some()
    }

    /// Record a leaf transition.
    pub fn set_phase_state(&mut self, id: &str, state: PhaseState, error: Option<String>) -> Result<()> {
        let phase = self
            .get_phase_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("phase {id}")))?;
        phase.state = state;
        phase.error = error;
        phase.updated = Some(Utc::now());
        Ok(())
    }

    /// Leaf ids under a phase (the phase itself when it is a leaf).
    pub fn leaves_under(&self, id: &str) -> Vec<String> {
        fn collect(phase: &OperationPhase, out: &mut Vec<String>) {
            if phase.is_leaf() {
                out.push(phase.id.clone());
            } else {
                for child in &phase.phases {
                    collect(child, out);
                }
            }
        }
        let mut out = Vec::new();
        if let Some(phase) = self.get_phase(id) {
            collect(phase, &mut out);
        }
        out
    }

    /// Dependencies of every leaf, flattened to leaf ids. Includes the
    /// `requires` of the leaf and of each of its ancestors, plus the
    /// implicit in-order edges of sequential parents.
    pub fn leaf_dependencies(&self) -> HashMap<String, HashSet<String>> {
        let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
        for leaf in self.leaves() {
            deps.insert(leaf.id.clone(), HashSet::new());
        }

        fn walk(
            plan: &OperationPlan,
            phases: &[OperationPhase],
            parent_parallel: bool,
            inherited: &HashSet<String>,
            deps: &mut HashMap<String, HashSet<String>>,
        ) {
            for (index, phase) in phases.iter().enumerate() {
                let mut required: HashSet<String> = inherited.clone();
                for req in &phase.requires {
                    required.extend(plan.leaves_under(req));
                }
                if !parent_parallel {
                    // sequential group: everything before this sibling
                    for previous in &phases[..index] {
                        required.extend(plan.leaves_under(&previous.id));
                    }
                }
                if phase.is_leaf() {
                    deps.entry(phase.id.clone()).or_default().extend(required);
                } else {
                    walk(plan, &phase.phases, phase.parallel, &required, deps);
                }
            }
        }

        // top-level phases form a sequential group unless tied by requires:
        // the builder emits explicit requires at the top level, so treat the
        // root as parallel and rely on the emitted edges
        walk(self, &self.phases, true, &HashSet::new(), &mut deps);
        deps
    }

    /// Validate the plan: unique ids, resolvable requires, and an acyclic
    /// flattened leaf graph.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for phase in self.all_phases() {
            if !seen.insert(phase.id.clone()) {
                return Err(EngineError::bad_parameter(format!("duplicate phase id {}", phase.id)));
            }
        }
        for phase in self.all_phases() {
            for req in &phase.requires {
                if !seen.contains(req) {
                    return Err(EngineError::bad_parameter(format!(
                        "phase {} requires unknown phase {req}",
                        phase.id
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    /// Kahn's algorithm over the flattened leaf graph.
    fn check_acyclic(&self) -> Result<()> {
        let deps = self.leaf_dependencies();
        let mut in_degree: HashMap<&str, usize> =
            deps.iter().map(|(id, d)| (id.as_str(), d.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, d) in &deps {
            for dep in d {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0;
        while let Some(id) = queue.pop() {
            processed += 1;
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let deg = in_degree.get_mut(child).expect("leaf in degree map");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(child);
                    }
                }
            }
        }
        if processed != deps.len() {
            let cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(EngineError::bad_parameter(format!(
                "cycle in phase dependencies involving {cycle:?}"
            )));
        }
        Ok(())
    }

    /// Leaves that are ready to launch: unstarted with every dependency
    /// completed.
    pub fn ready_leaves(&self) -> Vec<&OperationPhase> {
        let deps = self.leaf_dependencies();
        let states: HashMap<&str, PhaseState> =
            self.leaves().into_iter().map(|l| (l.id.as_str(), l.state)).collect();
        self.leaves()
            .into_iter()
            .filter(|leaf| {
                leaf.state == PhaseState::Unstarted
                    && deps[&leaf.id]
                        .iter()
                        .all(|dep| states.get(dep.as_str()) == Some(&PhaseState::Completed))
            })
            .collect()
    }

    /// Leaf ids in a valid execution order (dependencies first).
    pub fn execution_order(&self) -> Vec<String> {
        let deps = self.leaf_dependencies();
        // preserve plan order among ready candidates for stable output
        let leaf_order: Vec<String> = self.leaves().iter().map(|l| l.id.clone()).collect();
        let mut done: HashSet<String> = HashSet::new();
        let mut order = Vec::new();
        while order.len() < leaf_order.len() {
            let mut advanced = false;
            for id in &leaf_order {
                if !done.contains(id) && deps[id].iter().all(|d| done.contains(d)) {
                    done.insert(id.clone());
                    order.push(id.clone());
                    advanced = true;
                }
            }
            if !advanced {
                break; // cyclic plans are rejected by validate()
            }
        }
        order
    }

    /// Completed leaves sharing the failed leaf's parent group, in reverse
    /// execution order. These are the rollback targets after a permanent
    /// failure.
    pub fn rollback_group(&self, failed_id: &str) -> Vec<String> {
        let group = match self.parent_of(failed_id) {
            Some(parent) => self.leaves_under(&parent.id),
            None => self
                .phases
                .iter()
                .find(|p| p.id == failed_id)
                .map(|p| vec![p.id.clone()])
                .unwrap_or_default(),
        };
        let group: HashSet<String> = group.into_iter().collect();
        let mut targets: Vec<String> = self
            .execution_order()
            .into_iter()
            .filter(|id| {
                group.contains(id)
                    && id != failed_id
                    && self.get_phase(id).map(|p| p.state) == Some(PhaseState::Completed)
            })
            .collect();
        targets.reverse();
        targets
    }

    fn parent_of(&self, id: &str) -> Option<&OperationPhase> {
        self.all_phases()
            .into_iter()
            .find(|p| p.phases.iter().any(|c| c.id == id))
    }

    pub fn is_complete(&self) -> bool {
        self.leaves().iter().all(|l| l.state == PhaseState::Completed)
    }

    pub fn has_failed(&self) -> bool {
        self.leaves().iter().any(|l| l.state == PhaseState::Failed)
    }

    pub fn completion_percent(&self) -> u8 {
        let leaves = self.leaves();
        if leaves.is_empty() {
            return 100;
        }
        let completed = leaves.iter().filter(|l| l.state == PhaseState::Completed).count();
        ((completed * 100) / leaves.len()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str, requires: &[&str]) -> OperationPhase {
        OperationPhase::new(id).with_requires(requires)
    }

    fn plan(phases: Vec<OperationPhase>) -> OperationPlan {
        OperationPlan {
            operation_id: "op-1".into(),
            operation_type: OperationType::Install,
            account_id: "acc".into(),
            cluster_name: "example.com".into(),
            servers: Vec::new(),
            dns_config: DnsConfig::default(),
            phases,
        }
    }

    #[test]
    fn validate_accepts_diamond() {
        let p = plan(vec![
            leaf("/init", &[]),
            leaf("/checks", &["/init"]),
            leaf("/configure", &["/init"]),
            leaf("/pull", &["/checks", "/configure"]),
        ]);
        p.validate().unwrap();
    }

    #[test]
    fn validate_rejects_unknown_requires() {
        let p = plan(vec![leaf("/init", &["/missing"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("/missing"));
    }

    #[test]
    fn validate_rejects_cycles() {
        let p = plan(vec![
            leaf("/a", &["/c"]),
            leaf("/b", &["/a"]),
            leaf("/c", &["/b"]),
        ]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let p = plan(vec![leaf("/a", &[]), leaf("/a", &[])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn requires_on_parents_flatten_to_leaves() {
        let p = plan(vec![
            leaf("/configure", &[]),
            OperationPhase::new("/pull")
                .with_parallel(true)
                .with_requires(&["/configure"])
                .with_children(vec![leaf("/pull/node-1", &[]), leaf("/pull/node-2", &[])]),
        ]);
        p.validate().unwrap();
        let deps = p.leaf_dependencies();
        assert!(deps["/pull/node-1"].contains("/configure"));
        assert!(deps["/pull/node-2"].contains("/configure"));
    }

    #[test]
    fn sequential_children_gain_implicit_edges() {
        let p = plan(vec![OperationPhase::new("/masters/node-1").with_children(vec![
            leaf("/masters/node-1/teleport", &[]),
            leaf("/masters/node-1/planet", &[]),
        ])]);
        let deps = p.leaf_dependencies();
        assert!(deps["/masters/node-1/planet"].contains("/masters/node-1/teleport"));
        assert!(deps["/masters/node-1/teleport"].is_empty());
    }

    #[test]
    fn ready_leaves_respect_dependencies() {
        let mut p = plan(vec![
            leaf("/init", &[]),
            leaf("/checks", &["/init"]),
        ]);
        let ready: Vec<String> = p.ready_leaves().iter().map(|l| l.id.clone()).collect();
        assert_eq!(ready, vec!["/init"]);

        p.set_phase_state("/init", PhaseState::Completed, None).unwrap();
        let ready: Vec<String> = p.ready_leaves().iter().map(|l| l.id.clone()).collect();
        assert_eq!(ready, vec!["/checks"]);
    }

    #[test]
    fn effective_state_aggregates_children() {
        let mut p = plan(vec![OperationPhase::new("/pull").with_parallel(true).with_children(vec![
            leaf("/pull/node-1", &[]),
            leaf("/pull/node-2", &[]),
        ])]);
        assert_eq!(p.get_phase("/pull").unwrap().effective_state(), PhaseState::Unstarted);

        p.set_phase_state("/pull/node-1", PhaseState::Completed, None).unwrap();
        assert_eq!(p.get_phase("/pull").unwrap().effective_state(), PhaseState::InProgress);

        p.set_phase_state("/pull/node-2", PhaseState::Failed, Some("boom".into())).unwrap();
        assert_eq!(p.get_phase("/pull").unwrap().effective_state(), PhaseState::Failed);

        p.set_phase_state("/pull/node-2", PhaseState::Completed, None).unwrap();
        assert_eq!(p.get_phase("/pull").unwrap().effective_state(), PhaseState::Completed);
    }

    #[test]
    fn rollback_group_is_reverse_ordered_siblings() {
        let mut p = plan(vec![OperationPhase::new("/pull").with_parallel(true).with_children(vec![
            leaf("/pull/node-1", &[]),
            leaf("/pull/node-2", &[]),
            leaf("/pull/node-3", &[]),
        ])]);
        p.set_phase_state("/pull/node-1", PhaseState::Completed, None).unwrap();
        p.set_phase_state("/pull/node-2", PhaseState::Completed, None).unwrap();
        p.set_phase_state("/pull/node-3", PhaseState::Failed, Some("x".into())).unwrap();

        let targets = p.rollback_group("/pull/node-3");
        assert_eq!(targets, vec!["/pull/node-2", "/pull/node-1"]);
    }

    #[test]
    fn completion_percent_counts_leaves() {
        let mut p = plan(vec![leaf("/a", &[]), leaf("/b", &[]), leaf("/c", &[]), leaf("/d", &[])]);
        assert_eq!(p.completion_percent(), 0);
        p.set_phase_state("/a", PhaseState::Completed, None).unwrap();
        p.set_phase_state("/b", PhaseState::Completed, None).unwrap();
        assert_eq!(p.completion_percent(), 50);
    }
}
