//! The plan execution engine.
//!
//! `engine` walks a persisted plan, launching executors for every leaf
//! whose dependencies are satisfied; `executors` holds the built-in
//! executor bodies. This module defines what they share: the executor
//! contract, the pattern registry that maps phase ids to executor
//! factories, progress reporting, and the engine configuration.

pub mod engine;
pub mod executors;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::errors::Result;
use crate::model::{OperationKey, ProgressEntry, Server};
use crate::plan::{OperationPhase, OperationPlan, PhaseData};

pub use engine::{FsmEngine, FsmResult};

/// Engine tunables. The retry budget is deliberately configuration, not a
/// constant.
#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// Attempts per leaf for transient failures.
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Concurrent leaves across all parallel groups.
    pub max_parallel: usize,
    /// How long to wait for in-flight executors after cancellation.
    pub cancel_wait: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            max_parallel: 4,
            cancel_wait: Duration::from_secs(30),
        }
    }
}

/// Everything an executor sees: the plan snapshot, its own phase, a
/// progress reporter tagged with the phase path, and the shutdown signal
/// for long waits.
#[derive(Clone)]
pub struct ExecutorParams {
    pub plan: Arc<OperationPlan>,
    pub phase: OperationPhase,
    pub progress: ProgressReporter,
    pub shutdown: watch::Receiver<bool>,
}

impl ExecutorParams {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.plan.account_id.clone(),
            site_domain: self.plan.cluster_name.clone(),
            operation_id: self.plan.operation_id.clone(),
        }
    }

    pub fn data(&self) -> PhaseData {
        self.phase.data.clone().unwrap_or_default()
    }
}

/// The contract every phase executor honours.
///
/// `execute` must be idempotent: the driver may re-invoke it on the same
/// state after a restart. `rollback` must be a no-op if `execute` never
/// began. `pre_check` reports whether the phase is observably already done
/// so replays skip it; `post_check` validates success without re-running.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn pre_check(&self, params: &ExecutorParams) -> Result<bool> {
        let _ = params;
        Ok(false)
    }

    async fn execute(&self, params: &ExecutorParams) -> Result<()>;

    async fn rollback(&self, params: &ExecutorParams) -> Result<()> {
        let _ = params;
        Ok(())
    }

    async fn post_check(&self, params: &ExecutorParams) -> Result<()> {
        let _ = params;
        Ok(())
    }
}

/// Dispatch surface for phases that run on a particular server. The
/// installer's agent server implements this by routing to the connected
/// agent; tests substitute a recording fake.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn execute_on(&self, server: &Server, phase_id: &str, data: &PhaseData) -> Result<()>;
    async fn rollback_on(&self, server: &Server, phase_id: &str, data: &PhaseData) -> Result<()>;
}

/// Where the engine writes progress entries. Implemented by the operator
/// variants, including the Hub fan-out.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry>;
}

/// Per-phase progress reporter. Completion is monotonic within a leaf;
/// regressions are clamped to the high-water mark.
#[derive(Clone)]
pub struct ProgressReporter {
    key: OperationKey,
    phase_id: String,
    tx: mpsc::Sender<ProgressEntry>,
    high_water: Arc<std::sync::atomic::AtomicU8>,
}

impl ProgressReporter {
    pub fn new(key: OperationKey, phase_id: &str, tx: mpsc::Sender<ProgressEntry>) -> Self {
        Self {
            key,
            phase_id: phase_id.to_string(),
            tx,
            high_water: Arc::new(std::sync::atomic::AtomicU8::new(0)),
        }
    }

    pub async fn report(&self, completion: u8, message: impl Into<String>) {
        use std::sync::atomic::Ordering;
        let completion = self.high_water.fetch_max(completion.min(100), Ordering::SeqCst).max(completion.min(100));
        let entry = ProgressEntry::new(
            &self.key,
            completion,
            format!("[{}] {}", self.phase_id, message.into()),
        );
        // a full channel means the operation is being torn down; drop
        let _ = self.tx.send(entry).await;
    }
}

enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn matches(&self, id: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == id,
            Self::Prefix(prefix) => id.starts_with(prefix.as_str()),
        }
    }
}

/// Factory invoked when a phase id matches its pattern.
pub type ExecutorFactory = Arc<dyn Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync>;

/// Maps phase ids to executor factories. Exact patterns win over prefix
/// patterns; within a class, registration order decides. The registry is
/// built once at engine construction; there is no global mutable state.
#[derive(Default)]
pub struct ExecutorRegistry {
    exact: Vec<(Pattern, ExecutorFactory)>,
    prefix: Vec<(Pattern, ExecutorFactory)>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_exact(&mut self, id: &str, factory: ExecutorFactory) {
        self.exact.push((Pattern::Exact(id.to_string()), factory));
    }

    pub fn register_prefix(&mut self, prefix: &str, factory: ExecutorFactory) {
        self.prefix.push((Pattern::Prefix(prefix.to_string()), factory));
    }

    pub fn resolve(&self, phase_id: &str) -> Option<&ExecutorFactory> {
        self.exact
            .iter()
            .chain(self.prefix.iter())
            .find(|(pattern, _)| pattern.matches(phase_id))
            .map(|(_, factory)| factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl PhaseExecutor for Noop {
        async fn execute(&self, _params: &ExecutorParams) -> Result<()> {
            Ok(())
        }
    }

    fn noop_factory() -> ExecutorFactory {
        Arc::new(|_params| Ok(Box::new(Noop) as Box<dyn PhaseExecutor>))
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut registry = ExecutorRegistry::new();
        registry.register_prefix("/pull/", noop_factory());
        registry.register_exact("/pull/node-1", noop_factory());

        // both classes match; resolution must try exact patterns first
        assert!(registry.resolve("/pull/node-1").is_some());
        assert!(registry.resolve("/pull/node-2").is_some());
        assert!(registry.resolve("/unknown").is_none());
    }

    #[test]
    fn prefix_registration_order_decides() {
        let mut registry = ExecutorRegistry::new();
        registry.register_prefix("/cluster/", noop_factory());
        registry.register_prefix("/cluster/app/", noop_factory());
        // first registered prefix matches, even though the second is longer
        assert!(registry.resolve("/cluster/app/install").is_some());
    }

    #[tokio::test]
    async fn progress_completion_is_monotonic() {
        let (tx, mut rx) = mpsc::channel(8);
        let key = OperationKey {
            account_id: "acc".into(),
            site_domain: "example.com".into(),
            operation_id: "op".into(),
        };
        let reporter = ProgressReporter::new(key, "/pull", tx);
        reporter.report(40, "pulling").await;
        reporter.report(20, "still pulling").await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.completion, 40);
        // regression clamped to the high-water mark
        assert_eq!(second.completion, 40);
        assert!(second.message.contains("/pull"));
    }
}
