//! The FSM driver: selects ready leaves, launches executors, persists
//! transitions, rolls back on failure, resumes after interruption.
//!
//! Every leaf transition goes through a compare-and-swap in the backend, so
//! a restarted or duplicated driver cannot double-execute a phase or roll
//! the same phase back twice. The loop is context-driven: cancellation
//! stops new launches, waits a bounded time for in-flight executors, and
//! leaves `in_progress` states persisted for resume.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::errors::{EngineError, Result};
use crate::fsm::{ExecutorParams, ExecutorRegistry, FsmConfig, ProgressReporter, ProgressSink};
use crate::model::{OperationKey, OperationState, ProgressEntry};
use crate::plan::{OperationPlan, PhaseState};

/// Hook invoked after the final phase completes; tears down bootstrap
/// tunnels and marks the Hub-side operation complete.
#[async_trait]
pub trait PlanCompleteHook: Send + Sync {
    async fn on_plan_complete(&self, key: &OperationKey) -> Result<()>;
}

/// Terminal outcome of one driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmResult {
    Completed,
    Failed { phase: String, error: String },
    /// Cancelled mid-run; the operation is resumable.
    Cancelled,
}

pub struct FsmEngine {
    backend: Backend,
    key: OperationKey,
    registry: Arc<ExecutorRegistry>,
    progress: Arc<dyn ProgressSink>,
    config: FsmConfig,
    on_complete: Option<Arc<dyn PlanCompleteHook>>,
}

impl FsmEngine {
    pub fn new(
        backend: Backend,
        key: OperationKey,
        registry: Arc<ExecutorRegistry>,
        progress: Arc<dyn ProgressSink>,
        config: FsmConfig,
    ) -> Self {
        Self {
            backend,
            key,
            registry,
            progress,
            config,
            on_complete: None,
        }
    }

    pub fn with_complete_hook(mut self, hook: Arc<dyn PlanCompleteHook>) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Execute the persisted plan to a terminal state.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<FsmResult> {
        let mut plan = self.load_plan()?;
        self.ensure_deploying()?;
        self.drive(&mut plan, shutdown).await
    }

    /// Resume an interrupted operation: leaves persisted as `in_progress`
    /// are re-examined with their executor's `pre_check` and either
    /// credited as completed or reset to unstarted; failed and rolled-back
    /// leaves are reset for another attempt.
    pub async fn resume(&self, shutdown: watch::Receiver<bool>) -> Result<FsmResult> {
        let plan = self.load_plan()?;
        let (progress_tx, progress_rx) = mpsc::channel(256);
        let pump = self.spawn_progress_pump(progress_rx);

        for leaf in plan.leaves() {
            match leaf.state {
                PhaseState::InProgress => {
                    let params = self.params_for(&plan, &leaf.id, &progress_tx, &shutdown)?;
                    let executor = self.executor_for(&params)?;
                    let done = executor.pre_check(&params).await.unwrap_or(false);
                    let next = if done { PhaseState::Completed } else { PhaseState::Unstarted };
                    info!(op_id = %self.key.operation_id, phase = %leaf.id, ?next, "resuming phase");
                    self.backend.upsert_phase_state(&self.key, &leaf.id, next, None)?;
                }
                PhaseState::Failed | PhaseState::RolledBack => {
                    self.backend
                        .upsert_phase_state(&self.key, &leaf.id, PhaseState::Unstarted, None)?;
                }
                _ => {}
            }
        }
        drop(progress_tx);
        pump.await.ok();

        let mut plan = self.load_plan()?;
        self.drive(&mut plan, shutdown).await
    }

    /// Manually roll back a single completed phase.
    pub async fn rollback_phase(&self, phase_id: &str) -> Result<()> {
        let plan = self.load_plan()?;
        let (progress_tx, progress_rx) = mpsc::channel(64);
        let pump = self.spawn_progress_pump(progress_rx);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        // claim the transition first so concurrent drivers cannot roll the
        // same phase back twice
        self.backend.compare_and_swap_phase_state(
            &self.key,
            phase_id,
            PhaseState::Completed,
            PhaseState::RolledBack,
            None,
        )?;
        let params = self.params_for(&plan, phase_id, &progress_tx, &shutdown)?;
        let executor = self.executor_for(&params)?;
        let result = executor.rollback(&params).await;
        drop(progress_tx);
        pump.await.ok();
        result
    }

    async fn drive(
        &self,
        plan: &mut OperationPlan,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<FsmResult> {
        let total_leaves = plan.leaves().len().max(1);
        let (result_tx, mut result_rx) = mpsc::channel::<(String, Result<()>)>(total_leaves);
        let (progress_tx, progress_rx) = mpsc::channel::<ProgressEntry>(256);
        let pump = self.spawn_progress_pump(progress_rx);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));

        let mut in_flight: HashSet<String> = HashSet::new();
        let mut cancelled = *shutdown.borrow();
        let mut first_failure: Option<(String, String)> = None;

        let outcome = loop {
            if !cancelled && first_failure.is_none() {
                for leaf in plan.ready_leaves() {
                    if in_flight.contains(&leaf.id) {
                        continue;
                    }
                    let id = leaf.id.clone();
                    match self.backend.compare_and_swap_phase_state(
                        &self.key,
                        &id,
                        PhaseState::Unstarted,
                        PhaseState::InProgress,
                        None,
                    ) {
                        Ok(()) => {}
                        Err(e) if e.is_compare_failed() => {
                            debug!(phase = %id, "phase claimed by another driver");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    in_flight.insert(id.clone());
                    self.launch_leaf(plan, &id, &result_tx, &progress_tx, &shutdown, &semaphore)?;
                }
                // apply the in-progress marks after the borrow of ready_leaves
                for id in &in_flight {
                    plan.set_phase_state(id, PhaseState::InProgress, None).ok();
                }
            }

            if in_flight.is_empty() {
                if cancelled {
                    break FsmResult::Cancelled;
                }
                if let Some((phase, error)) = first_failure.take() {
                    self.rollback_failed_group(plan, &phase, &progress_tx, &shutdown).await;
                    break FsmResult::Failed { phase, error };
                }
                if plan.is_complete() {
                    break FsmResult::Completed;
                }
                if plan.ready_leaves().is_empty() {
                    return Err(EngineError::bad_parameter(
                        "plan stalled: no phase is ready and the plan is incomplete",
                    ));
                }
                continue;
            }

            tokio::select! {
                maybe = result_rx.recv() => {
                    let Some((id, result)) = maybe else { break FsmResult::Cancelled };
                    in_flight.remove(&id);
                    self.record_outcome(plan, &id, result, cancelled, &mut first_failure)?;
                }
                _ = shutdown.changed(), if !cancelled => {
                    info!(op_id = %self.key.operation_id, "cancellation requested");
                    cancelled = true;
                    self.drain_in_flight(plan, &mut in_flight, &mut result_rx, &mut first_failure).await?;
                }
            }
        };

        drop(result_tx);
        drop(progress_tx);
        pump.await.ok();
        self.finish(&outcome).await?;
        Ok(outcome)
    }

    fn launch_leaf(
        &self,
        plan: &OperationPlan,
        id: &str,
        result_tx: &mpsc::Sender<(String, Result<()>)>,
        progress_tx: &mpsc::Sender<ProgressEntry>,
        shutdown: &watch::Receiver<bool>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<()> {
        let params = self.params_for(plan, id, progress_tx, shutdown)?;
        let executor = self.executor_for(&params)?;
        let result_tx = result_tx.clone();
        let semaphore = semaphore.clone();
        let config = self.config.clone();
        let id = id.to_string();
        let op_id = self.key.operation_id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            info!(op_id = %op_id, phase = %id, "executing phase");
            let result = run_leaf(executor.as_ref(), &params, &config).await;
            if let Err(e) = &result {
                warn!(op_id = %op_id, phase = %id, error = %e, "phase failed");
            }
            let _ = result_tx.send((id, result)).await;
        });
        Ok(())
    }

    fn record_outcome(
        &self,
        plan: &mut OperationPlan,
        id: &str,
        result: Result<()>,
        cancelled: bool,
        first_failure: &mut Option<(String, String)>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.backend.compare_and_swap_phase_state(
                    &self.key,
                    id,
                    PhaseState::InProgress,
                    PhaseState::Completed,
                    None,
                )?;
                plan.set_phase_state(id, PhaseState::Completed, None)?;
            }
            Err(e) if cancelled => {
                // leave the phase in_progress for resume
                debug!(phase = %id, error = %e, "phase interrupted by cancellation");
            }
            Err(e) => {
                let message = e.to_string();
                self.backend.compare_and_swap_phase_state(
                    &self.key,
                    id,
                    PhaseState::InProgress,
                    PhaseState::Failed,
                    Some(&message),
                )?;
                plan.set_phase_state(id, PhaseState::Failed, Some(message.clone()))?;
                if first_failure.is_none() {
                    *first_failure = Some((id.to_string(), message));
                }
            }
        }
        Ok(())
    }

    /// Bounded wait for in-flight executors after cancellation. Executors
    /// that do not return in time are abandoned with their phases left
    /// `in_progress`.
    async fn drain_in_flight(
        &self,
        plan: &mut OperationPlan,
        in_flight: &mut HashSet<String>,
        result_rx: &mut mpsc::Receiver<(String, Result<()>)>,
        first_failure: &mut Option<(String, String)>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.cancel_wait;
        while !in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                Ok(Some((id, result))) => {
                    in_flight.remove(&id);
                    self.record_outcome(plan, &id, result, true, first_failure)?;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        op_id = %self.key.operation_id,
                        abandoned = ?in_flight,
                        "executors did not stop in time, abandoning"
                    );
                    in_flight.clear();
                }
            }
        }
        Ok(())
    }

    /// Roll back completed phases in the failed leaf's group, in reverse
    /// execution order. Rollback errors are collected, logged and do not
    /// stop the remaining rollbacks.
    async fn rollback_failed_group(
        &self,
        plan: &OperationPlan,
        failed_id: &str,
        progress_tx: &mpsc::Sender<ProgressEntry>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let mut errors = Vec::new();
        for target in plan.rollback_group(failed_id) {
            let claimed = self.backend.compare_and_swap_phase_state(
                &self.key,
                &target,
                PhaseState::Completed,
                PhaseState::RolledBack,
                None,
            );
            match claimed {
                Ok(()) => {}
                Err(e) if e.is_compare_failed() => continue,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            }
            let rolled = async {
                let params = self.params_for(plan, &target, progress_tx, shutdown)?;
                let executor = self.executor_for(&params)?;
                executor.rollback(&params).await
            }
            .await;
            if let Err(e) = rolled {
                error!(op_id = %self.key.operation_id, phase = %target, error = %e, "rollback failed");
                errors.push(e);
            }
        }
        if let Err(e) = EngineError::aggregate(errors) {
            error!(op_id = %self.key.operation_id, error = %e, "rollback finished with errors");
        }
    }

    async fn finish(&self, outcome: &FsmResult) -> Result<()> {
        match outcome {
            FsmResult::Completed => {
                self.transition_operation(true)?;
                let entry = ProgressEntry::completed(&self.key, "Operation has completed");
                self.progress.create_progress_entry(&entry).await.ok();
                if let Some(hook) = &self.on_complete {
                    hook.on_plan_complete(&self.key).await?;
                }
            }
            FsmResult::Failed { phase, error } => {
                self.transition_operation(false)?;
                let entry = ProgressEntry::failed(
                    &self.key,
                    0,
                    format!("Operation failed at phase {phase}: {error}"),
                );
                self.progress.create_progress_entry(&entry).await.ok();
            }
            FsmResult::Cancelled => {
                info!(op_id = %self.key.operation_id, "operation cancelled, resumable");
            }
        }
        Ok(())
    }

    /// Walk the operation to `install_deploying` (or the expand mirror) so
    /// phase execution starts from a consistent top-level state.
    fn ensure_deploying(&self) -> Result<()> {
        let mut op = self.backend.get_operation(&self.key)?;
        let target = OperationState::deploying_for(op.op_type);
        let track: &[OperationState] = if op.op_type == crate::model::OperationType::Expand {
            &[
                OperationState::Ready,
                OperationState::ExpandInitiated,
                OperationState::ExpandProvisioning,
                OperationState::ExpandDeploying,
            ]
        } else {
            &[
                OperationState::Ready,
                OperationState::InstallInitiated,
                OperationState::InstallProvisioning,
                OperationState::InstallDeploying,
            ]
        };
        let mut guard = 0;
        while op.state != target && !op.state.is_terminal() {
            let next = track.iter().copied().find(|s| op.state.can_transition_to(*s));
            let Some(next) = next else { break };
            match self.backend.compare_and_swap_operation_state(&mut op, next) {
                Ok(()) => {}
                Err(e) if e.is_compare_failed() => {
                    op = self.backend.get_operation(&self.key)?;
                }
                Err(e) => return Err(e),
            }
            guard += 1;
            if guard > 16 {
                break;
            }
        }
        Ok(())
    }

    fn transition_operation(&self, success: bool) -> Result<()> {
        let mut op = self.backend.get_operation(&self.key)?;
        let next = if success {
            OperationState::completed_for(op.op_type)
        } else {
            OperationState::failed_for(op.op_type)
        };
        match self.backend.compare_and_swap_operation_state(&mut op, next) {
            Ok(()) => Ok(()),
            // a replayed plan may find the operation already terminal
            Err(e) if e.is_compare_failed() && op.state.is_terminal() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn load_plan(&self) -> Result<OperationPlan> {
        let mut plan = self.backend.get_plan(&self.key)?;
        for record in self.backend.list_phase_states(&self.key)? {
            plan.set_phase_state(&record.phase_id, record.state, record.error.clone())
                .ok();
        }
        Ok(plan)
    }

    fn params_for(
        &self,
        plan: &OperationPlan,
        phase_id: &str,
        progress_tx: &mpsc::Sender<ProgressEntry>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ExecutorParams> {
        let phase = plan
            .get_phase(phase_id)
            .ok_or_else(|| EngineError::not_found(format!("phase {phase_id}")))?
            .clone();
        Ok(ExecutorParams {
            plan: Arc::new(plan.clone()),
            phase,
            progress: ProgressReporter::new(self.key.clone(), phase_id, progress_tx.clone()),
            shutdown: shutdown.clone(),
        })
    }

    fn executor_for(&self, params: &ExecutorParams) -> Result<Box<dyn super::PhaseExecutor>> {
        let factory = self.registry.resolve(&params.phase.id).ok_or_else(|| {
            EngineError::bad_parameter(format!("no executor matches phase {}", params.phase.id))
        })?;
        factory(params)
    }

    /// Forward deduplicated progress entries to the sink.
    fn spawn_progress_pump(
        &self,
        mut rx: mpsc::Receiver<ProgressEntry>,
    ) -> tokio::task::JoinHandle<()> {
        let sink = self.progress.clone();
        tokio::spawn(async move {
            let mut last: Option<ProgressEntry> = None;
            while let Some(entry) = rx.recv().await {
                if last.as_ref().is_some_and(|prev| prev.same_as(&entry)) {
                    continue;
                }
                if let Err(e) = sink.create_progress_entry(&entry).await {
                    warn!(error = %e, "failed to record progress entry");
                }
                last = Some(entry);
            }
        })
    }
}

/// Execute one leaf with the retry budget: `pre_check` short-circuits
/// already-done work, transient errors back off exponentially, and
/// cancellation aborts the budget.
async fn run_leaf(
    executor: &dyn super::PhaseExecutor,
    params: &ExecutorParams,
    config: &FsmConfig,
) -> Result<()> {
    if executor.pre_check(params).await? {
        debug!(phase = %params.phase.id, "pre-check passed, skipping execution");
        return Ok(());
    }
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match executor.execute(params).await {
            Ok(()) => {
                executor.post_check(params).await?;
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < config.retry_attempts => {
                let exp = config.retry_base.saturating_mul(1u32 << (attempt - 1).min(16));
                let delay = exp.min(config.retry_cap);
                warn!(
                    phase = %params.phase.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                let mut shutdown = params.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        return Err(EngineError::retry(format!(
                            "phase {} cancelled during retry backoff", params.phase.id
                        )));
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl ProgressSink for Backend {
    async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        Backend::create_progress_entry(self, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Db;
    use crate::fsm::{ExecutorFactory, PhaseExecutor};
    use crate::model::{DnsConfig, Operation, OperationType};
    use crate::plan::OperationPhase;
    use std::sync::Mutex;

    /// Records invocations and fails on demand.
    struct ScriptedExecutor {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
        transient_failures: Arc<Mutex<u32>>,
        done: Arc<Mutex<HashSet<String>>>,
    }

    #[async_trait]
    impl PhaseExecutor for ScriptedExecutor {
        async fn pre_check(&self, params: &ExecutorParams) -> Result<bool> {
            Ok(self.done.lock().unwrap().contains(&params.phase.id))
        }

        async fn execute(&self, params: &ExecutorParams) -> Result<()> {
            {
                let mut remaining = self.transient_failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::retry("flaky"));
                }
            }
            if self.fail_on.as_deref() == Some(params.phase.id.as_str()) {
                return Err(EngineError::bad_parameter("scripted failure"));
            }
            self.log.lock().unwrap().push(format!("execute {}", params.phase.id));
            self.done.lock().unwrap().insert(params.phase.id.clone());
            Ok(())
        }

        async fn rollback(&self, params: &ExecutorParams) -> Result<()> {
            self.log.lock().unwrap().push(format!("rollback {}", params.phase.id));
            self.done.lock().unwrap().remove(&params.phase.id);
            Ok(())
        }
    }

    struct Fixture {
        backend: Backend,
        key: OperationKey,
        log: Arc<Mutex<Vec<String>>>,
        done: Arc<Mutex<HashSet<String>>>,
    }

    fn fixture(phases: Vec<OperationPhase>, fail_on: Option<&str>, transient: u32) -> (Fixture, FsmEngine) {
        let backend = Backend::new(Db::in_memory().unwrap());
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        op.state = OperationState::InstallDeploying;
        backend.upsert_operation(&op).unwrap();
        let key = op.key();

        let plan = OperationPlan {
            operation_id: key.operation_id.clone(),
            operation_type: OperationType::Install,
            account_id: key.account_id.clone(),
            cluster_name: key.site_domain.clone(),
            servers: Vec::new(),
            dns_config: DnsConfig::default(),
            phases,
        };
        plan.validate().unwrap();
        backend.create_plan(&key, &plan).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(HashSet::new()));
        let transient_failures = Arc::new(Mutex::new(transient));

        let mut registry = ExecutorRegistry::new();
        let log_c = log.clone();
        let done_c = done.clone();
        let fail_on = fail_on.map(|s| s.to_string());
        let factory: ExecutorFactory = Arc::new(move |_params| {
            Ok(Box::new(ScriptedExecutor {
                log: log_c.clone(),
                fail_on: fail_on.clone(),
                transient_failures: transient_failures.clone(),
                done: done_c.clone(),
            }) as Box<dyn PhaseExecutor>)
        });
        registry.register_prefix("/", factory);

        let config = FsmConfig {
            retry_base: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let engine = FsmEngine::new(
            backend.clone(),
            key.clone(),
            Arc::new(registry),
            Arc::new(backend.clone()),
            config,
        );
        (Fixture { backend, key, log, done }, engine)
    }

    fn leaf(id: &str, requires: &[&str]) -> OperationPhase {
        OperationPhase::new(id).with_requires(requires)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive for the duration of the test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn linear_plan_runs_in_order() {
        let (fx, engine) = fixture(
            vec![leaf("/init", &[]), leaf("/checks", &["/init"]), leaf("/configure", &["/checks"])],
            None,
            0,
        );
        let result = engine.run(no_shutdown()).await.unwrap();
        assert_eq!(result, FsmResult::Completed);
        assert_eq!(
            *fx.log.lock().unwrap(),
            vec!["execute /init", "execute /checks", "execute /configure"]
        );
        let op = fx.backend.get_operation(&fx.key).unwrap();
        assert_eq!(op.state, OperationState::InstallCompleted);
        let last = fx.backend.last_progress_entry(&fx.key).unwrap().unwrap();
        assert_eq!(last.completion, 100);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (fx, engine) = fixture(vec![leaf("/init", &[])], None, 2);
        let result = engine.run(no_shutdown()).await.unwrap();
        assert_eq!(result, FsmResult::Completed);
        assert_eq!(fx.log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_rolls_back_completed_group_siblings() {
        let (fx, engine) = fixture(
            vec![OperationPhase::new("/pull").with_parallel(true).with_children(vec![
                leaf("/pull/node-1", &[]),
                leaf("/pull/node-2", &["/pull/node-1"]),
            ])],
            Some("/pull/node-2"),
            0,
        );
        let result = engine.run(no_shutdown()).await.unwrap();
        assert!(matches!(result, FsmResult::Failed { ref phase, .. } if phase == "/pull/node-2"));
        assert!(fx.log.lock().unwrap().contains(&"rollback /pull/node-1".to_string()));

        let op = fx.backend.get_operation(&fx.key).unwrap();
        assert_eq!(op.state, OperationState::InstallFailed);
        let states = fx.backend.list_phase_states(&fx.key).unwrap();
        let rolled = states.iter().find(|s| s.phase_id == "/pull/node-1").unwrap();
        assert_eq!(rolled.state, PhaseState::RolledBack);
    }

    #[tokio::test]
    async fn replay_of_completed_plan_skips_all_work() {
        let (fx, engine) = fixture(vec![leaf("/init", &[]), leaf("/checks", &["/init"])], None, 0);
        assert_eq!(engine.run(no_shutdown()).await.unwrap(), FsmResult::Completed);
        let executed = fx.log.lock().unwrap().len();

        // reset persisted states to unstarted and replay: pre_check sees
        // the work is already done and performs no side effects
        for leaf_id in ["/init", "/checks"] {
            fx.backend
                .upsert_phase_state(&fx.key, leaf_id, PhaseState::Unstarted, None)
                .unwrap();
        }
        assert_eq!(engine.run(no_shutdown()).await.unwrap(), FsmResult::Completed);
        assert_eq!(fx.log.lock().unwrap().len(), executed, "replay executed phases again");
    }

    #[tokio::test]
    async fn resume_resets_interrupted_phases() {
        let (fx, engine) = fixture(vec![leaf("/init", &[]), leaf("/checks", &["/init"])], None, 0);
        // simulate a crash mid-phase: /init persisted as in_progress but
        // not observably done
        fx.backend
            .upsert_phase_state(&fx.key, "/init", PhaseState::InProgress, None)
            .unwrap();
        let result = engine.resume(no_shutdown()).await.unwrap();
        assert_eq!(result, FsmResult::Completed);
        assert_eq!(fx.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resume_credits_observably_done_phases() {
        let (fx, engine) = fixture(vec![leaf("/init", &[]), leaf("/checks", &["/init"])], None, 0);
        fx.done.lock().unwrap().insert("/init".to_string());
        fx.backend
            .upsert_phase_state(&fx.key, "/init", PhaseState::InProgress, None)
            .unwrap();
        let result = engine.resume(no_shutdown()).await.unwrap();
        assert_eq!(result, FsmResult::Completed);
        // only /checks actually executed
        assert_eq!(*fx.log.lock().unwrap(), vec!["execute /checks"]);
    }

    #[tokio::test]
    async fn cancellation_leaves_resumable_state() {
        let (fx, engine) = fixture(vec![leaf("/init", &[])], None, 0);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = engine.run(rx).await.unwrap();
        assert_eq!(result, FsmResult::Cancelled);
        // nothing executed, operation not terminal
        assert!(fx.log.lock().unwrap().is_empty());
        let op = fx.backend.get_operation(&fx.key).unwrap();
        assert!(!op.state.is_terminal());
    }

    #[tokio::test]
    async fn unmatched_phase_is_a_configuration_error() {
        let backend = Backend::new(Db::in_memory().unwrap());
        let mut op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        op.state = OperationState::InstallDeploying;
        backend.upsert_operation(&op).unwrap();
        let key = op.key();
        let plan = OperationPlan {
            operation_id: key.operation_id.clone(),
            operation_type: OperationType::Install,
            account_id: key.account_id.clone(),
            cluster_name: key.site_domain.clone(),
            servers: Vec::new(),
            dns_config: DnsConfig::default(),
            phases: vec![leaf("/mystery", &[])],
        };
        backend.create_plan(&key, &plan).unwrap();

        let engine = FsmEngine::new(
            backend.clone(),
            key,
            Arc::new(ExecutorRegistry::new()),
            Arc::new(backend.clone()),
            FsmConfig::default(),
        );
        let err = engine.run(no_shutdown()).await.unwrap_err();
        assert!(err.to_string().contains("no executor"));
    }
}
