//! The workflow engine: admission, scheduling, resumption, finalization.
//!
//! The engine composes every other component and is referenced by none of
//! them. Workers cooperatively drive step state machines; the persistent
//! store is the only authority between transitions, and a per-workflow lease
//! keeps two engine instances from driving the same workflow.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::evidence::EvidenceBuilder;
use crate::evidence::storage::EvidenceStorage;
use crate::chain::ChainAdapter;
use crate::guards::{InvariantViolation, markers};
use crate::ids::{SignerAddress, WorkflowId};
use crate::metrics::{MetricEvent, MetricsSink};
use crate::nonce::{NonceSerializer, PendingChainSlot};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::signer::SignerRegistry;
use crate::step::{RetryPolicy, Step, StepClass, StepCtx, StepError};
use crate::steps::{
    self, AWAIT_RECEIPT, RECONCILE, RECORD_RESULT, ReceiptOutput, SUBMIT_TX, SubmitOutput,
};
use crate::store::{Page, StoreError, WorkflowFilter, WorkflowStore};
use crate::workflow::{
    StepRecord, StepState, WorkflowInput, WorkflowKind, WorkflowRecord, WorkflowState,
};

/// How repeated chain-RPC failures classify once a step's retries exhaust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutageClass {
    /// Keep retrying until the budget runs out, then stall (default).
    #[default]
    Retry,
    /// Stall on the first chain outage instead of burning retries.
    Stall,
}

/// Per-kind admission caps.
#[derive(Debug, Clone, Copy)]
pub struct KindLimits {
    pub work_submission: u32,
    pub score_submission: u32,
    pub close_epoch: u32,
}

impl KindLimits {
    pub fn limit(&self, kind: WorkflowKind) -> u32 {
        match kind {
            WorkflowKind::WorkSubmission => self.work_submission,
            WorkflowKind::ScoreSubmission => self.score_submission,
            WorkflowKind::CloseEpoch => self.close_epoch,
        }
    }
}

/// Engine tunables, resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_workflows_total: u32,
    pub max_per_kind: KindLimits,
    /// Per-attempt wall-clock budget for a step.
    pub step_timeout: Duration,
    /// Default retry policy; individual steps may tighten it.
    pub retry: RetryPolicy,
    /// Maximum age of a reconciliation stamp at submission time.
    pub reconcile_staleness: ChronoDuration,
    /// Interval of the stalled-workflow sweep.
    pub reconcile_sweep: Duration,
    /// How long `AwaitReceipt` polls before declaring the receipt missing.
    pub receipt_timeout: Duration,
    /// Global driver concurrency.
    pub workers: usize,
    pub chain_outage_class: OutageClass,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workflows_total: 256,
            max_per_kind: KindLimits {
                work_submission: 128,
                score_submission: 128,
                close_epoch: 16,
            },
            step_timeout: Duration::from_millis(120_000),
            retry: RetryPolicy::default(),
            reconcile_staleness: ChronoDuration::milliseconds(60_000),
            reconcile_sweep: Duration::from_millis(30_000),
            receipt_timeout: Duration::from_millis(60_000),
            workers: 8,
            chain_outage_class: OutageClass::Retry,
        }
    }
}

/// Everything the steps and the engine operate through. Constructed once at
/// startup; no global singletons.
pub struct Components {
    pub store: Arc<dyn WorkflowStore>,
    pub chain: Arc<dyn ChainAdapter>,
    pub storage: Arc<dyn EvidenceStorage>,
    pub evidence: EvidenceBuilder,
    pub signers: Arc<dyn SignerRegistry>,
    pub nonce: Arc<NonceSerializer>,
    pub reconciler: Reconciler,
    pub metrics: Arc<dyn MetricsSink>,
    pub settings: EngineSettings,
}

/// User-visible error surface. `STALLED` is deliberately absent: a stalled
/// workflow is a state to query, not an error.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown workflow type {0:?}")]
    FrozenTypeViolation(String),
    #[error("signer {0} is not registered")]
    SignerNotFound(SignerAddress),
    #[error("{scope} quota exceeded (limit {limit})")]
    QuotaExceeded { scope: String, limit: u32 },
    #[error("invalid workflow input: {0}")]
    InvalidInput(String),
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl GatewayError {
    /// Error kind per the taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::FrozenTypeViolation(_)
            | GatewayError::SignerNotFound(_)
            | GatewayError::QuotaExceeded { .. }
            | GatewayError::InvalidInput(_) => "admission",
            GatewayError::WorkflowNotFound(_) => "not_found",
            GatewayError::Store(_) => "storage",
            GatewayError::Invariant(_) => "invariant",
        }
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::FrozenTypeViolation(_) => "FROZEN_TYPE_VIOLATION",
            GatewayError::SignerNotFound(_) => "SIGNER_NOT_FOUND",
            GatewayError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            GatewayError::InvalidInput(_) => "INVALID_INPUT",
            GatewayError::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            GatewayError::Store(_) => "STORE_UNAVAILABLE",
            GatewayError::Invariant(violation) => violation.invariant,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::QuotaExceeded { .. } | GatewayError::Store(StoreError::Unavailable(_))
        )
    }
}

/// Read-only workflow view returned by the query interface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub workflow_id: WorkflowId,
    #[serde(rename = "type")]
    pub kind: WorkflowKind,
    pub signer: SignerAddress,
    pub state: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::workflow::WorkflowResult>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<WorkflowRecord> for WorkflowStatus {
    fn from(w: WorkflowRecord) -> Self {
        Self {
            workflow_id: w.id,
            kind: w.kind,
            signer: w.signer,
            state: w.state,
            current_step: w.current_step,
            attempt_count: w.attempt_count,
            stall_reason: w.stall_reason,
            error_code: w.error_code,
            result: w.result,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

struct EngineInner {
    components: Components,
    semaphore: Arc<Semaphore>,
    /// Lease owner identity of this engine instance.
    instance: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// The workflow engine. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(components: Components) -> Self {
        let workers = components.settings.workers.max(1);
        Self {
            inner: Arc::new(EngineInner {
                components,
                semaphore: Arc::new(Semaphore::new(workers)),
                instance: format!("engine-{}", uuid::Uuid::new_v4()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Boot: recover persisted workflows, then start the periodic sweep.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.recover().await?;
        self.spawn_sweep();
        Ok(())
    }

    /// Stops the sweep and waits for in-flight drivers to reach their next
    /// persisted transition.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Admits a workflow from raw wire values.
    pub async fn submit_raw(
        &self,
        kind: &str,
        signer: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowId, GatewayError> {
        let kind = match crate::guards::assert_frozen_workflow_kind(kind) {
            Ok(kind) => kind,
            Err(violation) => {
                self.inner.components.metrics.emit(&MetricEvent::AdmissionRejected {
                    kind: None,
                    code: "FROZEN_TYPE_VIOLATION",
                });
                return Err(GatewayError::FrozenTypeViolation(violation.details));
            }
        };
        let signer = SignerAddress::parse(signer)
            .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
        self.submit(kind, signer, input).await
    }

    /// Admits a typed workflow: frozen-kind is statically guaranteed, signer
    /// existence and quotas are checked here. There is no implicit queueing:
    /// a rejected workflow is never created.
    pub async fn submit(
        &self,
        kind: WorkflowKind,
        signer: SignerAddress,
        input: serde_json::Value,
    ) -> Result<WorkflowId, GatewayError> {
        markers::orchestration_only();
        markers::assert_no_offchain_inference();
        let components = &self.inner.components;

        if !components.signers.is_available(&signer) {
            components.metrics.emit(&MetricEvent::AdmissionRejected {
                kind: Some(kind),
                code: "SIGNER_NOT_FOUND",
            });
            return Err(GatewayError::SignerNotFound(signer));
        }

        let active = components.store.count_active().await?;
        if active >= components.settings.max_workflows_total as u64 {
            components.metrics.emit(&MetricEvent::AdmissionRejected {
                kind: Some(kind),
                code: "QUOTA_EXCEEDED",
            });
            return Err(GatewayError::QuotaExceeded {
                scope: "global".to_string(),
                limit: components.settings.max_workflows_total,
            });
        }
        let kind_limit = components.settings.max_per_kind.limit(kind);
        let active_of_kind = components.store.count_active_by_kind(kind).await?;
        if active_of_kind >= kind_limit as u64 {
            components.metrics.emit(&MetricEvent::AdmissionRejected {
                kind: Some(kind),
                code: "QUOTA_EXCEEDED",
            });
            return Err(GatewayError::QuotaExceeded {
                scope: kind.to_string(),
                limit: kind_limit,
            });
        }

        let input = parse_input(kind, input)?;
        let workflow = WorkflowRecord::admit(signer, input);
        components.store.create(&workflow).await?;
        components.metrics.emit(&MetricEvent::WorkflowCreated {
            workflow: workflow.id,
            kind,
        });
        tracing::info!(workflow_id = %workflow.id, %kind, %signer, "workflow admitted");

        self.spawn_driver(workflow.id);
        Ok(workflow.id)
    }

    /// Read-only query against the store.
    pub async fn get(&self, id: WorkflowId) -> Result<WorkflowStatus, GatewayError> {
        let workflow = self
            .inner
            .components
            .store
            .load(id)
            .await?
            .ok_or(GatewayError::WorkflowNotFound(id))?;
        Ok(workflow.into())
    }

    /// Paginated listing.
    pub async fn list(
        &self,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<WorkflowStatus>, GatewayError> {
        let workflows = self.inner.components.store.list(&filter, page).await?;
        Ok(workflows.into_iter().map(Into::into).collect())
    }

    /// Moves a stalled workflow back to `RUNNING` after reconciliation.
    /// Idempotent: resuming a workflow that is not stalled is a no-op.
    pub async fn resume(&self, id: WorkflowId) -> Result<WorkflowStatus, GatewayError> {
        let components = &self.inner.components;
        let mut workflow = components
            .store
            .load(id)
            .await?
            .ok_or(GatewayError::WorkflowNotFound(id))?;
        if workflow.is_terminal() {
            return Ok(workflow.into());
        }
        if workflow.state == WorkflowState::Stalled {
            self.inner.reconcile_and_apply(&mut workflow).await;
            if !workflow.is_terminal() {
                components
                    .metrics
                    .emit(&MetricEvent::WorkflowResumed { workflow: id });
                self.spawn_driver(id);
            }
        } else {
            // CREATED or RUNNING: make sure a driver exists, e.g. after the
            // admitting instance died before driving.
            self.spawn_driver(id);
        }
        self.get(id).await
    }

    /// Boot recovery: restore signer slots from persisted pending hashes,
    /// reconcile every non-terminal workflow, and re-drive the live ones.
    pub async fn recover(&self) -> Result<(), GatewayError> {
        let components = &self.inner.components;
        let workflows = components.store.list_non_terminal().await?;
        for workflow in &workflows {
            if let Some(tx_hash) = workflow.pending_tx_hash {
                components.nonce.restore(
                    workflow.signer,
                    PendingChainSlot {
                        workflow: workflow.id,
                        tx_hash: Some(tx_hash),
                        acquired_at: workflow.submitted_at.unwrap_or_else(Utc::now),
                    },
                );
            }
        }
        for mut workflow in workflows {
            self.inner.reconcile_and_apply(&mut workflow).await;
            match workflow.state {
                WorkflowState::Created | WorkflowState::Running => {
                    self.spawn_driver(workflow.id);
                }
                // Stalled workflows wait for the sweep or an operator.
                _ => {}
            }
        }
        Ok(())
    }

    fn spawn_driver(&self, id: WorkflowId) {
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("workflow", workflow_id = %id);
        self.inner.tracker.spawn(
            async move {
                let permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                inner.drive(id).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    fn spawn_sweep(&self) {
        let inner = Arc::clone(&self.inner);
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(inner.components.settings.reconcile_sweep);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                engine.sweep_once().await;
            }
        });
    }

    /// One pass of the periodic sweep: resume stalled workflows and re-claim
    /// running workflows whose driver died.
    pub async fn sweep_once(&self) {
        let components = &self.inner.components;
        match components.store.list_by_state(WorkflowState::Stalled).await {
            Ok(stalled) => {
                for workflow in stalled {
                    if let Err(err) = self.resume(workflow.id).await {
                        tracing::warn!(workflow_id = %workflow.id, error = %err, "sweep resume failed");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "sweep could not list stalled workflows"),
        }
        let stale_cutoff = Utc::now()
            - ChronoDuration::from_std(self.inner.lease_duration())
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        match components.store.list_stuck(stale_cutoff).await {
            Ok(stuck) => {
                for workflow in stuck {
                    tracing::warn!(workflow_id = %workflow.id, "re-driving abandoned workflow");
                    self.spawn_driver(workflow.id);
                }
            }
            Err(err) => tracing::warn!(error = %err, "sweep could not list stuck workflows"),
        }
    }
}

fn parse_input(
    kind: WorkflowKind,
    input: serde_json::Value,
) -> Result<WorkflowInput, GatewayError> {
    let parsed = match kind {
        WorkflowKind::WorkSubmission => serde_json::from_value(input)
            .map(WorkflowInput::WorkSubmission)
            .map_err(|e| GatewayError::InvalidInput(e.to_string()))?,
        WorkflowKind::ScoreSubmission => serde_json::from_value(input)
            .map(WorkflowInput::ScoreSubmission)
            .map_err(|e| GatewayError::InvalidInput(e.to_string()))?,
        WorkflowKind::CloseEpoch => serde_json::from_value(input)
            .map(WorkflowInput::CloseEpoch)
            .map_err(|e| GatewayError::InvalidInput(e.to_string()))?,
    };
    Ok(parsed)
}

impl EngineInner {
    fn lease_duration(&self) -> Duration {
        // Long enough to cover a full step attempt plus its receipt wait.
        self.components.settings.step_timeout * 2 + self.components.settings.receipt_timeout
    }

    async fn claim_lease(&self, id: WorkflowId) -> bool {
        let until = Utc::now()
            + ChronoDuration::from_std(self.lease_duration())
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        match self.components.store.claim(id, &self.instance, until).await {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::warn!(workflow_id = %id, error = %err, "lease claim failed");
                false
            }
        }
    }

    /// Applies a reconciliation outcome to a workflow that is about to be
    /// resumed: short-circuit past an already-landed submission, fail a
    /// revert, or rewind a vanished transaction back to `Reconcile`.
    async fn reconcile_and_apply(&self, workflow: &mut WorkflowRecord) {
        let components = &self.components;
        let outcome = match components.reconciler.reconcile(workflow).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(workflow_id = %workflow.id, error = %err, "reconciliation failed; will retry on next sweep");
                return;
            }
        };
        match outcome {
            ReconcileOutcome::Proceed | ReconcileOutcome::StillPending => {}
            ReconcileOutcome::AlreadyConfirmed(receipt) => {
                // The submission landed while we were away: seed the
                // submission steps as succeeded and jump to RecordResult.
                let submit = StepRecord {
                    workflow_id: workflow.id,
                    name: SUBMIT_TX.to_string(),
                    state: StepState::Succeeded,
                    attempt: 1,
                    last_error: None,
                    started_at: Some(Utc::now()),
                    completed_at: Some(Utc::now()),
                    output: Some(serde_json::json!(SubmitOutput {
                        tx_hash: receipt.tx_hash,
                        skipped: true,
                    })),
                };
                let await_receipt = StepRecord {
                    name: AWAIT_RECEIPT.to_string(),
                    output: Some(serde_json::json!(ReceiptOutput {
                        tx_hash: receipt.tx_hash,
                        block_number: receipt.block_number,
                        log_count: receipt.log_count,
                    })),
                    ..submit.clone()
                };
                workflow.current_step = Some(RECORD_RESULT.to_string());
                workflow.state = WorkflowState::Running;
                workflow.stall_reason = None;
                let result = async {
                    components.store.savepoint(&submit).await?;
                    components.store.savepoint(&await_receipt).await?;
                    components.store.update(workflow).await
                }
                .await;
                if let Err(err) = result {
                    tracing::warn!(workflow_id = %workflow.id, error = %err, "failed to apply confirmed reconciliation");
                }
                components.metrics.emit(&MetricEvent::TxConfirmed {
                    workflow: workflow.id,
                    tx: receipt.tx_hash,
                });
            }
            ReconcileOutcome::Reverted { reason } => match reason {
                Some(reason) => {
                    self.finalize_failed(workflow, &reason).await;
                }
                None => {
                    self.finalize_stalled(workflow, "REVERT_UNKNOWN").await;
                }
            },
            ReconcileOutcome::NotFound => {
                // The submission vanished; rewind to Reconcile so the next
                // drive re-submits with a fresh stamp.
                for name in [SUBMIT_TX, AWAIT_RECEIPT] {
                    if steps::step_index(workflow.kind, name).is_some() {
                        let reset = StepRecord::pending(workflow.id, name);
                        if let Err(err) = components.store.savepoint(&reset).await {
                            tracing::warn!(workflow_id = %workflow.id, error = %err, "failed to reset step");
                        }
                    }
                }
                workflow.current_step = Some(RECONCILE.to_string());
                if let Err(err) = components.store.update(workflow).await {
                    tracing::warn!(workflow_id = %workflow.id, error = %err, "failed to rewind workflow");
                }
            }
        }
    }

    /// Drops a signer slot held by this workflow with nothing submitted on
    /// it. A slot carrying a recorded transaction stays held; only
    /// reconciliation may decide that transaction's fate.
    fn release_unsent_slot(&self, workflow: &WorkflowRecord) {
        let nonce = &self.components.nonce;
        if let Some(slot) = nonce.pending(&workflow.signer)
            && slot.workflow == workflow.id
            && slot.tx_hash.is_none()
        {
            nonce.release(&workflow.signer);
        }
    }

    async fn finalize_failed(&self, workflow: &mut WorkflowRecord, code: &str) {
        self.release_unsent_slot(workflow);
        workflow.state = WorkflowState::Failed;
        workflow.error_code = Some(code.to_string());
        workflow.stall_reason = None;
        if let Err(err) = self.components.store.update(workflow).await {
            tracing::error!(workflow_id = %workflow.id, error = %err, "failed to persist FAILED state");
            return;
        }
        self.components.metrics.emit(&MetricEvent::WorkflowFailed {
            workflow: workflow.id,
            code: code.to_string(),
        });
        tracing::error!(workflow_id = %workflow.id, code, "workflow failed");
    }

    async fn finalize_stalled(&self, workflow: &mut WorkflowRecord, reason: &str) {
        self.release_unsent_slot(workflow);
        workflow.state = WorkflowState::Stalled;
        workflow.stall_reason = Some(reason.to_string());
        if let Err(err) = self.components.store.update(workflow).await {
            tracing::error!(workflow_id = %workflow.id, error = %err, "failed to persist STALLED state");
            return;
        }
        self.components.metrics.emit(&MetricEvent::WorkflowStalled {
            workflow: workflow.id,
            reason: reason.to_string(),
        });
        tracing::warn!(workflow_id = %workflow.id, reason, "workflow stalled");
    }

    /// Drives a workflow from its current step to a terminal state, a stall,
    /// or a lost lease.
    async fn drive(&self, id: WorkflowId) {
        if !self.claim_lease(id).await {
            return;
        }
        let components = &self.components;
        let mut workflow = match components.store.load(id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(workflow_id = %id, error = %err, "driver could not load workflow");
                return;
            }
        };
        if workflow.is_terminal() {
            let _ = components.store.release(id, &self.instance).await;
            return;
        }

        let previous_state = workflow.state;
        workflow.state = WorkflowState::Running;
        workflow.stall_reason = None;
        if let Err(err) = components.store.update(&workflow).await {
            tracing::warn!(workflow_id = %id, error = %err, "driver could not start workflow");
            return;
        }
        if previous_state == WorkflowState::Created {
            components
                .metrics
                .emit(&MetricEvent::WorkflowStarted { workflow: id });
        }

        let steps = steps::steps_for(workflow.kind);
        let mut records = match self.load_step_records(id).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "driver could not load steps");
                return;
            }
        };
        let mut outputs: HashMap<String, serde_json::Value> = records
            .values()
            .filter(|r| r.state == StepState::Succeeded)
            .filter_map(|r| r.output.clone().map(|o| (r.name.clone(), o)))
            .collect();

        let mut index = workflow
            .current_step
            .as_deref()
            .and_then(|name| steps::step_index(workflow.kind, name))
            .unwrap_or(0);
        // Skip steps that already succeeded (crash between savepoint and
        // position update).
        while index < steps.len()
            && records
                .get(steps[index].name())
                .is_some_and(|r| r.state == StepState::Succeeded)
        {
            index += 1;
        }

        'sequence: while index < steps.len() {
            let step = steps[index];
            let name = step.name();
            workflow.current_step = Some(name.to_string());
            if let Err(err) = components.store.update(&workflow).await {
                tracing::warn!(error = %err, "driver could not persist position");
                break 'sequence;
            }
            if !self.claim_lease(id).await {
                tracing::warn!("lost workflow lease; abandoning drive");
                return;
            }

            let mut record = records
                .get(name)
                .cloned()
                .unwrap_or_else(|| StepRecord::pending(id, name));
            let policy = step.retry_policy(components.settings.retry);
            let timeout = step.timeout().unwrap_or(components.settings.step_timeout);
            components.metrics.emit(&MetricEvent::StepStarted {
                workflow: id,
                step: name,
            });
            tracing::debug!(
                step = name,
                key = %crate::step::idempotency_key(id, name),
                "step started"
            );

            let mut attempts_this_run: u32 = 0;
            loop {
                record.attempt += 1;
                attempts_this_run += 1;
                record.state = StepState::Running;
                record.started_at = Some(Utc::now());
                workflow.attempt_count += 1;
                if let Err(err) = components.store.savepoint(&record).await {
                    tracing::warn!(error = %err, step = name, "savepoint failed");
                    break 'sequence;
                }

                let mut ctx = StepCtx {
                    workflow: &mut workflow,
                    components,
                    outputs: outputs.clone(),
                };
                let attempt = tokio::time::timeout(timeout, step.run(&mut ctx)).await;

                // Persist whatever the step did to the record before acting
                // on the outcome; crash-safety lives in the store.
                if let Err(err) = components.store.update(&workflow).await {
                    tracing::warn!(error = %err, step = name, "workflow persist failed");
                    break 'sequence;
                }

                match attempt {
                    Err(_elapsed) => {
                        components.metrics.emit(&MetricEvent::StepTimedOut {
                            workflow: id,
                            step: name,
                        });
                        record.state = StepState::Stalled;
                        record.last_error =
                            Some(format!("attempt exceeded {}ms", timeout.as_millis()));
                        let _ = components.store.savepoint(&record).await;
                        self.finalize_stalled(&mut workflow, "STEP_TIMEOUT").await;
                        break 'sequence;
                    }
                    Ok(Ok(output)) => {
                        record.state = StepState::Succeeded;
                        record.completed_at = Some(Utc::now());
                        record.output = Some(output.clone());
                        record.last_error = None;
                        if let Err(err) = components.store.savepoint(&record).await {
                            tracing::warn!(error = %err, step = name, "savepoint failed");
                            break 'sequence;
                        }
                        components.metrics.emit(&MetricEvent::StepCompleted {
                            workflow: id,
                            step: name,
                            attempt: record.attempt,
                        });
                        outputs.insert(name.to_string(), output);
                        records.insert(name.to_string(), record);
                        index += 1;
                        continue 'sequence;
                    }
                    Ok(Err(error)) => {
                        let class = self.effective_class(&error);
                        record.last_error = Some(error.to_string());
                        match class {
                            StepClass::Retry if attempts_this_run < policy.max_attempts => {
                                record.state = StepState::Retrying;
                                if let Err(err) = components.store.savepoint(&record).await {
                                    tracing::warn!(error = %err, step = name, "savepoint failed");
                                    break 'sequence;
                                }
                                components.metrics.emit(&MetricEvent::StepRetried {
                                    workflow: id,
                                    step: name,
                                    attempt: record.attempt,
                                });
                                tracing::warn!(
                                    step = name,
                                    attempt = record.attempt,
                                    error = %error,
                                    "step retrying"
                                );
                                tokio::time::sleep(policy.delay(record.attempt)).await;
                                if error.needs_reconciliation() {
                                    // Fresh chain truth before the re-run.
                                    if let Some(reconcile_index) =
                                        steps::step_index(workflow.kind, RECONCILE)
                                    {
                                        records.insert(name.to_string(), record);
                                        index = reconcile_index;
                                        continue 'sequence;
                                    }
                                }
                                continue;
                            }
                            StepClass::Retry => {
                                // Retry budget exhausted; truth unknown, so
                                // stall rather than fail.
                                record.state = StepState::Stalled;
                                let _ = components.store.savepoint(&record).await;
                                self.finalize_stalled(&mut workflow, "RETRY_EXHAUSTED").await;
                                break 'sequence;
                            }
                            StepClass::Stall => {
                                record.state = StepState::Stalled;
                                let _ = components.store.savepoint(&record).await;
                                self.finalize_stalled(&mut workflow, &error.code).await;
                                break 'sequence;
                            }
                            StepClass::Fail => {
                                record.state = StepState::Failed;
                                record.completed_at = Some(Utc::now());
                                let _ = components.store.savepoint(&record).await;
                                self.finalize_failed(&mut workflow, &error.code).await;
                                break 'sequence;
                            }
                        }
                    }
                }
            }
        }

        if !workflow.is_terminal() && workflow.state == WorkflowState::Running {
            let all_done = steps
                .last()
                .map(|last| outputs.contains_key(last.name()))
                .unwrap_or(false);
            if all_done {
                workflow.state = WorkflowState::Completed;
                if let Err(err) = components.store.update(&workflow).await {
                    tracing::error!(error = %err, "failed to persist COMPLETED state");
                } else {
                    components
                        .metrics
                        .emit(&MetricEvent::WorkflowCompleted { workflow: id });
                    tracing::info!("workflow completed");
                }
            }
        }

        let _ = components.store.release(id, &self.instance).await;
    }

    fn effective_class(&self, error: &StepError) -> StepClass {
        if error.code == "CHAIN_UNAVAILABLE"
            && self.components.settings.chain_outage_class == OutageClass::Stall
        {
            StepClass::Stall
        } else {
            error.class
        }
    }

    async fn load_step_records(
        &self,
        id: WorkflowId,
    ) -> Result<HashMap<String, StepRecord>, StoreError> {
        let records = self.components.store.load_steps(id).await?;
        Ok(records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, ConfirmedReceipt, ReceiptStatus, StudioCall};
    use crate::evidence::storage::StorageError;
    use crate::evidence::transcripts::{ConversationSource, TranscriptError, TranscriptMessage};
    use crate::evidence::{ContentHash, frame_messages};
    use crate::ids::{ConversationId, TxHash};
    use crate::metrics::MetricEvent;
    use crate::signer::InMemorySignerRegistry;
    use crate::store::sqlite::SqliteWorkflowStore;
    use crate::workflow::WorkflowResult;
    use alloy_primitives::B256;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    // -------------------------------------------------------------------
    // Mock collaborators
    // -------------------------------------------------------------------

    #[derive(Default)]
    struct ChainState {
        /// `(signer, call, tx)` per accepted submission.
        submissions: Vec<(SignerAddress, StudioCall, TxHash)>,
        receipts: HashMap<TxHash, ReceiptStatus>,
        pending_per_signer: HashMap<SignerAddress, u32>,
        /// Set if two transactions were ever in flight for one signer.
        overlap: bool,
        next: u64,
    }

    struct MockChain {
        state: StdMutex<ChainState>,
        /// Simulated mining delay for submitted transactions.
        confirm_delay: Duration,
        /// When set, submissions revert and `revert_reason` replays to this.
        revert_reason: StdMutex<Option<Option<String>>>,
    }

    impl MockChain {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: StdMutex::new(ChainState::default()),
                confirm_delay: Duration::from_millis(50),
                revert_reason: StdMutex::new(None),
            })
        }

        fn revert_with(&self, reason: Option<&str>) {
            *self.revert_reason.lock().unwrap() = Some(reason.map(str::to_string));
        }

        fn preload_receipt(&self, tx: TxHash, status: ReceiptStatus) {
            self.state.lock().unwrap().receipts.insert(tx, status);
        }

        fn submissions(&self) -> Vec<(SignerAddress, StudioCall, TxHash)> {
            self.state.lock().unwrap().submissions.clone()
        }

        fn saw_overlap(&self) -> bool {
            self.state.lock().unwrap().overlap
        }
    }

    #[async_trait]
    impl ChainAdapter for MockChain {
        async fn submit(
            &self,
            signer: &SignerAddress,
            call: &StudioCall,
        ) -> Result<TxHash, ChainError> {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.next += 1;
            let mut raw = [0u8; 32];
            raw[24..].copy_from_slice(&state.next.to_be_bytes());
            let tx = TxHash::from(B256::from(raw));
            let pending = state.pending_per_signer.entry(*signer).or_insert(0);
            *pending += 1;
            if *pending > 1 {
                state.overlap = true;
            }
            state.submissions.push((*signer, call.clone(), tx));
            Ok(tx)
        }

        async fn wait_receipt(
            &self,
            tx: &TxHash,
            _timeout: Duration,
        ) -> Result<ReceiptStatus, ChainError> {
            tokio::time::sleep(self.confirm_delay).await;
            let reverted = self.revert_reason.lock().unwrap().is_some();
            let mut state = self.state.lock().unwrap();
            if let Some(status) = state.receipts.get(tx) {
                return Ok(status.clone());
            }
            let Some((signer, _, _)) = state
                .submissions
                .iter()
                .find(|(_, _, submitted)| submitted == tx)
                .cloned()
            else {
                return Ok(ReceiptStatus::NotFound);
            };
            let status = if reverted {
                ReceiptStatus::Reverted { reason: None }
            } else {
                ReceiptStatus::Confirmed(ConfirmedReceipt {
                    tx_hash: *tx,
                    block_number: Some(1),
                    log_count: 1,
                })
            };
            state.receipts.insert(*tx, status.clone());
            if let Some(pending) = state.pending_per_signer.get_mut(&signer) {
                *pending = pending.saturating_sub(1);
            }
            Ok(status)
        }

        async fn transaction_status(&self, tx: &TxHash) -> Result<ReceiptStatus, ChainError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .receipts
                .get(tx)
                .cloned()
                .unwrap_or(ReceiptStatus::NotFound))
        }

        async fn transaction_count(&self, _signer: &SignerAddress) -> Result<u64, ChainError> {
            Ok(self.state.lock().unwrap().submissions.len() as u64)
        }

        async fn revert_reason(
            &self,
            _signer: &SignerAddress,
            _call: &StudioCall,
            _block: Option<u64>,
        ) -> Result<Option<String>, ChainError> {
            Ok(self.revert_reason.lock().unwrap().clone().flatten())
        }
    }

    struct MockStorage {
        fail_remaining: AtomicU32,
        archives: StdMutex<HashMap<String, crate::ids::StorageTxId>>,
        uploads: AtomicU32,
    }

    impl MockStorage {
        fn new(fail_remaining: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_remaining: AtomicU32::new(fail_remaining),
                archives: StdMutex::new(HashMap::new()),
                uploads: AtomicU32::new(0),
            })
        }

        fn upload_count(&self) -> u32 {
            self.uploads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::evidence::storage::EvidenceStorage for MockStorage {
        async fn archive(
            &self,
            package: &crate::evidence::EvidencePackage,
        ) -> Result<crate::ids::StorageTxId, StorageError> {
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError("injected outage".into()));
            }
            let mut archives = self.archives.lock().unwrap();
            let key = package.content_hash.to_string();
            if let Some(existing) = archives.get(&key) {
                return Ok(existing.clone());
            }
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let id = crate::ids::StorageTxId::new(format!("stor-{}", archives.len() + 1))
                .expect("non-empty");
            archives.insert(key, id.clone());
            Ok(id)
        }

        async fn find_by_content_hash(
            &self,
            content_hash: &ContentHash,
        ) -> Result<Option<crate::ids::StorageTxId>, StorageError> {
            Ok(self
                .archives
                .lock()
                .unwrap()
                .get(&content_hash.to_string())
                .cloned())
        }
    }

    struct MemoryTranscripts {
        conversations: HashMap<ConversationId, Vec<TranscriptMessage>>,
    }

    #[async_trait]
    impl ConversationSource for MemoryTranscripts {
        async fn fetch(
            &self,
            conversation: &ConversationId,
        ) -> Result<Vec<TranscriptMessage>, TranscriptError> {
            self.conversations
                .get(conversation)
                .cloned()
                .ok_or_else(|| TranscriptError::Status {
                    conversation: conversation.clone(),
                    status: 404,
                })
        }
    }

    #[derive(Default)]
    struct TestMetrics {
        events: StdMutex<Vec<MetricEvent>>,
    }

    impl MetricsSink for TestMetrics {
        fn emit(&self, event: &MetricEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl TestMetrics {
        fn stall_reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    MetricEvent::WorkflowStalled { reason, .. } => Some(reason.clone()),
                    _ => None,
                })
                .collect()
        }

        fn retried_steps(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    MetricEvent::StepRetried { step, .. } => Some(*step),
                    _ => None,
                })
                .collect()
        }
    }

    // -------------------------------------------------------------------
    // Harness
    // -------------------------------------------------------------------

    struct TestBed {
        engine: WorkflowEngine,
        chain: Arc<MockChain>,
        storage: Arc<MockStorage>,
        metrics: Arc<TestMetrics>,
        store: Arc<SqliteWorkflowStore>,
        signer: SignerAddress,
    }

    async fn testbed(fail_storage: u32, mutate: impl FnOnce(&mut EngineSettings)) -> TestBed {
        let store = Arc::new(
            SqliteWorkflowStore::connect("sqlite::memory:")
                .await
                .expect("in-memory store"),
        );
        let chain = MockChain::new();
        let storage = MockStorage::new(fail_storage);
        let metrics = Arc::new(TestMetrics::default());
        let key = B256::from_str(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let registry =
            Arc::new(InMemorySignerRegistry::from_keys(&[key], Some(31_337)).unwrap());
        let signer = registry.list()[0];

        let transcripts = Arc::new(MemoryTranscripts {
            conversations: HashMap::from([(
                "CONV-1".parse().unwrap(),
                vec![
                    TranscriptMessage {
                        id: None,
                        timestamp: 1,
                        content: b"alpha".to_vec(),
                    },
                    TranscriptMessage {
                        id: None,
                        timestamp: 2,
                        content: b"beta".to_vec(),
                    },
                ],
            )]),
        });

        let mut settings = EngineSettings {
            receipt_timeout: Duration::from_secs(5),
            ..EngineSettings::default()
        };
        mutate(&mut settings);

        let nonce = Arc::new(NonceSerializer::new());
        let store_dyn: Arc<dyn WorkflowStore> = store.clone();
        let chain_dyn: Arc<dyn ChainAdapter> = chain.clone();
        let metrics_dyn: Arc<dyn MetricsSink> = metrics.clone();
        let reconciler = Reconciler::new(
            chain_dyn.clone(),
            store_dyn.clone(),
            Arc::clone(&nonce),
            metrics_dyn.clone(),
            ChronoDuration::milliseconds(60_000),
        );
        let engine = WorkflowEngine::new(Components {
            store: store_dyn,
            chain: chain_dyn,
            storage: storage.clone(),
            evidence: crate::evidence::EvidenceBuilder::new(transcripts),
            signers: registry,
            nonce,
            reconciler,
            metrics: metrics_dyn,
            settings,
        });
        TestBed {
            engine,
            chain,
            storage,
            metrics,
            store,
            signer,
        }
    }

    async fn wait_terminal(engine: &WorkflowEngine, id: WorkflowId) -> WorkflowStatus {
        for _ in 0..100_000u32 {
            let status = engine.get(id).await.expect("query");
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workflow never reached a terminal state");
    }

    fn work_submission_input() -> serde_json::Value {
        json!({
            "studio": "0xdead00000000000000000000000000000000beef",
            "epoch": 7,
            "agent": "0xbeef00000000000000000000000000000000dead",
            "conversationId": "CONV-1"
        })
    }

    fn score_submission_input() -> serde_json::Value {
        json!({
            "studio": "0xdead00000000000000000000000000000000beef",
            "epoch": 7,
            "agent": "0xbeef00000000000000000000000000000000dead",
            "worker": "0xbeef00000000000000000000000000000000dea0",
            "score": 88
        })
    }

    // -------------------------------------------------------------------
    // Scenarios
    // -------------------------------------------------------------------

    /// Happy-path work submission: evidence archived, root committed,
    /// transaction confirmed.
    #[tokio::test(start_paused = true)]
    async fn work_submission_completes_with_archived_evidence() {
        let bed = testbed(0, |_| {}).await;
        let id = bed
            .engine
            .submit(WorkflowKind::WorkSubmission, bed.signer, work_submission_input())
            .await
            .unwrap();
        let status = wait_terminal(&bed.engine, id).await;
        assert_eq!(status.state, WorkflowState::Completed);

        let result = status.result.expect("result recorded");
        assert!(result.storage_tx.is_some());

        // The root commits to (studio, epoch, agent, content-hash).
        let framed = frame_messages(&[
            TranscriptMessage {
                id: None,
                timestamp: 1,
                content: b"alpha".to_vec(),
            },
            TranscriptMessage {
                id: None,
                timestamp: 2,
                content: b"beta".to_vec(),
            },
        ]);
        let expected_root = crate::evidence::compute_root(
            &"0xdead00000000000000000000000000000000beef".parse().unwrap(),
            7,
            &"0xbeef00000000000000000000000000000000dead".parse().unwrap(),
            &ContentHash::digest(&framed),
        );
        assert_eq!(result.evidence_root.as_deref(), Some(expected_root.as_str()));

        // Exactly one submission, carrying the root in the calldata.
        let submissions = bed.chain.submissions();
        assert_eq!(submissions.len(), 1);
        let calldata = &submissions[0].1.calldata;
        let root_bytes = hex::decode(expected_root.trim_start_matches("0x")).unwrap();
        let root_word = &calldata[4 + 64..4 + 96];
        assert_eq!(root_word, root_bytes.as_slice());
        assert_eq!(bed.storage.upload_count(), 1);
    }

    /// Storage outage: the workflow stalls (never fails), resumes on the
    /// sweep, and finishes without a second on-chain submission.
    #[tokio::test(start_paused = true)]
    async fn storage_outage_stalls_then_recovers() {
        let bed = testbed(1, |_| {}).await;
        bed.engine.start().await.unwrap();
        let id = bed
            .engine
            .submit(WorkflowKind::WorkSubmission, bed.signer, work_submission_input())
            .await
            .unwrap();
        let status = wait_terminal(&bed.engine, id).await;
        assert_eq!(status.state, WorkflowState::Completed);
        assert!(
            bed.metrics
                .stall_reasons()
                .contains(&"STORAGE_UNAVAILABLE".to_string())
        );
        assert_eq!(bed.chain.submissions().len(), 1);
        assert_eq!(bed.storage.upload_count(), 1);
        bed.engine.shutdown().await;
    }

    /// Stale reconciliation before submit: the violation is surfaced, the
    /// step retries after a fresh reconciliation, and the workflow completes.
    #[tokio::test(start_paused = true)]
    async fn stale_reconciliation_heals_through_retry() {
        let bed = testbed(0, |_| {}).await;
        let mut workflow = WorkflowRecord::admit(
            bed.signer,
            parse_input(WorkflowKind::CloseEpoch, json!({
                "studio": "0xdead00000000000000000000000000000000beef",
                "epoch": 7
            }))
            .unwrap(),
        );
        workflow.state = WorkflowState::Created;
        bed.store.create(&workflow).await.unwrap();

        // Position the workflow at SubmitTx with a 61-second-old stamp.
        let reconcile = StepRecord {
            workflow_id: workflow.id,
            name: RECONCILE.to_string(),
            state: StepState::Succeeded,
            attempt: 1,
            last_error: None,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            output: Some(json!({ "outcome": "proceed", "logCount": 0 })),
        };
        bed.store.savepoint(&reconcile).await.unwrap();
        workflow.state = WorkflowState::Running;
        workflow.current_step = Some(SUBMIT_TX.to_string());
        workflow.last_reconciled_at = Some(Utc::now() - ChronoDuration::seconds(61));
        bed.store.update(&workflow).await.unwrap();

        bed.engine.resume(workflow.id).await.unwrap();
        let status = wait_terminal(&bed.engine, workflow.id).await;
        assert_eq!(status.state, WorkflowState::Completed);
        assert!(bed.metrics.retried_steps().contains(&SUBMIT_TX));
        assert_eq!(bed.chain.submissions().len(), 1);
    }

    /// Two workflows sharing a signer: the second submits only after the
    /// first's transaction resolves. Never two in flight.
    #[tokio::test(start_paused = true)]
    async fn shared_signer_submissions_serialize() {
        let bed = testbed(0, |_| {}).await;
        let first = bed
            .engine
            .submit(WorkflowKind::ScoreSubmission, bed.signer, score_submission_input())
            .await
            .unwrap();
        let second = bed
            .engine
            .submit(WorkflowKind::ScoreSubmission, bed.signer, score_submission_input())
            .await
            .unwrap();
        let first_status = wait_terminal(&bed.engine, first).await;
        let second_status = wait_terminal(&bed.engine, second).await;
        assert_eq!(first_status.state, WorkflowState::Completed);
        assert_eq!(second_status.state, WorkflowState::Completed);
        assert_eq!(bed.chain.submissions().len(), 2);
        assert!(!bed.chain.saw_overlap(), "two txs in flight for one signer");
    }

    /// Revert with a known reason fails terminally, no retry.
    #[tokio::test(start_paused = true)]
    async fn revert_with_reason_fails_without_retry() {
        let bed = testbed(0, |_| {}).await;
        bed.chain.revert_with(Some("work already exists"));
        let id = bed
            .engine
            .submit(WorkflowKind::ScoreSubmission, bed.signer, score_submission_input())
            .await
            .unwrap();
        let status = wait_terminal(&bed.engine, id).await;
        assert_eq!(status.state, WorkflowState::Failed);
        assert_eq!(status.error_code.as_deref(), Some("work already exists"));
        assert_eq!(bed.chain.submissions().len(), 1);
    }

    /// Restart after SubmitTx succeeded: reconciliation finds the receipt,
    /// the workflow advances straight to RecordResult, nothing is
    /// re-submitted.
    #[tokio::test(start_paused = true)]
    async fn restart_recovers_submitted_workflow_without_resubmission() {
        let bed = testbed(0, |_| {}).await;
        let tx = TxHash::parse(
            "0x00000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();
        bed.chain.preload_receipt(
            tx,
            ReceiptStatus::Confirmed(ConfirmedReceipt {
                tx_hash: tx,
                block_number: Some(42),
                log_count: 3,
            }),
        );

        // State as left by a crash between SubmitTx and AwaitReceipt.
        let mut workflow = WorkflowRecord::admit(
            bed.signer,
            parse_input(WorkflowKind::CloseEpoch, json!({
                "studio": "0xdead00000000000000000000000000000000beef",
                "epoch": 7
            }))
            .unwrap(),
        );
        bed.store.create(&workflow).await.unwrap();
        for (name, output) in [
            (RECONCILE, json!({ "outcome": "proceed", "logCount": 0 })),
            (SUBMIT_TX, json!(SubmitOutput { tx_hash: tx, skipped: false })),
        ] {
            let record = StepRecord {
                workflow_id: workflow.id,
                name: name.to_string(),
                state: StepState::Succeeded,
                attempt: 1,
                last_error: None,
                started_at: Some(Utc::now()),
                completed_at: Some(Utc::now()),
                output: Some(output),
            };
            bed.store.savepoint(&record).await.unwrap();
        }
        workflow.state = WorkflowState::Running;
        workflow.current_step = Some(AWAIT_RECEIPT.to_string());
        workflow.pending_tx_hash = Some(tx);
        workflow.submitted_at = Some(Utc::now());
        workflow.last_reconciled_at = Some(Utc::now());
        bed.store.update(&workflow).await.unwrap();

        bed.engine.recover().await.unwrap();
        let status = wait_terminal(&bed.engine, workflow.id).await;
        assert_eq!(status.state, WorkflowState::Completed);
        let result: WorkflowResult = status.result.unwrap();
        assert_eq!(result.tx_hash, tx);
        assert_eq!(result.block_number, Some(42));
        // Nothing was submitted in this process lifetime.
        assert!(bed.chain.submissions().is_empty());
    }

    // -------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn admission_rejects_unknown_types() {
        let bed = testbed(0, |_| {}).await;
        let err = bed
            .engine
            .submit_raw("epoch_rollover", &bed.signer.to_string(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FROZEN_TYPE_VIOLATION");
    }

    #[tokio::test(start_paused = true)]
    async fn admission_rejects_unknown_signers() {
        let bed = testbed(0, |_| {}).await;
        let err = bed
            .engine
            .submit(
                WorkflowKind::ScoreSubmission,
                "0x9999000000000000000000000000000000000099".parse().unwrap(),
                score_submission_input(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SIGNER_NOT_FOUND");
        assert_eq!(err.kind(), "admission");
    }

    #[tokio::test(start_paused = true)]
    async fn admission_enforces_quotas() {
        let bed = testbed(0, |settings| settings.max_workflows_total = 0).await;
        let err = bed
            .engine
            .submit(WorkflowKind::ScoreSubmission, bed.signer, score_submission_input())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert!(err.retryable());

        let bed = testbed(0, |settings| settings.max_per_kind.close_epoch = 0).await;
        let err = bed
            .engine
            .submit(
                WorkflowKind::CloseEpoch,
                bed.signer,
                json!({ "studio": "0xdead00000000000000000000000000000000beef", "epoch": 7 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuotaExceeded { ref scope, .. } if scope == "close_epoch"
        ));
    }

    /// Terminal workflows are immutable even through the resume interface.
    #[tokio::test(start_paused = true)]
    async fn resume_is_idempotent_on_terminal_workflows() {
        let bed = testbed(0, |_| {}).await;
        let id = bed
            .engine
            .submit(WorkflowKind::ScoreSubmission, bed.signer, score_submission_input())
            .await
            .unwrap();
        let completed = wait_terminal(&bed.engine, id).await;
        assert_eq!(completed.state, WorkflowState::Completed);
        let resumed = bed.engine.resume(id).await.unwrap();
        assert_eq!(resumed.state, WorkflowState::Completed);
        assert_eq!(bed.chain.submissions().len(), 1);
    }
}
