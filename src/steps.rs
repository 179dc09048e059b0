//! Concrete steps and the per-kind descriptor tables.
//!
//! Each frozen workflow kind declares a fixed, compile-time ordered step
//! sequence. Steps communicate only through persisted outputs, so a restart
//! replays the same data into the same positions.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chain::StudioCall;
use crate::evidence::EvidencePackage;
use crate::guards::{assert_reconciliation_performed, markers};
use crate::ids::{StorageTxId, TxHash};
use crate::metrics::MetricEvent;
use crate::reconcile::ReconcileOutcome;
use crate::step::{Step, StepCtx, StepError};
use crate::workflow::{WorkflowInput, WorkflowKind, WorkflowResult};

pub const BUILD_EVIDENCE: &str = "BuildEvidence";
pub const ARCHIVE_EVIDENCE: &str = "ArchiveEvidence";
pub const COMPUTE_ROOT: &str = "ComputeRoot";
pub const RECONCILE: &str = "Reconcile";
pub const SUBMIT_TX: &str = "SubmitTx";
pub const AWAIT_RECEIPT: &str = "AwaitReceipt";
pub const RECORD_RESULT: &str = "RecordResult";

static WORK_SUBMISSION_STEPS: [&'static dyn Step; 7] = [
    &BuildEvidence,
    &ArchiveEvidence,
    &ComputeRoot,
    &Reconcile,
    &SubmitTx,
    &AwaitReceipt,
    &RecordResult,
];

static SUBMISSION_ONLY_STEPS: [&'static dyn Step; 4] =
    [&Reconcile, &SubmitTx, &AwaitReceipt, &RecordResult];

/// The declared step sequence for a workflow kind.
pub fn steps_for(kind: WorkflowKind) -> &'static [&'static dyn Step] {
    match kind {
        WorkflowKind::WorkSubmission => &WORK_SUBMISSION_STEPS,
        WorkflowKind::ScoreSubmission | WorkflowKind::CloseEpoch => &SUBMISSION_ONLY_STEPS,
    }
}

/// Index of a step name within a kind's sequence.
pub fn step_index(kind: WorkflowKind, name: &str) -> Option<usize> {
    steps_for(kind).iter().position(|s| s.name() == name)
}

/// Persisted output of the `Reconcile` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutput {
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub log_count: usize,
}

/// Persisted output of the `SubmitTx` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutput {
    pub tx_hash: TxHash,
    /// True when reconciliation showed the transaction already on-chain and
    /// no new submission was made.
    pub skipped: bool,
}

/// Persisted output of the `AwaitReceipt` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptOutput {
    pub tx_hash: TxHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub log_count: usize,
}

/// Persisted output of the `ComputeRoot` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeRootOutput {
    pub root: String,
    pub content_hash: String,
}

/// Persisted output of the `ArchiveEvidence` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOutput {
    pub storage_tx: StorageTxId,
}

fn wrong_kind(step: &str, kind: WorkflowKind) -> StepError {
    StepError::fail(
        "WRONG_KIND",
        format!("step {step} does not apply to {kind} workflows"),
    )
}

/// Builds the evidence package from the conversation transcript.
pub struct BuildEvidence;

#[async_trait]
impl Step for BuildEvidence {
    fn name(&self) -> &'static str {
        BUILD_EVIDENCE
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        markers::evidence_only();
        let WorkflowInput::WorkSubmission(input) = &ctx.workflow.input else {
            return Err(wrong_kind(BUILD_EVIDENCE, ctx.workflow.kind));
        };
        let package = ctx
            .components
            .evidence
            .build_from_conversation(&input.conversation_id, input.studio, input.epoch, input.agent)
            .await?;
        serde_json::to_value(&package)
            .map_err(|e| StepError::fail("EVIDENCE_SERIALIZE", e.to_string()))
    }
}

/// Uploads the package to content-addressed storage. Idempotent by content
/// hash, so a resume after a stall never archives twice.
pub struct ArchiveEvidence;

#[async_trait]
impl Step for ArchiveEvidence {
    fn name(&self) -> &'static str {
        ARCHIVE_EVIDENCE
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        let package: EvidencePackage = ctx.output(BUILD_EVIDENCE)?;
        let storage_tx = ctx.components.storage.archive(&package).await?;
        tracing::info!(
            workflow_id = %ctx.workflow.id,
            storage_tx = %storage_tx,
            content_hash = %package.content_hash,
            "evidence archived"
        );
        Ok(json!(ArchiveOutput { storage_tx }))
    }
}

/// Derives the on-chain evidence root from the package identity.
pub struct ComputeRoot;

#[async_trait]
impl Step for ComputeRoot {
    fn name(&self) -> &'static str {
        COMPUTE_ROOT
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        let package: EvidencePackage = ctx.output(BUILD_EVIDENCE)?;
        let root = crate::evidence::compute_root(
            &package.header.studio_address,
            package.header.epoch,
            &package.header.agent_address,
            &package.content_hash,
        );
        Ok(json!(ComputeRootOutput {
            root,
            content_hash: package.content_hash.to_string(),
        }))
    }
}

/// Queries chain truth before the submission that follows.
pub struct Reconcile;

#[async_trait]
impl Step for Reconcile {
    fn name(&self) -> &'static str {
        RECONCILE
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        let pending = ctx.workflow.pending_tx_hash;
        let outcome = ctx.components.reconciler.reconcile(ctx.workflow).await?;
        match outcome {
            ReconcileOutcome::Proceed => Ok(json!(ReconcileOutput {
                outcome: outcome.as_str().to_string(),
                tx_hash: None,
                block_number: None,
                log_count: 0,
            })),
            ReconcileOutcome::AlreadyConfirmed(receipt) => Ok(json!(ReconcileOutput {
                outcome: "already_confirmed".to_string(),
                tx_hash: Some(receipt.tx_hash),
                block_number: receipt.block_number,
                log_count: receipt.log_count,
            })),
            ReconcileOutcome::StillPending => Ok(json!(ReconcileOutput {
                outcome: "still_pending".to_string(),
                tx_hash: pending,
                block_number: None,
                log_count: 0,
            })),
            ReconcileOutcome::Reverted { reason } => match reason {
                Some(reason) => Err(StepError::fail(reason.clone(), reason)),
                None => Err(StepError::stall(
                    "REVERT_UNKNOWN",
                    "pending transaction reverted without a reason",
                )),
            },
            ReconcileOutcome::NotFound => Err(StepError::stall(
                "TX_NOT_FOUND",
                "pending transaction unknown to the chain past the not-found window",
            )),
        }
    }
}

/// Acquires the signer slot and hands the call to the chain.
pub struct SubmitTx;

#[async_trait]
impl Step for SubmitTx {
    fn name(&self) -> &'static str {
        SUBMIT_TX
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        markers::orchestration_only();
        markers::assert_no_batching();

        let reconciled: ReconcileOutput = ctx.output(RECONCILE)?;
        // Tie-break: a transaction the chain already knows is never
        // re-submitted.
        if reconciled.outcome != "proceed" {
            let tx_hash = reconciled.tx_hash.ok_or_else(|| {
                StepError::fail(
                    "MISSING_STEP_OUTPUT",
                    "reconciliation short-circuit without a transaction hash",
                )
            })?;
            return Ok(json!(SubmitOutput {
                tx_hash,
                skipped: true,
            }));
        }

        if let Err(violation) = assert_reconciliation_performed(
            ctx.workflow.last_reconciled_at,
            ctx.components.settings.reconcile_staleness,
            SUBMIT_TX,
        ) {
            tracing::error!(
                workflow_id = %ctx.workflow.id,
                invariant = violation.invariant,
                details = %violation.details,
                "invariant violation before submission"
            );
            return Err(violation.into());
        }

        let evidence_root = match ctx.workflow.kind {
            WorkflowKind::WorkSubmission => {
                Some(ctx.output::<ComputeRootOutput>(COMPUTE_ROOT)?.root)
            }
            _ => None,
        };
        let call = StudioCall::encode(&ctx.workflow.input, evidence_root.as_deref())
            .map_err(|e| StepError::fail("CALL_ENCODE", e.to_string()))?;

        let signer = ctx.workflow.signer;
        let workflow_id = ctx.workflow.id;
        ctx.components
            .nonce
            .acquire(signer, workflow_id)
            .map_err(StepError::from)?;

        match ctx.components.chain.submit(&signer, &call).await {
            Ok(tx_hash) => {
                ctx.components.nonce.record_submission(&signer, tx_hash);
                ctx.workflow.pending_tx_hash = Some(tx_hash);
                ctx.workflow.submitted_at = Some(Utc::now());
                // Persist the hash before anything else can happen to it; a
                // crash here must leave reconciliation a trail.
                if let Err(err) = ctx.components.store.update(ctx.workflow).await {
                    return Err(StepError::stall("STORE_UNAVAILABLE", err.to_string()));
                }
                ctx.components.metrics.emit(&MetricEvent::TxSubmitted {
                    workflow: workflow_id,
                    signer,
                    tx: tx_hash,
                });
                tracing::info!(
                    workflow_id = %workflow_id,
                    signer = %signer,
                    tx = %tx_hash,
                    "transaction submitted"
                );
                Ok(json!(SubmitOutput {
                    tx_hash,
                    skipped: false,
                }))
            }
            Err(err) => {
                // The submission never reached the chain; holding the slot
                // across the retry sleep would starve other workflows.
                ctx.components.nonce.release(&signer);
                Err(err.into())
            }
        }
    }
}

/// Waits for the submitted transaction's receipt.
pub struct AwaitReceipt;

#[async_trait]
impl Step for AwaitReceipt {
    fn name(&self) -> &'static str {
        AWAIT_RECEIPT
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        let reconciled: ReconcileOutput = ctx.output(RECONCILE)?;
        if reconciled.outcome == "already_confirmed" {
            let tx_hash = reconciled.tx_hash.ok_or_else(|| {
                StepError::fail(
                    "MISSING_STEP_OUTPUT",
                    "confirmed reconciliation without a transaction hash",
                )
            })?;
            return Ok(json!(ReceiptOutput {
                tx_hash,
                block_number: reconciled.block_number,
                log_count: reconciled.log_count,
            }));
        }

        let submitted: SubmitOutput = ctx.output(SUBMIT_TX)?;
        let tx_hash = submitted.tx_hash;
        let signer = ctx.workflow.signer;
        let workflow_id = ctx.workflow.id;
        let timeout = ctx.components.settings.receipt_timeout;

        match ctx.components.chain.wait_receipt(&tx_hash, timeout).await? {
            crate::chain::ReceiptStatus::Confirmed(receipt) => {
                ctx.components.nonce.release(&signer);
                ctx.workflow.pending_tx_hash = None;
                ctx.workflow.submitted_at = None;
                ctx.components.metrics.emit(&MetricEvent::TxConfirmed {
                    workflow: workflow_id,
                    tx: tx_hash,
                });
                Ok(json!(ReceiptOutput {
                    tx_hash,
                    block_number: receipt.block_number,
                    log_count: receipt.log_count,
                }))
            }
            crate::chain::ReceiptStatus::Reverted { reason } => {
                let reason = match reason {
                    Some(reason) => Some(reason),
                    None => {
                        // Receipts carry no reason on EVM; replay the call to
                        // recover one. Best effort only.
                        let evidence_root = ctx
                            .has_output(COMPUTE_ROOT)
                            .then(|| ctx.output::<ComputeRootOutput>(COMPUTE_ROOT))
                            .transpose()?
                            .map(|o| o.root);
                        let call =
                            StudioCall::encode(&ctx.workflow.input, evidence_root.as_deref())
                                .ok();
                        match call {
                            Some(call) => ctx
                                .components
                                .chain
                                .revert_reason(&signer, &call, None)
                                .await
                                .unwrap_or(None),
                            None => None,
                        }
                    }
                };
                ctx.components.nonce.release(&signer);
                ctx.workflow.pending_tx_hash = None;
                ctx.workflow.submitted_at = None;
                ctx.components.metrics.emit(&MetricEvent::TxReverted {
                    workflow: workflow_id,
                    tx: tx_hash,
                    reason: reason.clone(),
                });
                match reason {
                    // A revert with a known reason is a domain rejection.
                    Some(reason) => Err(StepError::fail(reason.clone(), reason)),
                    None => Err(StepError::stall(
                        "REVERT_UNKNOWN",
                        "transaction reverted without a recoverable reason",
                    )),
                }
            }
            crate::chain::ReceiptStatus::NotFound => {
                // The slot stays held and the pending hash stays recorded:
                // the transaction may still surface, and reconciliation on
                // resume is the only party allowed to decide otherwise.
                ctx.components.metrics.emit(&MetricEvent::TxNotFound {
                    workflow: workflow_id,
                    tx: tx_hash,
                });
                Err(StepError::stall(
                    "TX_NOT_FOUND",
                    format!("no receipt for {tx_hash} within {}s", timeout.as_secs()),
                ))
            }
        }
    }
}

/// Assembles and records the workflow result.
pub struct RecordResult;

#[async_trait]
impl Step for RecordResult {
    fn name(&self) -> &'static str {
        RECORD_RESULT
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError> {
        let receipt: ReceiptOutput = ctx.output(AWAIT_RECEIPT)?;
        let evidence_root = ctx
            .has_output(COMPUTE_ROOT)
            .then(|| ctx.output::<ComputeRootOutput>(COMPUTE_ROOT))
            .transpose()?
            .map(|o| o.root);
        let storage_tx = ctx
            .has_output(ARCHIVE_EVIDENCE)
            .then(|| ctx.output::<ArchiveOutput>(ARCHIVE_EVIDENCE))
            .transpose()?
            .map(|o| o.storage_tx);
        let result = WorkflowResult {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            evidence_root,
            storage_tx,
        };
        ctx.workflow.result = Some(result.clone());
        serde_json::to_value(&result)
            .map_err(|e| StepError::fail("RESULT_SERIALIZE", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_match_declared_order() {
        let work: Vec<_> = steps_for(WorkflowKind::WorkSubmission)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(
            work,
            vec![
                BUILD_EVIDENCE,
                ARCHIVE_EVIDENCE,
                COMPUTE_ROOT,
                RECONCILE,
                SUBMIT_TX,
                AWAIT_RECEIPT,
                RECORD_RESULT
            ]
        );
        for kind in [WorkflowKind::ScoreSubmission, WorkflowKind::CloseEpoch] {
            let names: Vec<_> = steps_for(kind).iter().map(|s| s.name()).collect();
            assert_eq!(names, vec![RECONCILE, SUBMIT_TX, AWAIT_RECEIPT, RECORD_RESULT]);
        }
    }

    #[test]
    fn every_sequence_reconciles_before_submitting() {
        for kind in WorkflowKind::ALL {
            let reconcile = step_index(kind, RECONCILE).unwrap();
            let submit = step_index(kind, SUBMIT_TX).unwrap();
            assert!(reconcile < submit);
        }
    }
}
