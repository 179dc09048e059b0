//! Reconciliation: querying chain truth before acting on it.
//!
//! Reconciliation runs before every irreversible action (every submission
//! and every re-submission after a stall) and is the only authoritative
//! source for on-chain state. Its outcome either clears the way to submit or
//! short-circuits the workflow with what the chain already knows.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::chain::{ChainAdapter, ChainError, ConfirmedReceipt, ReceiptStatus};
use crate::guards::markers;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::nonce::NonceSerializer;
use crate::store::{StoreError, WorkflowStore};
use crate::workflow::WorkflowRecord;

/// What reconciliation found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No pending transaction; submission may proceed.
    Proceed,
    /// The pending transaction already confirmed; do not re-submit.
    AlreadyConfirmed(ConfirmedReceipt),
    /// The pending transaction reverted.
    Reverted { reason: Option<String> },
    /// The pending transaction vanished: unknown to the chain after the
    /// not-found window. The pending slot has been cleared; a later resume
    /// re-submits after fresh reconciliation.
    NotFound,
    /// The pending transaction is not yet mined but still within its window.
    StillPending,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Proceed => "proceed",
            ReconcileOutcome::AlreadyConfirmed(_) => "already_confirmed",
            ReconcileOutcome::Reverted { .. } => "reverted",
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::StillPending => "still_pending",
        }
    }
}

/// Reconciliation failure: the chain or the store could not answer.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Queries chain truth for a workflow's pending transaction and stamps the
/// workflow with the reconciliation time.
pub struct Reconciler {
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn WorkflowStore>,
    nonce: Arc<NonceSerializer>,
    metrics: Arc<dyn MetricsSink>,
    /// How long a submitted transaction may stay invisible before it is
    /// declared gone.
    not_found_window: Duration,
}

impl Reconciler {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        store: Arc<dyn WorkflowStore>,
        nonce: Arc<NonceSerializer>,
        metrics: Arc<dyn MetricsSink>,
        not_found_window: Duration,
    ) -> Self {
        Self {
            chain,
            store,
            nonce,
            metrics,
            not_found_window,
        }
    }

    /// Reconciles a workflow against the chain, persisting the stamp and any
    /// pending-slot changes before returning.
    pub async fn reconcile(
        &self,
        workflow: &mut WorkflowRecord,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        markers::assert_no_fast_path();
        let outcome = match workflow.pending_tx_hash {
            None => {
                // Nothing recorded in flight; confirm the chain answers for
                // this signer before letting a submission through.
                let nonce = self.chain.transaction_count(&workflow.signer).await?;
                tracing::debug!(
                    workflow_id = %workflow.id,
                    signer = %workflow.signer,
                    nonce,
                    "reconciled with no pending transaction"
                );
                ReconcileOutcome::Proceed
            }
            Some(tx) => match self.chain.transaction_status(&tx).await? {
                ReceiptStatus::Confirmed(receipt) => {
                    workflow.pending_tx_hash = None;
                    workflow.submitted_at = None;
                    self.nonce.release(&workflow.signer);
                    ReconcileOutcome::AlreadyConfirmed(receipt)
                }
                ReceiptStatus::Reverted { reason } => {
                    workflow.pending_tx_hash = None;
                    workflow.submitted_at = None;
                    self.nonce.release(&workflow.signer);
                    ReconcileOutcome::Reverted { reason }
                }
                ReceiptStatus::NotFound => {
                    let age = age_of(workflow.submitted_at);
                    if age > self.not_found_window {
                        tracing::warn!(
                            workflow_id = %workflow.id,
                            tx = %tx,
                            age_ms = age.num_milliseconds(),
                            "pending transaction not found past window"
                        );
                        workflow.pending_tx_hash = None;
                        workflow.submitted_at = None;
                        self.nonce.release(&workflow.signer);
                        ReconcileOutcome::NotFound
                    } else {
                        ReconcileOutcome::StillPending
                    }
                }
            },
        };
        workflow.last_reconciled_at = Some(Utc::now());
        self.store.update(workflow).await?;
        self.metrics.emit(&MetricEvent::ReconciliationRan {
            workflow: workflow.id,
            outcome: outcome.as_str(),
        });
        Ok(outcome)
    }
}

fn age_of(submitted_at: Option<DateTime<Utc>>) -> Duration {
    match submitted_at {
        Some(ts) => Utc::now().signed_duration_since(ts),
        // No submission time on record: treat as fresh so a racing write
        // cannot spuriously abandon a live transaction.
        None => Duration::zero(),
    }
}
