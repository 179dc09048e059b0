//! Typed steps: the unit of work the engine retries, times out, and stalls.
//!
//! Every error a step surfaces is classified into one of three outcomes:
//! retry locally, stall the workflow, or fail it terminally. Classification
//! is the error taxonomy made executable: transient I/O retries, operational
//! uncertainty stalls, domain rejection fails.

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

use crate::chain::ChainError;
use crate::engine::Components;
use crate::evidence::storage::StorageError;
use crate::evidence::transcripts::TranscriptError;
use crate::guards::InvariantViolation;
use crate::ids::WorkflowId;
use crate::workflow::WorkflowRecord;

/// What the runtime does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepClass {
    /// Re-run the step after a backoff delay.
    Retry,
    /// Stall the workflow; truth is unknown or an operator must act.
    Stall,
    /// Fail the workflow terminally.
    Fail,
}

/// A classified step failure.
#[derive(Debug, Clone)]
pub struct StepError {
    /// Stable error code; becomes the workflow's `errorCode` or stall reason.
    pub code: String,
    pub message: String,
    pub class: StepClass,
}

impl StepError {
    pub fn retry(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: StepClass::Retry,
        }
    }

    pub fn stall(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: StepClass::Stall,
        }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: StepClass::Fail,
        }
    }

    /// Whether this failure asks the runtime to re-run reconciliation before
    /// the step is retried.
    pub fn needs_reconciliation(&self) -> bool {
        self.code == "RECONCILIATION_STALE" || self.code == "RECONCILIATION_MISSING"
    }
}

impl Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StepError {}

impl From<ChainError> for StepError {
    fn from(err: ChainError) -> Self {
        if err.is_transient() {
            StepError::retry("CHAIN_UNAVAILABLE", err.to_string())
        } else {
            // A receipt the adapter cannot interpret is operator territory.
            StepError::stall("MALFORMED_RECEIPT", err.to_string())
        }
    }
}

impl From<StorageError> for StepError {
    fn from(err: StorageError) -> Self {
        // Storage failures never fail a workflow: the upload may have landed.
        StepError::stall("STORAGE_UNAVAILABLE", err.to_string())
    }
}

impl From<TranscriptError> for StepError {
    fn from(err: TranscriptError) -> Self {
        if err.is_transient() {
            StepError::retry("TRANSCRIPTS_UNAVAILABLE", err.to_string())
        } else {
            StepError::stall("TRANSCRIPT_MALFORMED", err.to_string())
        }
    }
}

impl From<crate::reconcile::ReconcileError> for StepError {
    fn from(err: crate::reconcile::ReconcileError) -> Self {
        match err {
            crate::reconcile::ReconcileError::Chain(e) => e.into(),
            crate::reconcile::ReconcileError::Store(e) => {
                StepError::retry("STORE_UNAVAILABLE", e.to_string())
            }
        }
    }
}

impl From<crate::nonce::AcquireError> for StepError {
    fn from(err: crate::nonce::AcquireError) -> Self {
        match err {
            // Contention: wait behind the holder, capped backoff.
            crate::nonce::AcquireError::Busy { .. } => {
                StepError::retry("SIGNER_BUSY", err.to_string())
            }
            // Re-acquisition by the holder is a serialization bug.
            crate::nonce::AcquireError::Reentrant { .. } => {
                InvariantViolation::new("SIGNER_SERIALIZATION", err.to_string()).into()
            }
        }
    }
}

impl From<InvariantViolation> for StepError {
    fn from(err: InvariantViolation) -> Self {
        // Reconciliation staleness self-heals: the runtime re-reconciles and
        // retries. Every other invariant violation is a terminal bug.
        let class = if err.invariant == "RECONCILIATION_STALE"
            || err.invariant == "RECONCILIATION_MISSING"
        {
            StepClass::Retry
        } else {
            StepClass::Fail
        };
        StepError {
            code: err.invariant.to_string(),
            message: err.details,
            class,
        }
    }
}

/// Exponential backoff with a cap and jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Fractional jitter applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running after `attempt` failed attempts (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Deterministic idempotency key for `(workflow, step)`, used to correlate
/// a re-run with its prior effects during reconciliation.
pub fn idempotency_key(workflow: WorkflowId, step: &str) -> String {
    format!("{workflow}:{step}")
}

/// Execution context handed to a step: the workflow record (mutations are
/// persisted by the runtime after each transition), the composed components,
/// and the outputs of previously succeeded steps.
pub struct StepCtx<'a> {
    pub workflow: &'a mut WorkflowRecord,
    pub components: &'a Components,
    pub outputs: HashMap<String, serde_json::Value>,
}

impl StepCtx<'_> {
    /// Deserializes the persisted output of an earlier step.
    pub fn output<T: DeserializeOwned>(&self, step: &str) -> Result<T, StepError> {
        let value = self.outputs.get(step).ok_or_else(|| {
            StepError::fail(
                "MISSING_STEP_OUTPUT",
                format!("no output recorded for step {step}"),
            )
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StepError::fail(
                "MISSING_STEP_OUTPUT",
                format!("output of step {step} does not deserialize: {e}"),
            )
        })
    }

    /// Whether an earlier step recorded any output.
    pub fn has_output(&self, step: &str) -> bool {
        self.outputs.contains_key(step)
    }

    pub fn idempotency_key(&self, step: &str) -> String {
        idempotency_key(self.workflow.id, step)
    }
}

/// One unit of work within a workflow.
///
/// Steps are stateless values; everything they touch comes through the
/// context. Re-running a step must be idempotent: it either detects prior
/// success (via reconciliation or recorded outputs) or produces the same
/// on-chain effect.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    /// Retry policy for this step. `default` carries the engine-configured
    /// policy; most steps use it as-is.
    fn retry_policy(&self, default: RetryPolicy) -> RetryPolicy {
        default
    }

    /// Per-attempt wall-clock budget. `None` uses the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<serde_json::Value, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for attempt in 1..=8 {
            let delay = policy.delay(attempt).as_secs_f64();
            let base = (2.0f64.powi(attempt as i32 - 1)).min(30.0);
            assert!(delay >= base * 0.8 - 1e-6);
            assert!(delay <= base * 1.2 + 1e-6);
        }
    }

    #[test]
    fn storage_errors_stall() {
        let err: StepError = StorageError("503".into()).into();
        assert_eq!(err.class, StepClass::Stall);
        assert_eq!(err.code, "STORAGE_UNAVAILABLE");
    }

    #[test]
    fn transient_chain_errors_retry() {
        let err: StepError = ChainError::Transport("reset".into()).into();
        assert_eq!(err.class, StepClass::Retry);
    }

    #[test]
    fn stale_reconciliation_retries_with_reconcile() {
        let err: StepError =
            InvariantViolation::new("RECONCILIATION_STALE", "61s old").into();
        assert_eq!(err.class, StepClass::Retry);
        assert!(err.needs_reconciliation());

        let err: StepError =
            InvariantViolation::new("SIGNER_SERIALIZATION", "reentrant").into();
        assert_eq!(err.class, StepClass::Fail);
        assert!(!err.needs_reconciliation());
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let id = WorkflowId::generate();
        assert_eq!(idempotency_key(id, "SubmitTx"), idempotency_key(id, "SubmitTx"));
        assert_ne!(idempotency_key(id, "SubmitTx"), idempotency_key(id, "AwaitReceipt"));
    }
}
