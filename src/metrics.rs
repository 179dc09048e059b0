//! Write-only observability hooks.
//!
//! The engine emits [`MetricEvent`]s at every lifecycle transition and never
//! reads anything back; a sink has no query surface at all. The default
//! implementation drops events; the development implementation prints one
//! JSON object per line.

use serde::Serialize;

use crate::ids::{SignerAddress, TxHash, WorkflowId};
use crate::workflow::WorkflowKind;

/// The fixed event vocabulary. New events are a source change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    WorkflowCreated {
        workflow: WorkflowId,
        kind: WorkflowKind,
    },
    WorkflowStarted {
        workflow: WorkflowId,
    },
    WorkflowCompleted {
        workflow: WorkflowId,
    },
    WorkflowFailed {
        workflow: WorkflowId,
        code: String,
    },
    WorkflowStalled {
        workflow: WorkflowId,
        reason: String,
    },
    WorkflowResumed {
        workflow: WorkflowId,
    },
    StepStarted {
        workflow: WorkflowId,
        step: &'static str,
    },
    StepCompleted {
        workflow: WorkflowId,
        step: &'static str,
        attempt: u32,
    },
    StepRetried {
        workflow: WorkflowId,
        step: &'static str,
        attempt: u32,
    },
    StepTimedOut {
        workflow: WorkflowId,
        step: &'static str,
    },
    TxSubmitted {
        workflow: WorkflowId,
        signer: SignerAddress,
        tx: TxHash,
    },
    TxConfirmed {
        workflow: WorkflowId,
        tx: TxHash,
    },
    TxReverted {
        workflow: WorkflowId,
        tx: TxHash,
        reason: Option<String>,
    },
    TxNotFound {
        workflow: WorkflowId,
        tx: TxHash,
    },
    AdmissionRejected {
        kind: Option<WorkflowKind>,
        code: &'static str,
    },
    ReconciliationRan {
        workflow: WorkflowId,
        outcome: &'static str,
    },
}

/// Write-only metrics sink. Implementations must be cheap and non-blocking;
/// the engine calls `emit` inline on its hot path.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: &MetricEvent);
}

/// Discards every event. The default for library consumers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _event: &MetricEvent) {}
}

/// Prints one JSON object per event to stdout. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesMetrics;

impl MetricsSink for JsonLinesMetrics {
    fn emit(&self, event: &MetricEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize metric event"),
        }
    }
}
