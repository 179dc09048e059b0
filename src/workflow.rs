//! Workflow data model: the frozen type set, lifecycle states, typed inputs,
//! and the durable records the store persists.
//!
//! The type set is closed by construction: [`WorkflowKind`] is a plain enum
//! and admission refuses anything that does not parse into it. Adding a kind
//! is a source change, not a runtime operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::ids::{ConversationId, EvmAddress, SignerAddress, StorageTxId, TxHash, WorkflowId};

/// The frozen set of workflow types the gateway executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Archive a conversation transcript as evidence, then submit the work
    /// and its evidence root on-chain.
    WorkSubmission,
    /// Submit a validator's score for previously submitted work.
    ScoreSubmission,
    /// Close the current epoch on a studio.
    CloseEpoch,
}

impl WorkflowKind {
    /// Every member of the frozen set, in declaration order.
    pub const ALL: [WorkflowKind; 3] = [
        WorkflowKind::WorkSubmission,
        WorkflowKind::ScoreSubmission,
        WorkflowKind::CloseEpoch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::WorkSubmission => "work_submission",
            WorkflowKind::ScoreSubmission => "score_submission",
            WorkflowKind::CloseEpoch => "close_epoch",
        }
    }
}

impl Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Workflow lifecycle state.
///
/// `Completed` and `Failed` are sinks; `Stalled` is alive and resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Running,
    Stalled,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "CREATED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Stalled => "STALLED",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
        }
    }
}

impl Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(WorkflowState::Created),
            "RUNNING" => Ok(WorkflowState::Running),
            "STALLED" => Ok(WorkflowState::Stalled),
            "COMPLETED" => Ok(WorkflowState::Completed),
            "FAILED" => Ok(WorkflowState::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Retrying,
    Stalled,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "PENDING",
            StepState::Running => "RUNNING",
            StepState::Succeeded => "SUCCEEDED",
            StepState::Retrying => "RETRYING",
            StepState::Stalled => "STALLED",
            StepState::Failed => "FAILED",
        }
    }
}

impl Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepState::Pending),
            "RUNNING" => Ok(StepState::Running),
            "SUCCEEDED" => Ok(StepState::Succeeded),
            "RETRYING" => Ok(StepState::Retrying),
            "STALLED" => Ok(StepState::Stalled),
            "FAILED" => Ok(StepState::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Input payload for a [`WorkflowKind::WorkSubmission`] workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSubmissionInput {
    /// Studio proxy contract the work is submitted to.
    pub studio: EvmAddress,
    /// Epoch the work belongs to.
    pub epoch: u64,
    /// On-chain identity of the agent that produced the work.
    pub agent: EvmAddress,
    /// Conversation whose transcript is archived as evidence.
    pub conversation_id: ConversationId,
}

/// Input payload for a [`WorkflowKind::ScoreSubmission`] workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmissionInput {
    pub studio: EvmAddress,
    pub epoch: u64,
    /// The validator agent submitting the score.
    pub agent: EvmAddress,
    /// The worker agent being scored.
    pub worker: EvmAddress,
    /// Score value; semantics belong to the studio's logic module.
    pub score: u64,
}

/// Input payload for a [`WorkflowKind::CloseEpoch`] workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseEpochInput {
    pub studio: EvmAddress,
    pub epoch: u64,
}

/// Typed workflow input, tagged by kind for durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowInput {
    WorkSubmission(WorkSubmissionInput),
    ScoreSubmission(ScoreSubmissionInput),
    CloseEpoch(CloseEpochInput),
}

impl WorkflowInput {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            WorkflowInput::WorkSubmission(_) => WorkflowKind::WorkSubmission,
            WorkflowInput::ScoreSubmission(_) => WorkflowKind::ScoreSubmission,
            WorkflowInput::CloseEpoch(_) => WorkflowKind::CloseEpoch,
        }
    }

    /// Studio contract the workflow targets.
    pub fn studio(&self) -> EvmAddress {
        match self {
            WorkflowInput::WorkSubmission(i) => i.studio,
            WorkflowInput::ScoreSubmission(i) => i.studio,
            WorkflowInput::CloseEpoch(i) => i.studio,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            WorkflowInput::WorkSubmission(i) => i.epoch,
            WorkflowInput::ScoreSubmission(i) => i.epoch,
            WorkflowInput::CloseEpoch(i) => i.epoch,
        }
    }
}

/// Result recorded when a workflow completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    /// Hash of the confirmed on-chain transaction.
    pub tx_hash: TxHash,
    /// Block the transaction was included in, when the receipt carried it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Evidence root committed on-chain, for evidence-bearing workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_root: Option<String>,
    /// Storage transaction holding the archived evidence package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_tx: Option<StorageTxId>,
}

/// The durable record of a workflow. Owned by the store; the engine holds
/// transient copies and writes every mutation back before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub signer: SignerAddress,
    pub input: WorkflowInput,
    pub state: WorkflowState,
    /// Name of the step the runtime is positioned at, if started.
    pub current_step: Option<String>,
    /// Total step attempts across the workflow's lifetime.
    pub attempt_count: u32,
    /// Hash of an in-flight submission, persisted so reconciliation and the
    /// signer slot survive a crash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx_hash: Option<TxHash>,
    /// When the tx recorded in `pending_tx_hash` was handed to the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When chain truth was last queried for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Why the workflow is stalled, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_reason: Option<String>,
    /// Terminal error code, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Creates a freshly admitted record in `CREATED`.
    pub fn admit(signer: SignerAddress, input: WorkflowInput) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::generate(),
            kind: input.kind(),
            signer,
            input,
            state: WorkflowState::Created,
            current_step: None,
            attempt_count: 0,
            pending_tx_hash: None,
            submitted_at: None,
            last_reconciled_at: None,
            stall_reason: None,
            error_code: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// The durable record of a single step within a workflow.
///
/// Identity is `(workflow_id, name)`; steps within a workflow form the linear
/// sequence declared by the kind's descriptor table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub state: StepState,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque step output, replayed into later steps after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StepRecord {
    pub fn pending(workflow_id: WorkflowId, name: &str) -> Self {
        Self {
            workflow_id,
            name: name.to_string(),
            state: StepState::Pending,
            attempt: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_str() {
        for kind in WorkflowKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkflowKind>().unwrap(), kind);
        }
        assert!("epoch_rollover".parse::<WorkflowKind>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Stalled.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(!WorkflowState::Created.is_terminal());
    }

    #[test]
    fn input_serde_is_kind_tagged() {
        let input = WorkflowInput::CloseEpoch(CloseEpochInput {
            studio: "0xdead00000000000000000000000000000000beef".parse().unwrap(),
            epoch: 7,
        });
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "close_epoch");
        let back: WorkflowInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn admit_starts_created() {
        let signer = "0xaaaa000000000000000000000000000000000001"
            .parse::<SignerAddress>()
            .unwrap();
        let record = WorkflowRecord::admit(
            signer,
            WorkflowInput::CloseEpoch(CloseEpochInput {
                studio: "0xdead00000000000000000000000000000000beef".parse().unwrap(),
                epoch: 1,
            }),
        );
        assert_eq!(record.state, WorkflowState::Created);
        assert_eq!(record.kind, WorkflowKind::CloseEpoch);
        assert!(record.current_step.is_none());
    }
}
