//! Durable, crash-safe persistence for workflows and steps.
//!
//! The store is the single mutable authority on workflow state: every
//! transition is written before the engine acts on it, and in-memory state is
//! never consulted as truth. Multi-instance coordination uses a per-workflow
//! lease; an engine must hold a workflow's lease to drive it.
//!
//! # Submodules
//!
//! - [`sqlite`] - sqlx-backed implementation

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ids::{SignerAddress, WorkflowId};
use crate::workflow::{StepRecord, WorkflowKind, WorkflowRecord, WorkflowState};

/// Store-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing database rejected or dropped the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The workflow does not exist.
    #[error("workflow {0} not found")]
    NotFound(WorkflowId),
    /// The workflow reached a terminal state; its fields are immutable.
    #[error("workflow {0} is terminal and immutable")]
    TerminalImmutable(WorkflowId),
    /// A persisted record failed to deserialize.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Filter for workflow listings. All fields conjunctive; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub state: Option<WorkflowState>,
    pub kind: Option<WorkflowKind>,
    pub signer: Option<SignerAddress>,
}

/// Pagination window for listings.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Durable record store for workflows and their steps.
///
/// All mutations are durable before the call returns. `update` and
/// `savepoint` refuse to touch a workflow that is already terminal.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persists a freshly admitted workflow.
    async fn create(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    /// Loads a workflow by id.
    async fn load(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Writes back a workflow's mutable fields. Fails with
    /// [`StoreError::TerminalImmutable`] if the persisted row is already
    /// `COMPLETED` or `FAILED`.
    async fn update(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    /// Filtered, paginated listing, newest first.
    async fn list(
        &self,
        filter: &WorkflowFilter,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// All workflows in a given state.
    async fn list_by_state(&self, state: WorkflowState) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// All workflows that are not yet terminal, oldest first. Used by boot
    /// recovery.
    async fn list_non_terminal(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// `RUNNING` workflows whose lease has lapsed and which have not been
    /// touched since `older_than`, i.e. abandoned by a dead or wedged
    /// driver.
    async fn list_stuck(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Durably records a step transition (upsert on `(workflow_id, name)`)
    /// and touches the owning workflow, atomically.
    async fn savepoint(&self, step: &StepRecord) -> Result<(), StoreError>;

    /// All step records of a workflow.
    async fn load_steps(&self, id: WorkflowId) -> Result<Vec<StepRecord>, StoreError>;

    /// Number of non-terminal workflows.
    async fn count_active(&self) -> Result<u64, StoreError>;

    /// Number of non-terminal workflows of a kind.
    async fn count_active_by_kind(&self, kind: WorkflowKind) -> Result<u64, StoreError>;

    /// Attempts to take (or renew) the workflow's drive lease. Returns
    /// whether the caller now holds it. A lapsed lease is claimable by
    /// anyone; a live lease only by its owner.
    async fn claim(
        &self,
        id: WorkflowId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Releases a lease held by `owner`. No-op if not held.
    async fn release(&self, id: WorkflowId, owner: &str) -> Result<(), StoreError>;
}
