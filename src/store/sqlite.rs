//! sqlx-backed store implementation.
//!
//! SQLite in WAL mode: every mutation commits before the call returns, and a
//! crash at any point leaves either the old or the new row, never a torn one.
//! Timestamps are stored as integer milliseconds, structured fields as JSON
//! text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::str::FromStr;

use crate::ids::{SignerAddress, TxHash, WorkflowId};
use crate::store::{Page, StoreError, WorkflowFilter, WorkflowStore};
use crate::workflow::{
    StepRecord, StepState, WorkflowKind, WorkflowRecord, WorkflowState,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id                 TEXT PRIMARY KEY,
    kind               TEXT NOT NULL,
    signer             TEXT NOT NULL,
    input              TEXT NOT NULL,
    state              TEXT NOT NULL,
    current_step       TEXT,
    attempt_count      INTEGER NOT NULL DEFAULT 0,
    pending_tx_hash    TEXT,
    submitted_at       INTEGER,
    last_reconciled_at INTEGER,
    stall_reason       TEXT,
    error_code         TEXT,
    result             TEXT,
    lease_owner        TEXT,
    lease_until        INTEGER,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflows_state ON workflows(state);
CREATE INDEX IF NOT EXISTS idx_workflows_signer ON workflows(signer);
CREATE TABLE IF NOT EXISTS workflow_steps (
    workflow_id  TEXT NOT NULL,
    name         TEXT NOT NULL,
    state        TEXT NOT NULL,
    attempt      INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    started_at   INTEGER,
    completed_at INTEGER,
    output       TEXT,
    PRIMARY KEY (workflow_id, name)
);
"#;

const NON_TERMINAL: &str = "('CREATED', 'RUNNING', 'STALLED')";

/// Durable workflow store over SQLite.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

fn corrupt<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> StoreError + '_ {
    move |e| StoreError::Corrupt(format!("{what}: {e}"))
}

fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let signer: String = row.try_get("signer")?;
    let input: String = row.try_get("input")?;
    let state: String = row.try_get("state")?;
    let pending_tx_hash: Option<String> = row.try_get("pending_tx_hash")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(WorkflowRecord {
        id: WorkflowId::from_str(&id).map_err(corrupt("workflow id"))?,
        kind: WorkflowKind::from_str(&kind)
            .map_err(|k| StoreError::Corrupt(format!("unknown kind {k:?}")))?,
        signer: SignerAddress::parse(&signer).map_err(corrupt("signer"))?,
        input: serde_json::from_str(&input).map_err(corrupt("input"))?,
        state: WorkflowState::from_str(&state)
            .map_err(|s| StoreError::Corrupt(format!("unknown state {s:?}")))?,
        current_step: row.try_get("current_step")?,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        pending_tx_hash: pending_tx_hash
            .map(|h| TxHash::parse(&h))
            .transpose()
            .map_err(corrupt("pending tx hash"))?,
        submitted_at: opt_from_millis(row.try_get("submitted_at")?)?,
        last_reconciled_at: opt_from_millis(row.try_get("last_reconciled_at")?)?,
        stall_reason: row.try_get("stall_reason")?,
        error_code: row.try_get("error_code")?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(corrupt("result"))?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<StepRecord, StoreError> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let state: String = row.try_get("state")?;
    let output: Option<String> = row.try_get("output")?;
    Ok(StepRecord {
        workflow_id: WorkflowId::from_str(&workflow_id).map_err(corrupt("workflow id"))?,
        name: row.try_get("name")?,
        state: StepState::from_str(&state)
            .map_err(|s| StoreError::Corrupt(format!("unknown step state {s:?}")))?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        last_error: row.try_get("last_error")?,
        started_at: opt_from_millis(row.try_get("started_at")?)?,
        completed_at: opt_from_millis(row.try_get("completed_at")?)?,
        output: output
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(corrupt("step output"))?,
    })
}

impl SqliteWorkflowStore {
    /// Connects, enables WAL, and bootstraps the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // In-memory databases exist per-connection; a larger pool would see
        // empty clones.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = FULL").execute(&pool).await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn not_found_or_terminal(&self, id: WorkflowId) -> StoreError {
        match self.load(id).await {
            Ok(Some(existing)) if existing.is_terminal() => StoreError::TerminalImmutable(id),
            Ok(Some(_)) | Ok(None) => StoreError::NotFound(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn create(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let input = serde_json::to_string(&workflow.input)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflows (id, kind, signer, input, state, current_step, \
             attempt_count, pending_tx_hash, submitted_at, last_reconciled_at, stall_reason, \
             error_code, result, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.id.to_string())
        .bind(workflow.kind.as_str())
        .bind(workflow.signer.to_string())
        .bind(input)
        .bind(workflow.state.as_str())
        .bind(&workflow.current_step)
        .bind(workflow.attempt_count as i64)
        .bind(workflow.pending_tx_hash.map(|h| h.to_string()))
        .bind(opt_millis(workflow.submitted_at))
        .bind(opt_millis(workflow.last_reconciled_at))
        .bind(&workflow.stall_reason)
        .bind(&workflow.error_code)
        .bind(
            workflow
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        )
        .bind(millis(workflow.created_at))
        .bind(millis(workflow.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn update(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let result_json = workflow
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let updated = sqlx::query(&format!(
            "UPDATE workflows SET state = ?, current_step = ?, attempt_count = ?, \
             pending_tx_hash = ?, submitted_at = ?, last_reconciled_at = ?, stall_reason = ?, \
             error_code = ?, result = ?, updated_at = ? \
             WHERE id = ? AND state IN {NON_TERMINAL}"
        ))
        .bind(workflow.state.as_str())
        .bind(&workflow.current_step)
        .bind(workflow.attempt_count as i64)
        .bind(workflow.pending_tx_hash.map(|h| h.to_string()))
        .bind(opt_millis(workflow.submitted_at))
        .bind(opt_millis(workflow.last_reconciled_at))
        .bind(&workflow.stall_reason)
        .bind(&workflow.error_code)
        .bind(result_json)
        .bind(millis(Utc::now()))
        .bind(workflow.id.to_string())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(self.not_found_or_terminal(workflow.id).await);
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &WorkflowFilter,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut query: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM workflows WHERE 1 = 1");
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(signer) = filter.signer {
            query.push(" AND signer = ").push_bind(signer.to_string());
        }
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn list_by_state(&self, state: WorkflowState) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflows WHERE state = ? ORDER BY created_at ASC")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn list_non_terminal(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM workflows WHERE state IN {NON_TERMINAL} ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn list_stuck(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let now = millis(Utc::now());
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE state = 'RUNNING' \
             AND (lease_until IS NULL OR lease_until < ?) AND updated_at < ? \
             ORDER BY updated_at ASC",
        )
        .bind(now)
        .bind(millis(older_than))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn savepoint(&self, step: &StepRecord) -> Result<(), StoreError> {
        let output = step
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO workflow_steps \
             (workflow_id, name, state, attempt, last_error, started_at, completed_at, output) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (workflow_id, name) DO UPDATE SET \
             state = excluded.state, attempt = excluded.attempt, \
             last_error = excluded.last_error, started_at = excluded.started_at, \
             completed_at = excluded.completed_at, output = excluded.output",
        )
        .bind(step.workflow_id.to_string())
        .bind(&step.name)
        .bind(step.state.as_str())
        .bind(step.attempt as i64)
        .bind(&step.last_error)
        .bind(opt_millis(step.started_at))
        .bind(opt_millis(step.completed_at))
        .bind(output)
        .execute(&mut *tx)
        .await?;
        let touched = sqlx::query(&format!(
            "UPDATE workflows SET updated_at = ? WHERE id = ? AND state IN {NON_TERMINAL}"
        ))
        .bind(millis(Utc::now()))
        .bind(step.workflow_id.to_string())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.not_found_or_terminal(step.workflow_id).await);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_steps(&self, id: WorkflowId) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE workflow_id = ? ORDER BY started_at ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_step).collect()
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM workflows WHERE state IN {NON_TERMINAL}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_active_by_kind(&self, kind: WorkflowKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM workflows WHERE kind = ? AND state IN {NON_TERMINAL}"
        ))
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn claim(
        &self,
        id: WorkflowId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = millis(Utc::now());
        let claimed = sqlx::query(&format!(
            "UPDATE workflows SET lease_owner = ?, lease_until = ? \
             WHERE id = ? AND state IN {NON_TERMINAL} \
             AND (lease_owner IS NULL OR lease_owner = ? OR lease_until < ?)"
        ))
        .bind(owner)
        .bind(millis(until))
        .bind(id.to_string())
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(claimed.rows_affected() > 0)
    }

    async fn release(&self, id: WorkflowId, owner: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflows SET lease_owner = NULL, lease_until = NULL \
             WHERE id = ? AND lease_owner = ?",
        )
        .bind(id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CloseEpochInput, WorkflowInput};
    use chrono::Duration;

    async fn store() -> SqliteWorkflowStore {
        SqliteWorkflowStore::connect("sqlite::memory:").await.unwrap()
    }

    fn record() -> WorkflowRecord {
        WorkflowRecord::admit(
            "0xaaaa000000000000000000000000000000000001".parse().unwrap(),
            WorkflowInput::CloseEpoch(CloseEpochInput {
                studio: "0xdead00000000000000000000000000000000beef".parse().unwrap(),
                epoch: 7,
            }),
        )
    }

    #[tokio::test]
    async fn create_and_load_roundtrip() {
        let store = store().await;
        let workflow = record();
        store.create(&workflow).await.unwrap();
        let loaded = store.load(workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, workflow.id);
        assert_eq!(loaded.kind, workflow.kind);
        assert_eq!(loaded.input, workflow.input);
        assert_eq!(loaded.state, WorkflowState::Created);
    }

    #[tokio::test]
    async fn update_mutates_non_terminal_rows() {
        let store = store().await;
        let mut workflow = record();
        store.create(&workflow).await.unwrap();
        workflow.state = WorkflowState::Running;
        workflow.current_step = Some("Reconcile".to_string());
        store.update(&workflow).await.unwrap();
        let loaded = store.load(workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, WorkflowState::Running);
        assert_eq!(loaded.current_step.as_deref(), Some("Reconcile"));
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let store = store().await;
        let mut workflow = record();
        store.create(&workflow).await.unwrap();
        workflow.state = WorkflowState::Failed;
        workflow.error_code = Some("work already exists".to_string());
        store.update(&workflow).await.unwrap();

        workflow.state = WorkflowState::Running;
        let err = store.update(&workflow).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalImmutable(_)));

        let step = StepRecord::pending(workflow.id, "SubmitTx");
        let err = store.savepoint(&step).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalImmutable(_)));
    }

    #[tokio::test]
    async fn savepoint_upserts_steps() {
        let store = store().await;
        let workflow = record();
        store.create(&workflow).await.unwrap();

        let mut step = StepRecord::pending(workflow.id, "Reconcile");
        store.savepoint(&step).await.unwrap();
        step.state = StepState::Succeeded;
        step.attempt = 1;
        step.output = Some(serde_json::json!({"outcome": "proceed"}));
        store.savepoint(&step).await.unwrap();

        let steps = store.load_steps(workflow.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].state, StepState::Succeeded);
        assert_eq!(steps[0].output, step.output);
    }

    #[tokio::test]
    async fn counts_track_non_terminal() {
        let store = store().await;
        let mut a = record();
        let b = record();
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        assert_eq!(store.count_active().await.unwrap(), 2);
        assert_eq!(
            store
                .count_active_by_kind(WorkflowKind::CloseEpoch)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_active_by_kind(WorkflowKind::WorkSubmission)
                .await
                .unwrap(),
            0
        );

        a.state = WorkflowState::Completed;
        store.update(&a).await.unwrap();
        assert_eq!(store.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lease_claims_are_exclusive() {
        let store = store().await;
        let workflow = record();
        store.create(&workflow).await.unwrap();
        let until = Utc::now() + Duration::seconds(30);

        assert!(store.claim(workflow.id, "engine-a", until).await.unwrap());
        assert!(!store.claim(workflow.id, "engine-b", until).await.unwrap());
        // The holder may renew.
        assert!(store.claim(workflow.id, "engine-a", until).await.unwrap());

        store.release(workflow.id, "engine-a").await.unwrap();
        assert!(store.claim(workflow.id, "engine-b", until).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store().await;
        let mut stalled = record();
        store.create(&stalled).await.unwrap();
        stalled.state = WorkflowState::Stalled;
        stalled.stall_reason = Some("STORAGE_UNAVAILABLE".to_string());
        store.update(&stalled).await.unwrap();
        store.create(&record()).await.unwrap();

        let filter = WorkflowFilter {
            state: Some(WorkflowState::Stalled),
            ..Default::default()
        };
        let listed = store.list(&filter, Page::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, stalled.id);

        let all = store.list(&WorkflowFilter::default(), Page::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let page = Page { limit: 1, offset: 1 };
        let second = store.list(&WorkflowFilter::default(), page).await.unwrap();
        assert_eq!(second.len(), 1);
    }
}
