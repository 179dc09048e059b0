//! HTTP endpoints exposed by the gateway.
//!
//! These are thin shells over [`WorkflowEngine`]: submission, query, resume,
//! and listing. Payloads are structured JSON; errors map onto the user-visible
//! surface of the taxonomy: kind, code, message, retryable.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::engine::{GatewayError, WorkflowEngine};
use crate::ids::{SignerAddress, WorkflowId};
use crate::store::{Page, WorkflowFilter};
use crate::workflow::{WorkflowKind, WorkflowState};

pub fn routes() -> Router<Arc<WorkflowEngine>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/workflows", post(post_workflow))
        .route("/workflows", get(get_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/resume", post(post_resume))
}

/// `GET /`: Greeting and build identity.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    (StatusCode::OK, format!("{pkg_name} {pkg_version}"))
}

#[instrument(skip_all)]
pub async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Body of `POST /workflows`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Workflow type; must name a member of the frozen set.
    #[serde(rename = "type")]
    pub kind: String,
    pub signer_address: String,
    /// Type-specific input payload.
    pub input: serde_json::Value,
}

/// `POST /workflows`: Admits a workflow and returns its id.
#[instrument(skip_all, fields(kind = %body.kind))]
pub async fn post_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    match engine
        .submit_raw(&body.kind, &body.signer_address, body.input)
        .await
    {
        Ok(workflow_id) => (
            StatusCode::CREATED,
            Json(json!({ "workflowId": workflow_id })),
        )
            .into_response(),
        Err(error) => {
            tracing::warn!(code = error.code(), "workflow admission rejected");
            error.into_response()
        }
    }
}

/// `GET /workflows/{id}`: Read-only state query against the store.
#[instrument(skip_all, fields(workflow_id = %id))]
pub async fn get_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match engine.get(id).await {
        Ok(status) => Json(status).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /workflows/{id}/resume`: Moves a stalled workflow back to running
/// after reconciliation. Idempotent.
#[instrument(skip_all, fields(workflow_id = %id))]
pub async fn post_resume(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match engine.resume(id).await {
        Ok(status) => Json(status).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Query string of `GET /workflows`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub signer: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// `GET /workflows`: Filtered, paginated listing.
#[instrument(skip_all)]
pub async fn get_workflows(
    State(engine): State<Arc<WorkflowEngine>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let mut filter = WorkflowFilter::default();
    if let Some(state) = &query.state {
        match WorkflowState::from_str(state) {
            Ok(state) => filter.state = Some(state),
            Err(_) => return bad_request(format!("unknown state {state:?}")),
        }
    }
    if let Some(kind) = &query.kind {
        match WorkflowKind::from_str(kind) {
            Ok(kind) => filter.kind = Some(kind),
            Err(_) => return bad_request(format!("unknown type {kind:?}")),
        }
    }
    if let Some(signer) = &query.signer {
        match SignerAddress::parse(signer) {
            Ok(signer) => filter.signer = Some(signer),
            Err(e) => return bad_request(e.to_string()),
        }
    }
    let page = Page {
        limit: query.limit.unwrap_or(Page::default().limit).min(500),
        offset: query.offset.unwrap_or(0),
    };
    match engine.list(filter, page).await {
        Ok(workflows) => Json(json!({ "workflows": workflows })).into_response(),
        Err(error) => error.into_response(),
    }
}

fn parse_id(raw: &str) -> Result<WorkflowId, Response> {
    WorkflowId::from_str(raw).map_err(|_| bad_request(format!("malformed workflow id {raw:?}")))
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            kind: "request",
            code: "BAD_REQUEST".to_string(),
            message,
            retryable: false,
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    kind: &'static str,
    code: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::FrozenTypeViolation(_)
            | GatewayError::SignerNotFound(_)
            | GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            kind: self.kind(),
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        };
        (status, Json(body)).into_response()
    }
}
