//! Gateway HTTP entrypoint.
//!
//! Launches the workflow engine and an Axum server exposing the workflow
//! interface:
//!
//! - `POST /workflows` – submit a typed workflow
//! - `GET /workflows/{id}` – query workflow state
//! - `POST /workflows/{id}/resume` – resume a stalled workflow
//! - `GET /workflows` – filtered listing
//! - `GET /health` – liveness
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - `STORE_URL`, `CHAIN_RPC_URL`, `STORAGE_ENDPOINT`, `TRANSCRIPTS_ENDPOINT`
//!   locate the collaborators
//! - `OTEL_*` variables enable OpenTelemetry export

use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors, trace::TraceLayer};

use chaoschain_gateway::chain::ChainAdapter;
use chaoschain_gateway::chain::eip155::Eip155ChainAdapter;
use chaoschain_gateway::config::Config;
use chaoschain_gateway::engine::{Components, WorkflowEngine};
use chaoschain_gateway::evidence::EvidenceBuilder;
use chaoschain_gateway::evidence::storage::{EvidenceStorage, HttpEvidenceStorage};
use chaoschain_gateway::evidence::transcripts::HttpConversationSource;
use chaoschain_gateway::handlers;
use chaoschain_gateway::metrics::{JsonLinesMetrics, MetricsSink, NoopMetrics};
use chaoschain_gateway::nonce::NonceSerializer;
use chaoschain_gateway::reconcile::Reconciler;
use chaoschain_gateway::sig_down::SigDown;
use chaoschain_gateway::signer::{InMemorySignerRegistry, SignerRegistry};
use chaoschain_gateway::store::WorkflowStore;
use chaoschain_gateway::store::sqlite::SqliteWorkflowStore;
use chaoschain_gateway::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();
    let config = Config::load()?;
    let settings = config.engine_settings();

    let store: Arc<dyn WorkflowStore> =
        Arc::new(SqliteWorkflowStore::connect(config.store_url()).await?);

    let chain_id = config.chain().chain_id;
    let keys = config.signer_keys();
    let signers: Arc<dyn SignerRegistry> =
        Arc::new(InMemorySignerRegistry::from_keys(&keys, Some(chain_id))?);
    let wallet_signers = keys
        .iter()
        .map(|key| {
            PrivateKeySigner::from_bytes(key).map(|s| s.with_chain_id(Some(chain_id)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let rpc_url = config.chain().rpc_url.clone().into_inner();
    let chain: Arc<dyn ChainAdapter> =
        Arc::new(Eip155ChainAdapter::connect(rpc_url, chain_id, wallet_signers)?);

    let storage: Arc<dyn EvidenceStorage> = Arc::new(HttpEvidenceStorage::new(
        config.evidence().storage_endpoint.clone().into_inner(),
    ));
    let transcripts = Arc::new(HttpConversationSource::new(
        config.evidence().transcripts_endpoint.clone().into_inner(),
    ));
    let evidence = EvidenceBuilder::new(transcripts);

    let metrics: Arc<dyn MetricsSink> = if std::env::var("METRICS_JSON").is_ok() {
        Arc::new(JsonLinesMetrics)
    } else {
        Arc::new(NoopMetrics)
    };

    let nonce = Arc::new(NonceSerializer::new());
    let reconciler = Reconciler::new(
        Arc::clone(&chain),
        Arc::clone(&store),
        Arc::clone(&nonce),
        Arc::clone(&metrics),
        chrono::Duration::from_std(settings.receipt_timeout)?,
    );

    let engine = WorkflowEngine::new(Components {
        store,
        chain,
        storage,
        evidence,
        signers,
        nonce,
        reconciler,
        metrics,
        settings,
    });
    engine.start().await?;

    let app = Router::new()
        .merge(handlers::routes())
        .with_state(Arc::new(engine.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!(%addr, "starting gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let sig_down = SigDown::try_new()?;
    let token = sig_down.cancellation_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    engine.shutdown().await;
    Ok(())
}
