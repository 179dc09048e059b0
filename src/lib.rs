//! ChaosChain transaction orchestration gateway.
//!
//! The gateway sits between off-chain agents and on-chain studios. Agents
//! submit typed workflow requests (work submissions, score submissions,
//! epoch closures) and the gateway lands them on-chain reliably despite
//! network flakiness, reorgs, restarts, and signers shared across concurrent
//! submissions. Conversation transcripts are archived as evidence to
//! content-addressed storage before the work that references them is
//! submitted.
//!
//! # Design
//!
//! The core is a durable, typed, step-structured workflow engine:
//!
//! - **Frozen workflow types**: the three workflow kinds are a closed enum;
//!   adding one is a source change.
//! - **Crash-safe persistence**: every step transition is written to the
//!   store before the engine acts on it ([`store`]).
//! - **Strict signer serialization**: one in-flight transaction per signer,
//!   enforced by the nonce serializer ([`nonce`]).
//! - **Reconciliation before irreversible action**: chain truth is queried,
//!   and must be at most 60 seconds old, before every submission
//!   ([`reconcile`], [`guards`]).
//! - **Tri-state lifecycle**: a workflow is running, stalled (alive, awaiting
//!   external conditions), or terminally completed/failed ([`workflow`]).
//!
//! # Modules
//!
//! - [`chain`] — Chain adapter: submission, receipt polling, error kinds.
//! - [`config`] — JSON + environment configuration.
//! - [`engine`] — Admission, drivers, boot recovery, the stalled sweep.
//! - [`evidence`] — Evidence packages, archival, transcripts.
//! - [`guards`] — Invariant guards and branded-identifier discipline.
//! - [`handlers`] — HTTP endpoints (submit, query, resume, list).
//! - [`ids`] — Branded identifier types.
//! - [`metrics`] — Write-only metrics sink.
//! - [`nonce`] — Per-signer pending-transaction slots.
//! - [`reconcile`] — Chain-truth reconciliation.
//! - [`signer`] — Signer registry (existence checks only).
//! - [`step`] / [`steps`] — The step runtime and the per-kind sequences.
//! - [`store`] — Durable workflow/step persistence.

pub mod chain;
pub mod config;
pub mod engine;
pub mod evidence;
pub mod guards;
pub mod handlers;
pub mod ids;
pub mod metrics;
pub mod nonce;
pub mod reconcile;
pub mod sig_down;
pub mod signer;
pub mod step;
pub mod steps;
pub mod store;
pub mod telemetry;
pub mod workflow;
