//! Chain adapter: submission, receipt polling, and error classification.
//!
//! The adapter is the only component that talks to the chain, and the chain's
//! receipts are the only authority on transaction outcomes. The adapter never
//! retries (retry scheduling belongs to the step runtime) and it never
//! holds policy: gas estimation and fee strategy are delegated to the
//! provider's fillers and configuration.
//!
//! # Submodules
//!
//! - [`eip155`] - Alloy-backed implementation for EVM chains

pub mod eip155;

use alloy_primitives::{Address, B256, Bytes};
use alloy_sol_types::{SolCall, sol};
use async_trait::async_trait;
use std::time::Duration;

use crate::ids::{EvmAddress, SignerAddress, TxHash};
use crate::workflow::WorkflowInput;

sol! {
    /// The studio proxy surface the gateway submits to. The studio's logic
    /// module interprets the arguments; the gateway only encodes them.
    interface IStudioProxy {
        function submitWork(address agent, uint64 epoch, bytes32 evidenceRoot) external;
        function submitScore(address agent, address worker, uint64 epoch, uint64 score) external;
        function closeEpoch(uint64 epoch) external;
    }
}

/// A prepared on-chain call: target studio and ABI-encoded calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioCall {
    pub to: EvmAddress,
    pub calldata: Bytes,
}

/// Error building calldata from a workflow input.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallEncodeError {
    /// Work submissions commit to an evidence root; none was supplied.
    #[error("work submission requires an evidence root")]
    MissingEvidenceRoot,
    /// The evidence root was not a 0x-prefixed 32-byte hex string.
    #[error("malformed evidence root: {0}")]
    MalformedEvidenceRoot(String),
}

impl StudioCall {
    /// Encodes the studio call for a workflow input. `evidence_root` is the
    /// 0x-prefixed hex root required by work submissions and ignored by the
    /// other kinds.
    pub fn encode(
        input: &WorkflowInput,
        evidence_root: Option<&str>,
    ) -> Result<Self, CallEncodeError> {
        let calldata: Bytes = match input {
            WorkflowInput::WorkSubmission(work) => {
                let root = evidence_root.ok_or(CallEncodeError::MissingEvidenceRoot)?;
                let root: B256 = root
                    .parse()
                    .map_err(|_| CallEncodeError::MalformedEvidenceRoot(root.to_string()))?;
                IStudioProxy::submitWorkCall {
                    agent: work.agent.as_address(),
                    epoch: work.epoch,
                    evidenceRoot: root,
                }
                .abi_encode()
                .into()
            }
            WorkflowInput::ScoreSubmission(score) => IStudioProxy::submitScoreCall {
                agent: score.agent.as_address(),
                worker: score.worker.as_address(),
                epoch: score.epoch,
                score: score.score,
            }
            .abi_encode()
            .into(),
            WorkflowInput::CloseEpoch(close) => IStudioProxy::closeEpochCall {
                epoch: close.epoch,
            }
            .abi_encode()
            .into(),
        };
        Ok(Self {
            to: input.studio(),
            calldata,
        })
    }
}

/// A confirmed receipt, reduced to what the engine records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub log_count: usize,
}

/// Outcome of a receipt query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Mined and successful.
    Confirmed(ConfirmedReceipt),
    /// Mined and reverted. The reason is carried through verbatim when the
    /// chain exposes one; `None` means the revert is opaque.
    Reverted { reason: Option<String> },
    /// The chain does not know the transaction (or no receipt appeared
    /// within the caller's window). Reconciliation decides what that means.
    NotFound,
}

/// Errors from the chain boundary, classified by kind rather than transport
/// detail. Transient kinds are retried by the step runtime; the adapter
/// itself never retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// Network-level failure reaching the RPC endpoint.
    #[error("chain transport error: {0}")]
    Transport(String),
    /// The RPC endpoint answered with a server-side error.
    #[error("chain rpc error: {0}")]
    Rpc(String),
    /// A receipt was returned but could not be interpreted.
    #[error("malformed receipt for {tx}: {details}")]
    MalformedReceipt { tx: TxHash, details: String },
}

impl ChainError {
    /// Whether the step runtime should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_) | ChainError::Rpc(_))
    }
}

/// Minimal chain surface the engine consumes. Receipts are authoritative;
/// everything else is advisory.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Signs and submits the call from `signer`, returning the transaction
    /// hash without waiting for inclusion.
    async fn submit(&self, signer: &SignerAddress, call: &StudioCall)
    -> Result<TxHash, ChainError>;

    /// Polls for a receipt until one appears or `timeout` elapses.
    async fn wait_receipt(
        &self,
        tx: &TxHash,
        timeout: Duration,
    ) -> Result<ReceiptStatus, ChainError>;

    /// Single receipt query, no waiting. Used by reconciliation.
    async fn transaction_status(&self, tx: &TxHash) -> Result<ReceiptStatus, ChainError>;

    /// The signer's nonce including pending transactions. Used by
    /// reconciliation to sanity-check an empty pending slot.
    async fn transaction_count(&self, signer: &SignerAddress) -> Result<u64, ChainError>;

    /// Replays a reverted call at `block` to recover its revert reason.
    /// Best-effort: `None` when the chain yields nothing usable.
    async fn revert_reason(
        &self,
        signer: &SignerAddress,
        call: &StudioCall,
        block: Option<u64>,
    ) -> Result<Option<String>, ChainError>;
}

/// Target address helper for building alloy requests.
pub(crate) fn to_alloy_address(address: &EvmAddress) -> Address {
    address.as_address()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CloseEpochInput, WorkSubmissionInput};

    fn studio() -> EvmAddress {
        "0xdead00000000000000000000000000000000beef".parse().unwrap()
    }

    #[test]
    fn close_epoch_encodes_selector_and_epoch() {
        let input = WorkflowInput::CloseEpoch(CloseEpochInput {
            studio: studio(),
            epoch: 7,
        });
        let call = StudioCall::encode(&input, None).unwrap();
        assert_eq!(call.to, studio());
        assert_eq!(&call.calldata[..4], IStudioProxy::closeEpochCall::SELECTOR);
    }

    #[test]
    fn work_submission_requires_root() {
        let input = WorkflowInput::WorkSubmission(WorkSubmissionInput {
            studio: studio(),
            epoch: 7,
            agent: "0xbeef00000000000000000000000000000000dead".parse().unwrap(),
            conversation_id: "CONV-1".parse().unwrap(),
        });
        assert!(matches!(
            StudioCall::encode(&input, None),
            Err(CallEncodeError::MissingEvidenceRoot)
        ));
        assert!(matches!(
            StudioCall::encode(&input, Some("0x1234")),
            Err(CallEncodeError::MalformedEvidenceRoot(_))
        ));
        let ok = StudioCall::encode(
            &input,
            Some("0x1111111111111111111111111111111111111111111111111111111111111111"),
        )
        .unwrap();
        assert_eq!(&ok.calldata[..4], IStudioProxy::submitWorkCall::SELECTOR);
    }

    #[test]
    fn transient_classification() {
        assert!(ChainError::Transport("timeout".into()).is_transient());
        assert!(ChainError::Rpc("503".into()).is_transient());
        let tx = TxHash::parse(
            "0x00000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();
        assert!(
            !ChainError::MalformedReceipt {
                tx,
                details: "missing status".into()
            }
            .is_transient()
        );
    }
}
