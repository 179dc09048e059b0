//! Per-signer serialization of on-chain submissions.
//!
//! One signer, one in-flight transaction: the nonce stream of a signer is
//! totally ordered, so two concurrent submissions from the same address would
//! race for the same nonce. The serializer maps each signer to at most one
//! pending-chain slot. Contenders wait (the step runtime backs off and
//! retries); they never parallelize.
//!
//! The map itself is in-memory. Crash safety comes from the store: the slot's
//! `tx_hash` is also persisted on the owning workflow record, and boot
//! recovery restores slots before any new submission is admitted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::ids::{SignerAddress, TxHash, WorkflowId};

/// The single outstanding on-chain transaction for a signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChainSlot {
    /// Workflow that holds the slot.
    pub workflow: WorkflowId,
    /// Hash of the submitted transaction, once it has been handed to the
    /// chain. `None` while the holder is still preparing the submission.
    pub tx_hash: Option<TxHash>,
    pub acquired_at: DateTime<Utc>,
}

/// Error returned by [`NonceSerializer::acquire`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    /// Another workflow already holds the slot. The caller should back off
    /// and retry; this is contention, not a bug.
    #[error("signer {signer} busy: workflow {holder} has a transaction in flight")]
    Busy {
        signer: SignerAddress,
        holder: WorkflowId,
    },
    /// The same workflow tried to acquire the slot it already holds. This is
    /// an invariant violation, not contention.
    #[error("signer {signer} slot re-acquired by its holder {holder}")]
    Reentrant {
        signer: SignerAddress,
        holder: WorkflowId,
    },
}

/// In-memory map `signer -> pending slot` enforcing one in-flight transaction
/// per signer.
#[derive(Debug, Default)]
pub struct NonceSerializer {
    slots: DashMap<SignerAddress, PendingChainSlot>,
}

impl NonceSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the signer's slot for `workflow`.
    pub fn acquire(
        &self,
        signer: SignerAddress,
        workflow: WorkflowId,
    ) -> Result<(), AcquireError> {
        match self.slots.entry(signer) {
            Entry::Occupied(occupied) => {
                let holder = occupied.get().workflow;
                if holder == workflow {
                    Err(AcquireError::Reentrant { signer, holder })
                } else {
                    Err(AcquireError::Busy { signer, holder })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingChainSlot {
                    workflow,
                    tx_hash: None,
                    acquired_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Records the submitted transaction hash on an already-held slot.
    pub fn record_submission(&self, signer: &SignerAddress, tx_hash: TxHash) {
        if let Some(mut slot) = self.slots.get_mut(signer) {
            slot.tx_hash = Some(tx_hash);
        }
    }

    /// Releases the signer's slot. Safe to call when no slot is held.
    pub fn release(&self, signer: &SignerAddress) {
        self.slots.remove(signer);
    }

    /// The current slot for a signer, if any.
    pub fn pending(&self, signer: &SignerAddress) -> Option<PendingChainSlot> {
        self.slots.get(signer).map(|slot| slot.clone())
    }

    /// Restores a slot from persisted state during boot recovery. Overwrites
    /// silently: recovery is single-threaded and store truth wins.
    pub fn restore(&self, signer: SignerAddress, slot: PendingChainSlot) {
        self.slots.insert(signer, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SignerAddress {
        "0xaaaa000000000000000000000000000000000001".parse().unwrap()
    }

    #[test]
    fn second_acquire_is_busy() {
        let serializer = NonceSerializer::new();
        let a = WorkflowId::generate();
        let b = WorkflowId::generate();
        serializer.acquire(signer(), a).unwrap();
        let err = serializer.acquire(signer(), b).unwrap_err();
        assert!(matches!(err, AcquireError::Busy { holder, .. } if holder == a));
    }

    #[test]
    fn reentrant_acquire_is_a_violation() {
        let serializer = NonceSerializer::new();
        let a = WorkflowId::generate();
        serializer.acquire(signer(), a).unwrap();
        let err = serializer.acquire(signer(), a).unwrap_err();
        assert!(matches!(err, AcquireError::Reentrant { .. }));
    }

    #[test]
    fn release_frees_the_slot() {
        let serializer = NonceSerializer::new();
        let a = WorkflowId::generate();
        let b = WorkflowId::generate();
        serializer.acquire(signer(), a).unwrap();
        serializer.release(&signer());
        serializer.acquire(signer(), b).unwrap();
        assert_eq!(serializer.pending(&signer()).unwrap().workflow, b);
    }

    #[test]
    fn record_submission_fills_tx_hash() {
        let serializer = NonceSerializer::new();
        let a = WorkflowId::generate();
        serializer.acquire(signer(), a).unwrap();
        let hash = TxHash::parse(
            "0x00000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();
        serializer.record_submission(&signer(), hash);
        assert_eq!(serializer.pending(&signer()).unwrap().tx_hash, Some(hash));
    }

    #[test]
    fn independent_signers_do_not_contend() {
        let serializer = NonceSerializer::new();
        let other: SignerAddress =
            "0xbbbb000000000000000000000000000000000002".parse().unwrap();
        serializer.acquire(signer(), WorkflowId::generate()).unwrap();
        serializer.acquire(other, WorkflowId::generate()).unwrap();
    }
}
