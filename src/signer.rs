//! Signer registry: existence checks for caller-provided signer addresses.
//!
//! The contract is deliberately narrow. A registry answers "does this address
//! belong to a signer the gateway can use" and hands back an opaque handle; it
//! has no API that returns "a signer" without the caller naming an address
//! first. Selection policy lives with the agents, not here.

use alloy_primitives::B256;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::SignerAddress;

/// Handle to a registered signer. The key material never leaves the handle.
#[derive(Clone)]
pub struct SignerHandle {
    address: SignerAddress,
    signer: Arc<PrivateKeySigner>,
}

impl SignerHandle {
    pub fn address(&self) -> SignerAddress {
        self.address
    }

    /// The underlying local signer, for wallet registration in the chain
    /// adapter.
    pub fn local(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

impl std::fmt::Debug for SignerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerHandle")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Registry of signers the gateway may submit with.
///
/// Implementations validate existence only. There is intentionally no
/// `any()`, `next()`, or `choose()`; absence of a selection API is part of
/// the contract.
pub trait SignerRegistry: Send + Sync {
    /// Whether a signer with this address is registered.
    fn is_available(&self, address: &SignerAddress) -> bool;

    /// The handle for this address, if registered.
    fn get(&self, address: &SignerAddress) -> Option<SignerHandle>;

    /// Every registered address, for diagnostics.
    fn list(&self) -> Vec<SignerAddress>;
}

/// A private key failed to load into the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid signer key: {0}")]
pub struct SignerInitError(String);

/// In-memory registry built from configured private keys at startup.
#[derive(Debug, Default)]
pub struct InMemorySignerRegistry {
    signers: HashMap<SignerAddress, SignerHandle>,
}

impl InMemorySignerRegistry {
    /// Builds a registry from raw 32-byte private keys, optionally bound to a
    /// chain id for EIP-155 signing.
    pub fn from_keys(keys: &[B256], chain_id: Option<u64>) -> Result<Self, SignerInitError> {
        let mut signers = HashMap::with_capacity(keys.len());
        for key in keys {
            let signer = PrivateKeySigner::from_bytes(key)
                .map_err(|e| SignerInitError(e.to_string()))?
                .with_chain_id(chain_id);
            let address = SignerAddress::from(signer.address());
            signers.insert(
                address,
                SignerHandle {
                    address,
                    signer: Arc::new(signer),
                },
            );
        }
        Ok(Self { signers })
    }
}

impl SignerRegistry for InMemorySignerRegistry {
    fn is_available(&self, address: &SignerAddress) -> bool {
        self.signers.contains_key(address)
    }

    fn get(&self, address: &SignerAddress) -> Option<SignerHandle> {
        self.signers.get(address).cloned()
    }

    fn list(&self) -> Vec<SignerAddress> {
        self.signers.keys().copied().collect()
    }
}
