//! Branded identifier types used throughout the gateway.
//!
//! Every externally-sourced identifier is wrapped in a newtype whose validating
//! constructor is the only way to obtain a value. The engine moves these values
//! around but never parses their contents: a [`ConversationId`] is a handle into
//! the agent messaging layer, a [`StorageTxId`] is a receipt from the archival
//! layer, a [`TxHash`] is whatever the chain returned. Mixing them up is a type
//! error, not a runtime surprise.

use alloy_primitives::{Address, B256};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a branded identifier fails validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdError {
    /// The identifier string was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// The identifier was not valid 0x-prefixed hex of the expected width.
    #[error("invalid {kind}: {value}")]
    InvalidHex { kind: &'static str, value: String },
}

/// Unique identity of a workflow. UUID v4, assigned at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Generates a fresh workflow id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// A signer address, normalized to lowercase 0x-prefixed hex.
///
/// The gateway never derives or selects signers; callers provide an address and
/// the [`crate::signer::SignerRegistry`] merely confirms it exists. Lowercasing
/// at the boundary makes the address usable as a map key without checksum
/// ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignerAddress(Address);

impl SignerAddress {
    /// Validates and normalizes a 0x-prefixed hex address.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty("signer address"));
        }
        Address::from_str(s)
            .map(Self)
            .map_err(|_| IdError::InvalidHex {
                kind: "signer address",
                value: s.to_string(),
            })
    }

    /// Returns the underlying EVM address.
    pub fn as_address(&self) -> Address {
        self.0
    }
}

impl From<Address> for SignerAddress {
    fn from(value: Address) -> Self {
        Self(value)
    }
}

impl Display for SignerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{:#x}` renders lowercase hex with the 0x prefix, which is the
        // canonical form everywhere in the gateway (store keys, evidence
        // roots, storage tags).
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for SignerAddress {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SignerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SignerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(DeError::custom)
    }
}

/// A general EVM address (studio contract, agent identity), lowercase hex.
///
/// Distinct from [`SignerAddress`] on purpose: a studio or agent address is
/// never handed to the nonce serializer or the signer registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvmAddress(Address);

impl EvmAddress {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty("address"));
        }
        Address::from_str(s)
            .map(Self)
            .map_err(|_| IdError::InvalidHex {
                kind: "address",
                value: s.to_string(),
            })
    }

    pub fn as_address(&self) -> Address {
        self.0
    }
}

impl From<Address> for EvmAddress {
    fn from(value: Address) -> Self {
        Self(value)
    }
}

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for EvmAddress {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(DeError::custom)
    }
}

/// An on-chain transaction hash as returned by the chain adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(B256);

impl TxHash {
    /// Validates a 0x-prefixed 32-byte hex hash.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty("transaction hash"));
        }
        B256::from_str(s).map(Self).map_err(|_| IdError::InvalidHex {
            kind: "transaction hash",
            value: s.to_string(),
        })
    }

    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl From<B256> for TxHash {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(DeError::custom)
    }
}

macro_rules! opaque_string_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validating constructor; rejects empty strings.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(IdError::Empty($label));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

opaque_string_id!(
    /// Handle into the agent messaging layer. Contents are never interpreted.
    ConversationId,
    "conversation id"
);

opaque_string_id!(
    /// Identity of a single message within a conversation.
    MessageId,
    "message id"
);

opaque_string_id!(
    /// Immutable identifier of an archived evidence package in
    /// content-addressed storage.
    StorageTxId,
    "storage transaction id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_address_lowercases() {
        let addr = SignerAddress::parse("0xDEAD00000000000000000000000000000000BEEF").unwrap();
        assert_eq!(
            addr.to_string(),
            "0xdead00000000000000000000000000000000beef"
        );
    }

    #[test]
    fn signer_address_rejects_garbage() {
        assert!(SignerAddress::parse("").is_err());
        assert!(SignerAddress::parse("0x1234").is_err());
        assert!(SignerAddress::parse("not-an-address").is_err());
    }

    #[test]
    fn signer_address_roundtrips_serde() {
        let addr = SignerAddress::parse("0xAAAA000000000000000000000000000000000001").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0xaaaa000000000000000000000000000000000001\"");
        let back: SignerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn tx_hash_requires_32_bytes() {
        assert!(TxHash::parse("0xabcd").is_err());
        let h = TxHash::parse(
            "0x00000000000000000000000000000000000000000000000000000000000000ff",
        )
        .unwrap();
        assert!(h.to_string().starts_with("0x"));
        assert_eq!(h.to_string().len(), 66);
    }

    #[test]
    fn opaque_ids_reject_empty() {
        assert!(ConversationId::new("").is_err());
        assert!(MessageId::new("").is_err());
        assert!(StorageTxId::new("").is_err());
        assert_eq!(ConversationId::new("CONV-1").unwrap().as_str(), "CONV-1");
    }
}
