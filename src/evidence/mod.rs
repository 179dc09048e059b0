//! Evidence packages: opaque transcript bytes with integrity metadata.
//!
//! A package is built in memory, archived to content-addressed storage, and
//! never mutated afterwards. The gateway treats message content as opaque:
//! it hashes, frames, and ships bytes, and nothing in this module ever looks
//! inside them.
//!
//! # Binary layouts
//!
//! Content bytes are a concatenation of frames:
//!
//! ```text
//! [timestamp: u64 BE][length: u32 BE][content bytes]
//! ```
//!
//! The archived package serializes as:
//!
//! ```text
//! [header length: u32 BE][header JSON, UTF-8][content hash, UTF-8 hex][content bytes]
//! ```
//!
//! # Submodules
//!
//! - [`transcripts`] - fetching opaque conversation transcripts
//! - [`storage`] - archival to content-addressed storage

pub mod storage;
pub mod transcripts;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use crate::guards::markers;
use crate::ids::{ConversationId, EvmAddress};
use transcripts::{ConversationSource, TranscriptError, TranscriptMessage};

/// Version stamped into every package header and storage tag.
pub const EVIDENCE_VERSION: &str = "1.0.0";

/// SHA-256 digest of a package's serialized content frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn digest(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(raw).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("content hash must be 32 bytes"))?;
        Ok(Self(array))
    }
}

/// Package header, serialized as JSON inside the archived bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceHeader {
    pub version: String,
    pub studio_address: EvmAddress,
    pub epoch: u64,
    pub agent_address: EvmAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Build time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub message_count: u32,
}

/// An immutable evidence package: header, content hash, and framed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidencePackage {
    pub header: EvidenceHeader,
    pub content_hash: ContentHash,
    #[serde(with = "hex_bytes")]
    pub content_bytes: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl EvidencePackage {
    /// Serializes the package into its archival byte layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let header = serde_json::to_vec(&self.header)?;
        let hash_text = self.content_hash.to_string();
        let mut out =
            Vec::with_capacity(4 + header.len() + hash_text.len() + self.content_bytes.len());
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(hash_text.as_bytes());
        out.extend_from_slice(&self.content_bytes);
        Ok(out)
    }
}

/// Computes the evidence root committed on-chain:
/// `SHA-256(studio ‖ epoch-decimal ‖ agent ‖ content-hash)`, 0x-prefixed.
///
/// All operands are the canonical lowercase string forms, so the root is a
/// pure function of `(studio, epoch, agent, content_hash)`.
pub fn compute_root(
    studio: &EvmAddress,
    epoch: u64,
    agent: &EvmAddress,
    content_hash: &ContentHash,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(studio.to_string().as_bytes());
    hasher.update(epoch.to_string().as_bytes());
    hasher.update(agent.to_string().as_bytes());
    hasher.update(content_hash.to_string().as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Serializes messages into content frames, ordering them by per-message
/// content hash so the result is independent of fetch order.
pub fn frame_messages(messages: &[TranscriptMessage]) -> Vec<u8> {
    markers::evidence_only();
    let mut ordered: Vec<&TranscriptMessage> = messages.iter().collect();
    ordered.sort_by_key(|m| {
        let digest: [u8; 32] = Sha256::digest(&m.content).into();
        digest
    });
    let mut out = Vec::new();
    for message in ordered {
        out.extend_from_slice(&message.timestamp.to_be_bytes());
        out.extend_from_slice(&(message.content.len() as u32).to_be_bytes());
        out.extend_from_slice(&message.content);
    }
    out
}

/// Builds evidence packages from transcripts or raw content.
pub struct EvidenceBuilder {
    transcripts: Arc<dyn ConversationSource>,
}

impl EvidenceBuilder {
    pub fn new(transcripts: Arc<dyn ConversationSource>) -> Self {
        Self { transcripts }
    }

    /// Fetches a conversation's messages and packages them.
    pub async fn build_from_conversation(
        &self,
        conversation: &ConversationId,
        studio: EvmAddress,
        epoch: u64,
        agent: EvmAddress,
    ) -> Result<EvidencePackage, TranscriptError> {
        let messages = self.transcripts.fetch(conversation).await?;
        let content_bytes = frame_messages(&messages);
        let content_hash = ContentHash::digest(&content_bytes);
        tracing::debug!(
            %conversation,
            messages = messages.len(),
            content_hash = %content_hash,
            "built evidence package"
        );
        Ok(EvidencePackage {
            header: EvidenceHeader {
                version: EVIDENCE_VERSION.to_string(),
                studio_address: studio,
                epoch,
                agent_address: agent,
                conversation_id: Some(conversation.clone()),
                timestamp: Utc::now().timestamp_millis() as u64,
                message_count: messages.len() as u32,
            },
            content_hash,
            content_bytes,
        })
    }

    /// Packages a single opaque content blob as one frame.
    pub fn build_from_content(
        &self,
        content: Vec<u8>,
        studio: EvmAddress,
        epoch: u64,
        agent: EvmAddress,
    ) -> EvidencePackage {
        let now = Utc::now().timestamp_millis() as u64;
        let message = TranscriptMessage {
            id: None,
            timestamp: now,
            content,
        };
        let content_bytes = frame_messages(std::slice::from_ref(&message));
        let content_hash = ContentHash::digest(&content_bytes);
        EvidencePackage {
            header: EvidenceHeader {
                version: EVIDENCE_VERSION.to_string(),
                studio_address: studio,
                epoch,
                agent_address: agent,
                conversation_id: None,
                timestamp: now,
                message_count: 1,
            },
            content_hash,
            content_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(ts: u64, content: &str) -> TranscriptMessage {
        TranscriptMessage {
            id: None,
            timestamp: ts,
            content: content.as_bytes().to_vec(),
        }
    }

    fn studio() -> EvmAddress {
        "0xdead00000000000000000000000000000000beef".parse().unwrap()
    }

    fn agent() -> EvmAddress {
        "0xbeef00000000000000000000000000000000dead".parse().unwrap()
    }

    #[test]
    fn frames_carry_timestamp_and_length() {
        let framed = frame_messages(&[message(0x0102030405060708, "alpha")]);
        assert_eq!(&framed[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&framed[8..12], &[0, 0, 0, 5]);
        assert_eq!(&framed[12..], b"alpha");
    }

    #[test]
    fn framing_is_order_independent() {
        let forward = frame_messages(&[message(1, "alpha"), message(2, "beta")]);
        let reverse = frame_messages(&[message(2, "beta"), message(1, "alpha")]);
        assert_eq!(
            ContentHash::digest(&forward),
            ContentHash::digest(&reverse)
        );
    }

    #[test]
    fn root_matches_manual_concatenation() {
        let content_hash = ContentHash::digest(b"payload");
        let root = compute_root(&studio(), 7, &agent(), &content_hash);

        let mut hasher = Sha256::new();
        hasher.update(b"0xdead00000000000000000000000000000000beef");
        hasher.update(b"7");
        hasher.update(b"0xbeef00000000000000000000000000000000dead");
        hasher.update(content_hash.to_string().as_bytes());
        let expected = format!("0x{}", hex::encode(hasher.finalize()));
        assert_eq!(root, expected);
    }

    #[test]
    fn root_is_deterministic() {
        let content_hash = ContentHash::digest(b"payload");
        assert_eq!(
            compute_root(&studio(), 7, &agent(), &content_hash),
            compute_root(&studio(), 7, &agent(), &content_hash)
        );
        assert_ne!(
            compute_root(&studio(), 7, &agent(), &content_hash),
            compute_root(&studio(), 8, &agent(), &content_hash)
        );
    }

    #[test]
    fn package_bytes_layout() {
        let header = EvidenceHeader {
            version: EVIDENCE_VERSION.to_string(),
            studio_address: studio(),
            epoch: 7,
            agent_address: agent(),
            conversation_id: None,
            timestamp: 1_700_000_000_000,
            message_count: 0,
        };
        let content_bytes = b"framed".to_vec();
        let package = EvidencePackage {
            header: header.clone(),
            content_hash: ContentHash::digest(&content_bytes),
            content_bytes: content_bytes.clone(),
        };
        let bytes = package.to_bytes().unwrap();

        let header_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let header_json: EvidenceHeader =
            serde_json::from_slice(&bytes[4..4 + header_len]).unwrap();
        assert_eq!(header_json, header);

        let hash_start = 4 + header_len;
        let hash_text = std::str::from_utf8(&bytes[hash_start..hash_start + 66]).unwrap();
        assert_eq!(hash_text, package.content_hash.to_string());
        assert_eq!(&bytes[hash_start + 66..], content_bytes.as_slice());
    }

    #[test]
    fn content_hash_serde_roundtrip() {
        let hash = ContentHash::digest(b"alpha");
        let json = serde_json::to_string(&hash).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
