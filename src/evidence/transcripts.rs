//! Fetching opaque conversation transcripts from the agent messaging layer.
//!
//! Content travels base64-encoded on the wire and is handed to the evidence
//! builder as raw bytes. Nothing here interprets it.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use url::Url;

use crate::ids::{ConversationId, MessageId};

/// One opaque message in a conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub id: Option<MessageId>,
    /// Milliseconds since the Unix epoch, as reported by the messaging layer.
    pub timestamp: u64,
    pub content: Vec<u8>,
}

/// Errors fetching a transcript. Fetch failures are transient I/O; the step
/// runtime retries them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript service unreachable: {0}")]
    Unreachable(String),
    #[error("transcript service returned {status} for conversation {conversation}")]
    Status {
        conversation: ConversationId,
        status: u16,
    },
    #[error("malformed transcript payload: {0}")]
    Malformed(String),
}

impl TranscriptError {
    pub fn is_transient(&self) -> bool {
        match self {
            TranscriptError::Unreachable(_) => true,
            TranscriptError::Status { status, .. } => *status >= 500,
            TranscriptError::Malformed(_) => false,
        }
    }
}

/// Source of conversation transcripts.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Fetches all messages of a conversation, in whatever order the backing
    /// service returns them. Ordering is normalized later by hashing.
    async fn fetch(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<TranscriptMessage>, TranscriptError>;
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: Option<String>,
    timestamp: u64,
    /// Base64 of the opaque content bytes.
    content: String,
}

/// HTTP client for the transcript service.
///
/// `GET {endpoint}/conversations/{id}/messages` returning a JSON array of
/// `{id, timestamp, content}` objects.
#[derive(Debug, Clone)]
pub struct HttpConversationSource {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpConversationSource {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl ConversationSource for HttpConversationSource {
    async fn fetch(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<TranscriptMessage>, TranscriptError> {
        let url = self
            .endpoint
            .join(&format!("conversations/{conversation}/messages"))
            .map_err(|e| TranscriptError::Malformed(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TranscriptError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranscriptError::Status {
                conversation: conversation.clone(),
                status: status.as_u16(),
            });
        }
        let wire: Vec<WireMessage> = response
            .json()
            .await
            .map_err(|e| TranscriptError::Malformed(e.to_string()))?;
        wire.into_iter()
            .map(|message| {
                let id = message
                    .id
                    .map(MessageId::new)
                    .transpose()
                    .map_err(|e| TranscriptError::Malformed(e.to_string()))?;
                let content = BASE64
                    .decode(&message.content)
                    .map_err(|e| TranscriptError::Malformed(e.to_string()))?;
                Ok(TranscriptMessage {
                    id,
                    timestamp: message.timestamp,
                    content,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TranscriptError::Unreachable("timeout".into()).is_transient());
        assert!(
            TranscriptError::Status {
                conversation: "CONV-1".parse().unwrap(),
                status: 503,
            }
            .is_transient()
        );
        assert!(
            !TranscriptError::Status {
                conversation: "CONV-1".parse().unwrap(),
                status: 404,
            }
            .is_transient()
        );
        assert!(!TranscriptError::Malformed("bad base64".into()).is_transient());
    }
}
