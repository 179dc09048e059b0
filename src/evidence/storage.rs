//! Archival of evidence packages to content-addressed storage.
//!
//! Every upload failure is an operational condition: the upload may or may
//! not have landed, so callers stall and let reconciliation-by-content-hash
//! decide. Archival is idempotent: a package whose content hash already
//! exists resolves to the existing storage transaction.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::evidence::{ContentHash, EVIDENCE_VERSION, EvidencePackage};
use crate::ids::StorageTxId;

/// Tag names attached to every archived package. The tag set is part of the
/// external contract; downstream indexers query by these names.
pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_VERSION: &str = "ChaosChain-Version";
pub const TAG_STUDIO: &str = "ChaosChain-Studio";
pub const TAG_EPOCH: &str = "ChaosChain-Epoch";
pub const TAG_AGENT: &str = "ChaosChain-Agent";
pub const TAG_CONTENT_HASH: &str = "ChaosChain-ContentHash";

pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// The exact tag set for a package, in contract order.
pub fn storage_tags(package: &EvidencePackage) -> Vec<(&'static str, String)> {
    vec![
        (TAG_CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM.to_string()),
        (TAG_VERSION, EVIDENCE_VERSION.to_string()),
        (TAG_STUDIO, package.header.studio_address.to_string()),
        (TAG_EPOCH, package.header.epoch.to_string()),
        (TAG_AGENT, package.header.agent_address.to_string()),
        (TAG_CONTENT_HASH, package.content_hash.to_string()),
    ]
}

/// Storage upload failure. Deliberately a single kind: whatever went wrong,
/// truth about the upload is unknown and the workflow stalls.
#[derive(Debug, Clone, thiserror::Error)]
#[error("evidence storage unavailable: {0}")]
pub struct StorageError(pub String);

/// Content-addressed storage for evidence packages.
#[async_trait]
pub trait EvidenceStorage: Send + Sync {
    /// Uploads a serialized package with its tags, returning the immutable
    /// storage transaction id. Must be idempotent by content hash.
    async fn archive(&self, package: &EvidencePackage) -> Result<StorageTxId, StorageError>;

    /// Looks up an existing archive by content hash.
    async fn find_by_content_hash(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<StorageTxId>, StorageError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// HTTP client for a bundler-style storage gateway.
///
/// `POST {endpoint}/tx` uploads the package bytes with tags as headers;
/// `GET {endpoint}/tx?contentHash=0x…` resolves an existing archive.
#[derive(Debug, Clone)]
pub struct HttpEvidenceStorage {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpEvidenceStorage {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    fn tx_url(&self) -> Result<Url, StorageError> {
        self.endpoint
            .join("tx")
            .map_err(|e| StorageError(e.to_string()))
    }
}

#[async_trait]
impl EvidenceStorage for HttpEvidenceStorage {
    async fn archive(&self, package: &EvidencePackage) -> Result<StorageTxId, StorageError> {
        // Idempotency: resolve an existing archive before uploading again.
        if let Some(existing) = self.find_by_content_hash(&package.content_hash).await? {
            tracing::debug!(
                content_hash = %package.content_hash,
                storage_tx = %existing,
                "evidence already archived"
            );
            return Ok(existing);
        }

        let bytes = package.to_bytes().map_err(|e| StorageError(e.to_string()))?;
        let mut request = self.client.post(self.tx_url()?).body(bytes);
        for (name, value) in storage_tags(package) {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StorageError(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError(format!("upload returned {status}")));
        }
        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError(e.to_string()))?;
        StorageTxId::new(upload.id).map_err(|e| StorageError(e.to_string()))
    }

    async fn find_by_content_hash(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<StorageTxId>, StorageError> {
        let mut url = self.tx_url()?;
        url.query_pairs_mut()
            .append_pair("contentHash", &content_hash.to_string());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError(e.to_string()))?;
        match response.status() {
            status if status.is_success() => {
                let found: UploadResponse = response
                    .json()
                    .await
                    .map_err(|e| StorageError(e.to_string()))?;
                let id = StorageTxId::new(found.id).map_err(|e| StorageError(e.to_string()))?;
                Ok(Some(id))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(StorageError(format!("lookup returned {status}"))),
        }
    }
}
