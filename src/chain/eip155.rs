//! Alloy-backed chain adapter for EVM networks.
//!
//! Uses the standard filler stack for gas, nonce, and chain id, and a wallet
//! holding every registered signer. The `from` address on each request picks
//! the signing key, so the adapter never chooses a signer on its own.

use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionRequest};
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use url::Url;

use crate::chain::{
    ChainAdapter, ChainError, ConfirmedReceipt, ReceiptStatus, StudioCall, to_alloy_address,
};
use crate::ids::{SignerAddress, TxHash};

/// Default delay between receipt polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Chain adapter for EIP-155 networks.
#[derive(Debug)]
pub struct Eip155ChainAdapter {
    provider: DynProvider,
    chain_id: u64,
    poll_interval: Duration,
}

impl Eip155ChainAdapter {
    /// Builds an adapter over an HTTP RPC endpoint with the given signers.
    ///
    /// Signers are registered into a single wallet; each submission names its
    /// `from` address explicitly and the wallet signs with the matching key.
    pub fn connect(
        rpc_url: Url,
        chain_id: u64,
        signers: Vec<PrivateKeySigner>,
    ) -> Result<Self, ChainError> {
        let mut iter = signers.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| ChainError::Transport("at least one signer is required".into()))?;
        let mut wallet = EthereumWallet::from(first);
        for signer in iter {
            wallet.register_signer(signer);
        }

        let transport = Http::new(rpc_url.clone());
        let client = RpcClient::new(transport, false);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_client(client)
            .erased();

        tracing::info!(%rpc_url, chain_id, "connected EVM chain adapter");

        Ok(Self {
            provider,
            chain_id,
            poll_interval: RECEIPT_POLL_INTERVAL,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn classify_transport(err: TransportError) -> ChainError {
        match err {
            TransportError::ErrorResp(payload) => ChainError::Rpc(payload.to_string()),
            other => ChainError::Transport(other.to_string()),
        }
    }

    fn request(signer: &SignerAddress, call: &StudioCall) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(signer.as_address())
            .with_to(to_alloy_address(&call.to))
            .with_input(call.calldata.clone())
    }
}

/// Pulls a human-readable reason out of an RPC revert message, if present.
fn parse_revert_reason(message: &str) -> Option<String> {
    let lowered = message.to_ascii_lowercase();
    let idx = lowered.find("reverted")?;
    let tail = &message[idx + "reverted".len()..];
    let tail = tail
        .trim_start_matches(':')
        .trim_start_matches(" with reason string")
        .trim()
        .trim_matches('\'')
        .trim_matches('"');
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

#[async_trait]
impl ChainAdapter for Eip155ChainAdapter {
    async fn submit(
        &self,
        signer: &SignerAddress,
        call: &StudioCall,
    ) -> Result<TxHash, ChainError> {
        let request = Self::request(signer, call);
        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(Self::classify_transport)?;
        let hash = TxHash::from(*pending.tx_hash());
        tracing::debug!(%signer, tx = %hash, "submitted transaction");
        Ok(hash)
    }

    async fn wait_receipt(
        &self,
        tx: &TxHash,
        timeout: Duration,
    ) -> Result<ReceiptStatus, ChainError> {
        let started = Instant::now();
        loop {
            match self.transaction_status(tx).await? {
                ReceiptStatus::NotFound if started.elapsed() < timeout => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                status => return Ok(status),
            }
        }
    }

    async fn transaction_status(&self, tx: &TxHash) -> Result<ReceiptStatus, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx.as_b256())
            .await
            .map_err(Self::classify_transport)?;
        match receipt {
            Some(receipt) => {
                if receipt.status() {
                    Ok(ReceiptStatus::Confirmed(ConfirmedReceipt {
                        tx_hash: *tx,
                        block_number: receipt.block_number,
                        log_count: receipt.inner.logs().len(),
                    }))
                } else {
                    // The receipt itself carries no reason; callers replay
                    // the call via `revert_reason` to recover one.
                    Ok(ReceiptStatus::Reverted { reason: None })
                }
            }
            None => Ok(ReceiptStatus::NotFound),
        }
    }

    async fn transaction_count(&self, signer: &SignerAddress) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(signer.as_address())
            .pending()
            .await
            .map_err(Self::classify_transport)
    }

    async fn revert_reason(
        &self,
        signer: &SignerAddress,
        call: &StudioCall,
        block: Option<u64>,
    ) -> Result<Option<String>, ChainError> {
        let request = Self::request(signer, call);
        let eth_call = self.provider.call(request);
        let eth_call = match block {
            Some(number) => eth_call.block(BlockId::number(number)),
            None => eth_call,
        };
        match eth_call.await {
            // The call passing on replay means the revert context is gone;
            // nothing to report.
            Ok(_) => Ok(None),
            Err(err) => match err {
                TransportError::ErrorResp(payload) => Ok(parse_revert_reason(&payload.message)),
                other => Err(ChainError::Transport(other.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_reason_parsing() {
        assert_eq!(
            parse_revert_reason("execution reverted: work already exists"),
            Some("work already exists".to_string())
        );
        assert_eq!(
            parse_revert_reason("execution reverted with reason string 'epoch closed'"),
            Some("epoch closed".to_string())
        );
        assert_eq!(parse_revert_reason("execution reverted"), None);
        assert_eq!(parse_revert_reason("gas too low"), None);
    }
}
