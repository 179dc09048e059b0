//! Configuration for the gateway server.
//!
//! Configuration is a JSON file named by `--config` (or the `CONFIG` env
//! var). Every field has a serde default that falls back to an environment
//! variable, then to a hardcoded value, so a bare environment-driven
//! deployment needs no file at all. String fields accept `$VAR` / `${VAR}`
//! references resolved at load time.

use alloy_primitives::B256;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::engine::{EngineSettings, KindLimits, OutageClass};
use crate::step::RetryPolicy;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "chaoschain-gateway")]
#[command(about = "ChaosChain transaction orchestration gateway")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// A transparent wrapper that resolves environment variables during
/// deserialization: `"$TREASURY_KEY"` and `"${TREASURY_KEY}"` read the
/// variable, anything else parses literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    fn env_var_name(s: &str) -> Option<&str> {
        if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            return Some(inner);
        }
        let name = s.strip_prefix('$')?;
        (!name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'))
            .then_some(name)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<T> for LiteralOrEnv<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::env_var_name(&s) {
            Some(name) => std::env::var(name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable {name:?} not set (referenced as {s:?})"
                ))
            })?,
            None => s,
        };
        value
            .parse::<T>()
            .map(LiteralOrEnv)
            .map_err(serde::de::Error::custom)
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// A validated 32-byte EVM private key.
#[derive(Clone, Copy)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "EvmPrivateKey(..)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("invalid evm private key: {e}"))
    }
}

/// Chain connectivity and signing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "chain_defaults::rpc_url")]
    pub rpc_url: LiteralOrEnv<Url>,
    #[serde(default = "chain_defaults::chain_id")]
    pub chain_id: u64,
    /// Signer private keys, hex or `$VAR` references.
    #[serde(default = "chain_defaults::signers")]
    pub signers: Vec<LiteralOrEnv<EvmPrivateKey>>,
    #[serde(default = "chain_defaults::receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    /// `retry` (default) or `stall`: how chain outages classify.
    #[serde(default = "chain_defaults::outage_class")]
    pub outage_class: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: chain_defaults::rpc_url(),
            chain_id: chain_defaults::chain_id(),
            signers: chain_defaults::signers(),
            receipt_timeout_ms: chain_defaults::receipt_timeout_ms(),
            outage_class: chain_defaults::outage_class(),
        }
    }
}

mod chain_defaults {
    use super::*;

    pub fn rpc_url() -> LiteralOrEnv<Url> {
        let raw = std::env::var("CHAIN_RPC_URL")
            .unwrap_or_else(|_| "http://localhost:8545".to_string());
        Url::parse(&raw)
            .unwrap_or_else(|_| Url::parse("http://localhost:8545").expect("static url"))
            .into()
    }

    pub fn chain_id() -> u64 {
        env_or("CHAIN_ID", 31_337)
    }

    pub fn signers() -> Vec<LiteralOrEnv<EvmPrivateKey>> {
        std::env::var("SIGNER_KEYS")
            .map(|keys| {
                keys.split(',')
                    .filter_map(|k| k.trim().parse::<EvmPrivateKey>().ok())
                    .map(LiteralOrEnv::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn receipt_timeout_ms() -> u64 {
        env_or("RECEIPT_TIMEOUT_MS", 60_000)
    }

    pub fn outage_class() -> String {
        env_or("CHAIN_OUTAGE_CLASS", "retry".to_string())
    }
}

/// Evidence archival and transcript endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default = "evidence_defaults::storage_endpoint")]
    pub storage_endpoint: LiteralOrEnv<Url>,
    #[serde(default = "evidence_defaults::transcripts_endpoint")]
    pub transcripts_endpoint: LiteralOrEnv<Url>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            storage_endpoint: evidence_defaults::storage_endpoint(),
            transcripts_endpoint: evidence_defaults::transcripts_endpoint(),
        }
    }
}

mod evidence_defaults {
    use super::*;

    fn url_from_env(key: &str, fallback: &str) -> LiteralOrEnv<Url> {
        let raw = std::env::var(key).unwrap_or_else(|_| fallback.to_string());
        Url::parse(&raw)
            .unwrap_or_else(|_| Url::parse(fallback).expect("static url"))
            .into()
    }

    pub fn storage_endpoint() -> LiteralOrEnv<Url> {
        url_from_env("STORAGE_ENDPOINT", "http://localhost:1984/")
    }

    pub fn transcripts_endpoint() -> LiteralOrEnv<Url> {
        url_from_env("TRANSCRIPTS_ENDPOINT", "http://localhost:8700/")
    }
}

/// Admission caps.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "limits_defaults::max_workflows_total")]
    pub max_workflows_total: u32,
    #[serde(default = "limits_defaults::max_work_submission")]
    pub max_work_submission: u32,
    #[serde(default = "limits_defaults::max_score_submission")]
    pub max_score_submission: u32,
    #[serde(default = "limits_defaults::max_close_epoch")]
    pub max_close_epoch: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_workflows_total: limits_defaults::max_workflows_total(),
            max_work_submission: limits_defaults::max_work_submission(),
            max_score_submission: limits_defaults::max_score_submission(),
            max_close_epoch: limits_defaults::max_close_epoch(),
        }
    }
}

mod limits_defaults {
    use super::env_or;

    pub fn max_workflows_total() -> u32 {
        env_or("MAX_WORKFLOWS_TOTAL", 256)
    }

    pub fn max_work_submission() -> u32 {
        env_or("MAX_PER_TYPE_WORK_SUBMISSION", 128)
    }

    pub fn max_score_submission() -> u32 {
        env_or("MAX_PER_TYPE_SCORE_SUBMISSION", 128)
    }

    pub fn max_close_epoch() -> u32 {
        env_or("MAX_PER_TYPE_CLOSE_EPOCH", 16)
    }
}

/// Step retry policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "retry_defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "retry_defaults::initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "retry_defaults::cap_ms")]
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: retry_defaults::max_attempts(),
            initial_ms: retry_defaults::initial_ms(),
            cap_ms: retry_defaults::cap_ms(),
        }
    }
}

mod retry_defaults {
    use super::env_or;

    pub fn max_attempts() -> u32 {
        env_or("RETRY_MAX_ATTEMPTS", 5)
    }

    pub fn initial_ms() -> u64 {
        env_or("RETRY_INITIAL_MS", 1_000)
    }

    pub fn cap_ms() -> u64 {
        env_or("RETRY_CAP_MS", 30_000)
    }
}

/// Reconciliation freshness and sweep cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "reconcile_defaults::staleness_ms")]
    pub staleness_ms: u64,
    #[serde(default = "reconcile_defaults::sweep_ms")]
    pub sweep_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            staleness_ms: reconcile_defaults::staleness_ms(),
            sweep_ms: reconcile_defaults::sweep_ms(),
        }
    }
}

mod reconcile_defaults {
    use super::env_or;

    pub fn staleness_ms() -> u64 {
        env_or("RECONCILE_STALENESS_MS", 60_000)
    }

    pub fn sweep_ms() -> u64 {
        // The sweep contract is an interval of at most 30 seconds.
        env_or("RECONCILE_SWEEP_MS", 30_000).min(30_000)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::port")]
    port: u16,
    #[serde(default = "config_defaults::host")]
    host: IpAddr,
    #[serde(default = "config_defaults::store_url")]
    store_url: LiteralOrEnv<String>,
    #[serde(default)]
    chain: ChainConfig,
    #[serde(default)]
    evidence: EvidenceConfig,
    #[serde(default)]
    limits: LimitsConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    reconcile: ReconcileConfig,
    #[serde(default = "config_defaults::step_timeout_ms")]
    step_timeout_ms: u64,
    #[serde(default = "config_defaults::workers")]
    workers: usize,
}

mod config_defaults {
    use super::*;

    pub fn port() -> u16 {
        env_or("PORT", 8080)
    }

    pub fn host() -> IpAddr {
        env_or("HOST", IpAddr::from([0, 0, 0, 0]))
    }

    pub fn store_url() -> LiteralOrEnv<String> {
        env_or(
            "STORE_URL",
            "sqlite://gateway.db?mode=rwc".to_string(),
        )
        .into()
    }

    pub fn step_timeout_ms() -> u64 {
        env_or("STEP_TIMEOUT_MS", 120_000)
    }

    pub fn workers() -> usize {
        env_or("WORKERS", 8)
    }
}

impl Config {
    /// Loads configuration from the file named by `--config` / `CONFIG`,
    /// falling back to pure environment/default configuration when the file
    /// does not exist.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let args = CliArgs::parse();
        Self::load_from(&args.config)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&raw)?;
            tracing::info!(path = %path.display(), "loaded configuration file");
            Ok(config)
        } else {
            let config: Config = serde_json::from_str("{}")?;
            Ok(config)
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store_url(&self) -> &str {
        &self.store_url
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn evidence(&self) -> &EvidenceConfig {
        &self.evidence
    }

    /// Raw signer keys for registry and wallet construction.
    pub fn signer_keys(&self) -> Vec<B256> {
        self.chain.signers.iter().map(|k| k.as_b256()).collect()
    }

    /// Engine tunables resolved from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_workflows_total: self.limits.max_workflows_total,
            max_per_kind: KindLimits {
                work_submission: self.limits.max_work_submission,
                score_submission: self.limits.max_score_submission,
                close_epoch: self.limits.max_close_epoch,
            },
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_delay: Duration::from_millis(self.retry.initial_ms),
                cap: Duration::from_millis(self.retry.cap_ms),
                ..RetryPolicy::default()
            },
            reconcile_staleness: chrono::Duration::milliseconds(
                self.reconcile.staleness_ms as i64,
            ),
            reconcile_sweep: Duration::from_millis(self.reconcile.sweep_ms),
            receipt_timeout: Duration::from_millis(self.chain.receipt_timeout_ms),
            workers: self.workers,
            chain_outage_class: match self.chain.outage_class.as_str() {
                "stall" => OutageClass::Stall,
                _ => OutageClass::Retry,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port(), 8080);
        let settings = config.engine_settings();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.reconcile_staleness.num_milliseconds(), 60_000);
        assert!(settings.reconcile_sweep <= Duration::from_millis(30_000));
    }

    #[test]
    fn file_overrides_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "port": 9999,
                "retry": { "max_attempts": 2 },
                "chain": { "chain_id": 8453, "outage_class": "stall" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.port(), 9999);
        let settings = config.engine_settings();
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.chain_outage_class, OutageClass::Stall);
    }

    #[test]
    fn literal_or_env_parses_literals() {
        let parsed: LiteralOrEnv<u16> = serde_json::from_str("\"8080\"").unwrap();
        assert_eq!(*parsed, 8080);
    }

    #[test]
    fn literal_or_env_detects_references() {
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$FOO"), Some("FOO"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("${FOO}"), Some("FOO"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("plain"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$"), None);
    }
}
