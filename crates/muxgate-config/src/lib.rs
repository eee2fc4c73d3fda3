// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway configuration loaded from YAML.
//!
//! Configuration is YAML, deep-merged across layers so an operator can
//! override only the fields they care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/muxgate/gateway.yaml`
//! 2. `~/.config/muxgate/gateway.yaml`
//! 3. `.muxgate/gateway.yaml` (workspace-local)
//! 4. the path named by `MUXGATE_CONFIG`, or passed explicitly to [`load`].
//!
//! Four environment variables are recognized by the lifecycle orchestrator,
//! all optional: `MUXGATE_CONFIG` (config-file override), `MUXGATE_DB_PATH`
//! (ledger database path override), `MUXGATE_BEARER_SECRET` (bearer token
//! HMAC signing secret), `MUXGATE_BASE_URL` (externally-reachable base URL
//! override).

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_http_bind() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_rpc_bind() -> String {
    "127.0.0.1:8791".to_string()
}

fn default_max_body() -> usize {
    4 * 1024 * 1024
}

fn default_base_url() -> String {
    "http://127.0.0.1:8790".to_string()
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muxgate")
        .join("ledger.sqlite3")
}

fn default_auto_register() -> AutoRegisterPolicy {
    AutoRegisterPolicy::Disabled
}

fn default_challenge_window_secs() -> i64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_heartbeat_timeout_secs() -> u64 {
    45
}

fn default_cancel_grace_secs() -> u64 {
    2
}

fn default_max_attachment_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// HTTP/SSE listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:8790` (loopback only).
    #[serde(default = "default_http_bind")]
    pub bind: String,

    /// Maximum request body size in bytes (default: 4 MiB).
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            max_body_bytes: default_max_body(),
        }
    }
}

/// Agent stream (bidirectional RPC) listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// `host:port` the Agent Stream Service listens on.
    #[serde(default = "default_rpc_bind")]
    pub bind: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: default_rpc_bind(),
        }
    }
}

/// Ledger store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the single embedded SQL database file for this process.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Auth gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Name of the environment variable holding the bearer-token signing
    /// secret. The secret value itself is never written to the config file.
    #[serde(default = "default_bearer_secret_env")]
    pub bearer_signing_secret_env: String,

    /// What to do when a signed-challenge authenticates but no principal
    /// exists yet for that key fingerprint.
    #[serde(default = "default_auto_register")]
    pub auto_register: AutoRegisterPolicy,

    /// Width, in seconds, of the acceptable window around "now" for a
    /// signed-challenge timestamp.
    #[serde(default = "default_challenge_window_secs")]
    pub challenge_window_secs: i64,

    /// Heartbeat interval agents are expected to honor.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// How long without a heartbeat before a connection is considered dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Grace period after a `CancelRequest` before force-closing the pending
    /// request.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Core-level ceiling on a single attachment's size (see Open Questions
    /// in DESIGN.md).
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,

    /// Whether a second `SendMessage` to an agent is allowed before the
    /// previous request's terminal event (see Open Questions in DESIGN.md).
    #[serde(default = "default_true")]
    pub allow_concurrent_requests_per_agent: bool,
}

fn default_bearer_secret_env() -> String {
    "MUXGATE_BEARER_SECRET".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_signing_secret_env: default_bearer_secret_env(),
            auto_register: default_auto_register(),
            challenge_window_secs: default_challenge_window_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            max_attachment_bytes: default_max_attachment_bytes(),
            allow_concurrent_requests_per_agent: true,
        }
    }
}

/// Policy for principals discovered via signed-challenge auth with no
/// pre-existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoRegisterPolicy {
    /// Create the principal already `approved`.
    Approved,
    /// Create the principal as `pending` (requires admin approval).
    Pending,
    /// Reject unknown fingerprints outright.
    Disabled,
}

// ── Loader ──────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/muxgate/gateway.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/muxgate/gateway.yaml"));
    }
    paths.push(PathBuf::from(".muxgate/gateway.yaml"));
    paths
}

/// Load configuration from the standard search paths, merged with an
/// optional explicit override file (highest precedence).
pub fn load(extra: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading gateway config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit gateway config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: GatewayConfig =
        if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
            GatewayConfig::default()
        } else {
            serde_yaml::from_value(merged).unwrap_or_default()
        };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration honoring `MUXGATE_CONFIG` as the explicit override
/// path, matching the lifecycle orchestrator's documented env vars.
pub fn load_from_env() -> anyhow::Result<GatewayConfig> {
    let extra = std::env::var_os("MUXGATE_CONFIG").map(PathBuf::from);
    load(extra.as_deref())
}

fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(db_path) = std::env::var("MUXGATE_DB_PATH") {
        config.ledger.db_path = PathBuf::from(db_path);
    }
    if let Ok(base_url) = std::env::var("MUXGATE_BASE_URL") {
        config.base_url = base_url;
    }
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
