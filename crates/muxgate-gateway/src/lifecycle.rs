// SPDX-License-Identifier: Apache-2.0
//!
//! Lifecycle orchestrator — assembles every subsystem and runs the gateway
//! until shutdown.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order, then blocks until a shutdown
//! signal arrives:
//!
//! 1. Open the ledger (embedded SQL, one file per process).
//! 2. Resolve the bearer-token signing secret (env var, or generate one and
//!    warn that it won't survive a restart).
//! 3. Construct the dedup caches, broadcaster, tool router, and auth gate.
//! 4. Construct the Agent Manager and Conversation Service.
//! 5. Spawn the Agent Stream RPC server.
//! 6. Spawn the HTTP/SSE server.
//! 7. Block until Ctrl+C or SIGTERM, then drain both servers within their
//!    shutdown deadlines and close every agent connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{info, warn};

use muxgate_config::{AutoRegisterPolicy as ConfigAutoRegisterPolicy, GatewayConfig};
use muxgate_core::ledger::sqlite::SqliteLedger;
use muxgate_core::{AuthGate, AutoRegisterPolicy, Broadcaster, DedupCache, LedgerStore, ToolRouter};
use muxgate_proto::agent_stream_server::AgentStreamServer;

use crate::conversation::ConversationService;
use crate::http::{self, AppState, QuestionBroker};
use crate::manager::AgentManager;
use crate::rpc::AgentStreamService;

const REPLAY_CACHE_CAPACITY: usize = 4096;
const IDEMPOTENCY_CACHE_CAPACITY: usize = 4096;
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const AGENT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// A running gateway instance. Dropping this does not stop the servers —
/// call [`Gateway::shutdown`] and await it, or let [`run`] own the process
/// lifetime entirely.
pub struct Gateway {
    conversation: Arc<ConversationService>,
    agents: AgentManager,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    /// The conversation service, for embedders that want to drive it
    /// without going through the HTTP surface (tests, alternate frontends).
    pub fn conversation(&self) -> &Arc<ConversationService> {
        &self.conversation
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    /// Trigger graceful shutdown: both servers stop accepting, in-flight
    /// HTTP requests get [`HTTP_SHUTDOWN_DEADLINE`], then every agent
    /// connection is sent `Shutdown` and given [`AGENT_SHUTDOWN_DEADLINE`]
    /// before this returns.
    pub async fn shutdown(&self, reason: &str) {
        info!(reason, "gateway shutdown requested");
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(HTTP_SHUTDOWN_DEADLINE).await;
        let agents_shutdown = self.agents.shutdown_all(reason);
        let _ = tokio::time::timeout(AGENT_SHUTDOWN_DEADLINE, agents_shutdown).await;
    }
}

/// Build every subsystem from `config` and run until a shutdown signal
/// arrives (Ctrl+C or SIGTERM). Consumes the process's lifetime; embedders
/// that need programmatic control should call [`build`] instead.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let (gateway, http_fut, rpc_fut) = build(config).await?;
    let mut http_fut = http_fut;
    let mut rpc_fut = rpc_fut;

    tokio::select! {
        res = &mut http_fut => return res,
        res = &mut rpc_fut => return res,
        _ = shutdown_signal() => {
            gateway.shutdown("process received shutdown signal").await;
        }
    }

    // Both servers were told to stop accepting and drain by `gateway.shutdown`;
    // wait for them to actually finish instead of dropping their futures out
    // from under in-flight SSE/RPC streams. Bounded so a connection that never
    // closes cannot hang the process past the documented deadline.
    match tokio::time::timeout(HTTP_SHUTDOWN_DEADLINE, async { tokio::join!(http_fut, rpc_fut) }).await {
        Ok((http_res, rpc_res)) => {
            http_res?;
            rpc_res?;
        }
        Err(_) => warn!("server drain deadline elapsed; exiting without waiting further"),
    }

    Ok(())
}

type ServerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// Construct the gateway's subsystems and return driveable server futures
/// alongside a [`Gateway`] handle, without blocking. Split out from [`run`]
/// so tests and alternate entrypoints (e.g. an embedder with its own signal
/// handling) can compose the same startup sequence.
async fn build(config: GatewayConfig) -> anyhow::Result<(Gateway, ServerFuture, ServerFuture)> {
    let ledger: Arc<dyn LedgerStore> = Arc::new(open_ledger(&config.ledger.db_path)?);

    let bearer_secret = resolve_bearer_secret(&config.auth.bearer_signing_secret_env);
    let replay_cache = Arc::new(DedupCache::new(REPLAY_CACHE_CAPACITY, Duration::from_secs(config.auth.challenge_window_secs.max(1) as u64 * 2)));
    let _ = replay_cache.clone().spawn_sweeper(DEDUP_SWEEP_INTERVAL);
    let auth = Arc::new(AuthGate::new(
        ledger.clone(),
        bearer_secret,
        config.auth.challenge_window_secs,
        map_auto_register(config.auth.auto_register),
        replay_cache,
    ));

    let broadcaster = Arc::new(Broadcaster::new());
    let idempotency_cache = Arc::new(DedupCache::new(IDEMPOTENCY_CACHE_CAPACITY, Duration::from_secs(600)));
    let _ = idempotency_cache.clone().spawn_sweeper(DEDUP_SWEEP_INTERVAL);
    let tool_router = Arc::new(ToolRouter::new());
    let agents = AgentManager::new();
    let cancel_grace = Duration::from_secs(config.auth.cancel_grace_secs);

    let conversation = Arc::new(ConversationService::new(
        ledger.clone(),
        agents.clone(),
        broadcaster.clone(),
        idempotency_cache,
        cancel_grace,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rpc_service = AgentStreamService::new(
        auth.clone(),
        agents.clone(),
        tool_router.clone(),
        uuid::Uuid::new_v4().to_string(),
        Duration::from_secs(config.auth.heartbeat_interval_secs),
        Duration::from_secs(config.auth.heartbeat_timeout_secs),
        cancel_grace,
    );
    let rpc_bind: std::net::SocketAddr = config.rpc.bind.parse()?;
    let mut rpc_shutdown_rx = shutdown_rx.clone();
    let rpc_fut: ServerFuture = Box::pin(async move {
        info!(bind = %rpc_bind, "Agent Stream RPC listening");
        Server::builder()
            .add_service(AgentStreamServer::new(rpc_service))
            .serve_with_shutdown(rpc_bind, async move {
                let _ = rpc_shutdown_rx.changed().await;
            })
            .await?;
        Ok(())
    });

    let app_state = AppState {
        conversation: conversation.clone(),
        agents: agents.clone(),
        auth,
        ledger,
        questions: QuestionBroker::new(),
        failure_limiter: Arc::new(http::auth::FailureLimiter::default()),
        max_attachment_bytes: config.auth.max_attachment_bytes,
        max_body_bytes: config.http.max_body_bytes,
    };
    let http_bind = config.http.bind.clone();
    let mut http_shutdown_rx = shutdown_rx.clone();
    let http_fut: ServerFuture = Box::pin(async move {
        http::serve(&http_bind, app_state, async move {
            let _ = http_shutdown_rx.changed().await;
        })
        .await
    });

    Ok((Gateway { conversation, agents, shutdown_tx }, http_fut, rpc_fut))
}

fn open_ledger(db_path: &Path) -> anyhow::Result<SqliteLedger> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %db_path.display(), "opening ledger database");
    Ok(SqliteLedger::open(db_path)?)
}

fn resolve_bearer_secret(env_var: &str) -> Vec<u8> {
    match std::env::var(env_var) {
        Ok(secret) if !secret.is_empty() => secret.into_bytes(),
        _ => {
            warn!(
                env_var,
                "bearer-signing secret not set; generating an ephemeral one for this run — \
                 tokens issued now will stop verifying after a restart"
            );
            let mut bytes = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        }
    }
}

fn map_auto_register(policy: ConfigAutoRegisterPolicy) -> AutoRegisterPolicy {
    match policy {
        ConfigAutoRegisterPolicy::Approved => AutoRegisterPolicy::Approved,
        ConfigAutoRegisterPolicy::Pending => AutoRegisterPolicy::Pending,
        ConfigAutoRegisterPolicy::Disabled => AutoRegisterPolicy::Disabled,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
