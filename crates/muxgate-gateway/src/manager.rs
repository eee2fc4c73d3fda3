// SPDX-License-Identifier: Apache-2.0
//! Agent Manager: the registry of currently-connected agents. At most one
//! live connection per agent id; callers look an agent up by id or
//! workspace tag and dispatch through the returned [`AgentConnection`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use muxgate_core::{GatewayError, Result};

use crate::connection::AgentConnection;

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, AgentConnection>,
}

/// Shared, cloneable handle to the connection registry.
#[derive(Clone, Default)]
pub struct AgentManager {
    inner: Arc<RwLock<Registry>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly-handshaken connection. Returns `conflict` if an
    /// agent with the same id is already registered — callers are expected
    /// to have already applied the duplicate-id reconnect policy before
    /// calling this (§4.5's "missed heartbeats beyond reconnect grace"
    /// check happens in the RPC layer, not here).
    pub fn register(&self, conn: AgentConnection) -> Result<()> {
        let mut registry = self.inner.write().unwrap();
        if registry.by_id.contains_key(conn.agent_id()) {
            return Err(GatewayError::Conflict(format!(
                "agent {} is already connected",
                conn.agent_id()
            )));
        }
        info!(agent_id = %conn.agent_id(), "agent registered");
        registry.by_id.insert(conn.agent_id().to_string(), conn);
        Ok(())
    }

    /// Force-replace an existing registration, used when the duplicate-id
    /// policy decides the prior connection is stale.
    pub fn replace(&self, conn: AgentConnection) -> Option<AgentConnection> {
        let mut registry = self.inner.write().unwrap();
        info!(agent_id = %conn.agent_id(), "agent registration replaced (stale prior connection)");
        registry.by_id.insert(conn.agent_id().to_string(), conn)
    }

    pub fn unregister(&self, agent_id: &str) {
        let mut registry = self.inner.write().unwrap();
        if registry.by_id.remove(agent_id).is_some() {
            info!(%agent_id, "agent unregistered");
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentConnection> {
        self.inner.read().unwrap().by_id.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentConnection> {
        self.inner.read().unwrap().by_id.values().cloned().collect()
    }

    pub fn list_by_workspace(&self, workspace: &str) -> Vec<AgentConnection> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .values()
            .filter(|c| c.metadata().workspaces.iter().any(|w| w == workspace))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a request to `agent_id`, failing `not-found` if no connection is
    /// registered under that id. Returns the connection alongside the
    /// request id and response handle so the caller can drive cancellation
    /// against the same connection later.
    pub async fn send_message(
        &self,
        agent_id: &str,
        thread_id: &str,
        sender: &str,
        content: &str,
        attachments: Vec<crate::connection::Attachment>,
    ) -> Result<(AgentConnection, String, tokio::sync::mpsc::Receiver<crate::connection::ResponseEvent>)> {
        let conn = self
            .get(agent_id)
            .ok_or_else(|| GatewayError::NotFound(format!("agent {agent_id}")))?;
        let (request_id, rx) = conn.send(thread_id, sender, content, attachments).await?;
        Ok((conn, request_id, rx))
    }

    /// Request every connection to shut down, waiting on nothing — the RPC
    /// layer's own stream-end detection completes the teardown when the
    /// agent actually disconnects.
    pub async fn shutdown_all(&self, reason: &str) {
        let conns = self.list();
        for conn in conns {
            conn.shutdown(reason).await;
        }
    }
}
