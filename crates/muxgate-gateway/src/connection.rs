// SPDX-License-Identifier: Apache-2.0
//! Agent Connection: one per connected agent. Owns the pending-request
//! arena, the outbound send queue, and the `HANDSHAKING → READY → CLOSING →
//! CLOSED` state machine. The RPC layer owns the actual stream I/O and
//! drives this type by feeding it decoded frames and consuming its outbound
//! queue.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use muxgate_core::{GatewayError, Result, ToolRouter};

/// Lifecycle state of an [`AgentConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// One event in an agent's response stream for a single request id, decoded
/// from the wire and independent of it — the conversation service and tests
/// never touch protobuf types directly.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Thinking(String),
    Text(String),
    ToolUse { id: String, name: String, input_json: String },
    ToolResult { id: String, output: String, is_error: bool },
    Done { full_response: Option<String> },
    Error(String),
    File { filename: String, mime_type: String, data: Vec<u8> },
    ToolApprovalRequest { id: String, name: String, input_json: String },
    SessionInit { session_id: String },
    SessionOrphaned { reason: String },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
        thinking_tokens: u64,
    },
    ToolState { id: String, state: muxgate_core::ToolState, detail: Option<String> },
    Canceled { reason: String },
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::Done { .. } | ResponseEvent::Error(_) | ResponseEvent::Canceled { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Immediate,
    Normal,
    Deferred,
}

/// A frame the send loop must write to the agent's stream.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Welcome {
        server_id: String,
        agent_id: String,
        instance_id: String,
        principal_id: String,
        available_tools: Vec<String>,
        secrets: HashMap<String, String>,
        mcp_endpoint: Option<String>,
        mcp_token: Option<String>,
    },
    SendMessage {
        request_id: String,
        thread_id: String,
        sender: String,
        content: String,
        attachments: Vec<Attachment>,
    },
    Shutdown {
        reason: String,
    },
    ToolApprovalResponse {
        id: String,
        approved: bool,
        approve_all: bool,
    },
    RegistrationError {
        reason: String,
        suggested_id: Option<String>,
    },
    InjectContext {
        injection_id: String,
        content: String,
        priority: Priority,
        source: Option<String>,
    },
    CancelRequest {
        request_id: String,
        reason: Option<String>,
    },
    PackToolResult {
        request_id: String,
        result: std::result::Result<String, String>,
    },
}

/// A frame received from the agent, decoded from the wire by the RPC layer.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    RegisterAgent {
        agent_id: String,
        display_name: String,
        capabilities: Vec<String>,
        metadata: RegistrationMetadata,
        protocol_features: Vec<String>,
    },
    MessageResponse { request_id: String, event: ResponseEvent },
    Heartbeat { timestamp_ms: u64 },
    InjectionAck { injection_id: String, accepted: bool, reason: Option<String> },
    ExecutePackTool { request_id: String, tool_name: String, input_json: String },
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationMetadata {
    pub working_dir: String,
    pub hostname: String,
    pub os: String,
    pub workspaces: Vec<String>,
    pub backend: String,
}

struct PendingRequest {
    tx: mpsc::Sender<ResponseEvent>,
    created_at: Instant,
    cancel_sent: bool,
}

struct Inner {
    agent_id: String,
    display_name: StdMutex<String>,
    capabilities: StdMutex<Vec<String>>,
    protocol_features: StdMutex<Vec<String>>,
    metadata: StdMutex<RegistrationMetadata>,
    principal_id: String,
    state: StdMutex<ConnState>,
    last_heartbeat: StdMutex<Instant>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    pending: StdMutex<HashMap<String, PendingRequest>>,
    pending_injections: StdMutex<HashMap<String, oneshot::Sender<(bool, Option<String>)>>>,
}

/// One connected agent. Cheap to clone (`Arc` internally).
#[derive(Clone)]
pub struct AgentConnection {
    inner: std::sync::Arc<Inner>,
}

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const RESPONSE_QUEUE_CAPACITY: usize = 64;

impl AgentConnection {
    /// Construct a new connection in `Ready` state (the handshake itself is
    /// driven by the RPC layer before this is called) and its outbound
    /// queue receiver, which the send loop drains.
    pub fn new(
        agent_id: String,
        display_name: String,
        capabilities: Vec<String>,
        protocol_features: Vec<String>,
        metadata: RegistrationMetadata,
        principal_id: String,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let inner = Inner {
            agent_id,
            display_name: StdMutex::new(display_name),
            capabilities: StdMutex::new(capabilities),
            protocol_features: StdMutex::new(protocol_features),
            metadata: StdMutex::new(metadata),
            principal_id,
            state: StdMutex::new(ConnState::Ready),
            last_heartbeat: StdMutex::new(Instant::now()),
            outbound_tx,
            pending: StdMutex::new(HashMap::new()),
            pending_injections: StdMutex::new(HashMap::new()),
        };
        (Self { inner: std::sync::Arc::new(inner) }, outbound_rx)
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn display_name(&self) -> String {
        self.inner.display_name.lock().unwrap().clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.inner.capabilities.lock().unwrap().clone()
    }

    pub fn protocol_features(&self) -> Vec<String> {
        self.inner.protocol_features.lock().unwrap().clone()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.protocol_features().iter().any(|f| f == feature)
    }

    pub fn metadata(&self) -> RegistrationMetadata {
        self.inner.metadata.lock().unwrap().clone()
    }

    pub fn principal_id(&self) -> &str {
        &self.inner.principal_id
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().unwrap()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    fn set_state(&self, next: ConnState) {
        *self.inner.state.lock().unwrap() = next;
    }

    /// Touch the heartbeat clock. Called by the receive loop on `Heartbeat`.
    pub fn touch_heartbeat(&self) {
        *self.inner.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.inner.last_heartbeat.lock().unwrap().elapsed()
    }

    /// Queue a frame for the send loop. Exposed crate-wide so the RPC layer
    /// can deliver `Welcome`/`RegistrationError` during the handshake, which
    /// happens before the connection is necessarily registered anywhere.
    pub(crate) async fn enqueue_outbound(&self, frame: OutboundFrame) -> Result<()> {
        self.inner
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| GatewayError::Unavailable("agent send queue closed".into()))
    }

    fn try_enqueue_outbound(&self, frame: OutboundFrame) -> Result<()> {
        self.inner
            .outbound_tx
            .try_send(frame)
            .map_err(|_| GatewayError::Unavailable("agent send queue full or closed".into()))
    }

    /// §4.5 per-request dispatch: allocate a request id, register a pending
    /// response queue, enqueue `SendMessage`, and return the receive handle.
    pub async fn send(
        &self,
        thread_id: &str,
        sender: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(String, mpsc::Receiver<ResponseEvent>)> {
        if self.state() != ConnState::Ready {
            return Err(GatewayError::Unavailable("agent connection is not ready".into()));
        }
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        self.inner.pending.lock().unwrap().insert(
            request_id.clone(),
            PendingRequest { tx, created_at: Instant::now(), cancel_sent: false },
        );

        self.enqueue_outbound(OutboundFrame::SendMessage {
            request_id: request_id.clone(),
            thread_id: thread_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            attachments,
        })
        .await
        .inspect_err(|_| {
            self.inner.pending.lock().unwrap().remove(&request_id);
        })?;

        Ok((request_id, rx))
    }

    /// Caller-side cancellation: emit `CancelRequest` and, after `grace`, if
    /// the agent hasn't produced a terminal event, force-close the pending
    /// request with a synthetic `canceled` event.
    pub async fn cancel_request(&self, request_id: &str, reason: Option<String>, grace: Duration) {
        if !self.has_feature("cancellation") {
            warn!(%request_id, "agent does not declare the cancellation feature; cancel is a no-op");
            return;
        }
        let already_sent = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get_mut(request_id) {
                Some(p) if !p.cancel_sent => {
                    p.cancel_sent = true;
                    false
                }
                Some(_) => true,
                None => return,
            }
        };
        if already_sent {
            return;
        }

        let _ = self
            .enqueue_outbound(OutboundFrame::CancelRequest {
                request_id: request_id.to_string(),
                reason: reason.clone(),
            })
            .await;

        tokio::time::sleep(grace).await;

        let leftover = self.inner.pending.lock().unwrap().remove(request_id);
        if let Some(p) = leftover {
            debug!(%request_id, "cancel grace elapsed; force-closing pending request");
            let _ = p
                .tx
                .send(ResponseEvent::Canceled {
                    reason: reason.unwrap_or_else(|| "cancel grace period elapsed".to_string()),
                })
                .await;
        }
    }

    /// §4.5 best-effort tool approval relay.
    pub fn send_tool_approval(&self, id: &str, approved: bool, approve_all: bool) -> Result<()> {
        self.try_enqueue_outbound(OutboundFrame::ToolApprovalResponse {
            id: id.to_string(),
            approved,
            approve_all,
        })
    }

    /// §4.5 context injection; best-effort, awaits the agent's ack.
    pub async fn inject_context(
        &self,
        content: &str,
        priority: Priority,
        source: Option<String>,
    ) -> Result<(bool, Option<String>)> {
        if !self.has_feature("injection") {
            return Err(GatewayError::Unavailable("agent does not declare the injection feature".into()));
        }
        let injection_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending_injections.lock().unwrap().insert(injection_id.clone(), tx);

        if let Err(e) = self
            .enqueue_outbound(OutboundFrame::InjectContext {
                injection_id: injection_id.clone(),
                content: content.to_string(),
                priority,
                source,
            })
            .await
        {
            self.inner.pending_injections.lock().unwrap().remove(&injection_id);
            return Err(e);
        }

        rx.await
            .map_err(|_| GatewayError::Unavailable("connection closed before injection ack".into()))
    }

    pub async fn shutdown(&self, reason: &str) {
        self.set_state(ConnState::Closing);
        let _ = self
            .enqueue_outbound(OutboundFrame::Shutdown { reason: reason.to_string() })
            .await;
        self.close_with_synthetic_error(reason);
    }

    /// On connection loss (heartbeat timeout, transport error, or stream
    /// end): synthesize an `error` terminal for every still-pending request.
    pub fn close_with_synthetic_error(&self, reason: &str) {
        self.set_state(ConnState::Closed);
        let pending: Vec<PendingRequest> = {
            let mut map = self.inner.pending.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for p in pending {
            let tx = p.tx;
            let reason = reason.to_string();
            tokio::spawn(async move {
                let _ = tx.send(ResponseEvent::Error(reason)).await;
            });
        }
    }

    /// §4.5 receive-loop dispatch for a single decoded inbound frame.
    /// `caller_capabilities` are the capabilities recorded for this agent's
    /// principal (used to authorize `ExecutePackTool`).
    pub async fn handle_inbound(
        &self,
        frame: InboundFrame,
        tool_router: &ToolRouter,
        caller_capabilities: &[String],
    ) {
        match frame {
            InboundFrame::RegisterAgent { .. } => {
                warn!(agent_id = %self.agent_id(), "duplicate RegisterAgent after handshake; ignored");
            }
            InboundFrame::Heartbeat { .. } => {
                self.touch_heartbeat();
            }
            InboundFrame::InjectionAck { injection_id, accepted, reason } => {
                if let Some(tx) = self.inner.pending_injections.lock().unwrap().remove(&injection_id) {
                    let _ = tx.send((accepted, reason));
                } else {
                    debug!(%injection_id, "InjectionAck for unknown injection id; dropped");
                }
            }
            InboundFrame::MessageResponse { request_id, event } => {
                self.deliver_response(&request_id, event).await;
            }
            InboundFrame::ExecutePackTool { request_id, tool_name, input_json } => {
                self.execute_pack_tool(request_id, tool_name, input_json, tool_router, caller_capabilities)
                    .await;
            }
        }
    }

    async fn deliver_response(&self, request_id: &str, event: ResponseEvent) {
        let is_terminal = event.is_terminal();
        let tx = {
            let mut pending = self.inner.pending.lock().unwrap();
            if is_terminal {
                pending.remove(request_id).map(|p| p.tx)
            } else {
                pending.get(request_id).map(|p| p.tx.clone())
            }
        };
        match tx {
            Some(tx) => {
                // Backpressure by design: a slow caller blocks this send,
                // which blocks the receive loop, which blocks the agent's
                // stream — exactly the propagation the resource model wants.
                if tx.send(event).await.is_err() {
                    debug!(%request_id, "response receiver dropped; caller abandoned the request");
                }
            }
            None => {
                debug!(%request_id, "MessageResponse for unknown or already-terminated request id; dropped");
            }
        }
    }

    async fn execute_pack_tool(
        &self,
        request_id: String,
        tool_name: String,
        input_json: String,
        tool_router: &ToolRouter,
        caller_capabilities: &[String],
    ) {
        let input: serde_json::Value = match serde_json::from_str(&input_json) {
            Ok(v) => v,
            Err(e) => {
                let _ = self
                    .enqueue_outbound(OutboundFrame::PackToolResult {
                        request_id,
                        result: Err(format!("invalid tool input json: {e}")),
                    })
                    .await;
                return;
            }
        };

        let result = tool_router.invoke(&tool_name, input, caller_capabilities, None).await;
        let result = match result {
            Ok(output) => Ok(output.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let _ = self
            .enqueue_outbound(OutboundFrame::PackToolResult { request_id, result })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_conn(features: &[&str]) -> (AgentConnection, mpsc::Receiver<OutboundFrame>) {
        AgentConnection::new(
            "agent-a".into(),
            "Agent A".into(),
            vec!["read".into()],
            features.iter().map(|s| s.to_string()).collect(),
            RegistrationMetadata::default(),
            "p1".into(),
        )
    }

    #[tokio::test]
    async fn send_allocates_request_id_and_enqueues_send_message() {
        let (conn, mut outbound) = new_conn(&[]);
        let (request_id, _rx) = conn.send("agent-a", "u", "hi", vec![]).await.unwrap();
        assert_eq!(conn.pending_request_count(), 1);
        match outbound.recv().await.unwrap() {
            OutboundFrame::SendMessage { request_id: rid, content, .. } => {
                assert_eq!(rid, request_id);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_event_removes_pending_request() {
        let (conn, _outbound) = new_conn(&[]);
        let (request_id, mut rx) = conn.send("agent-a", "u", "hi", vec![]).await.unwrap();
        conn.deliver_response(&request_id, ResponseEvent::Text("hello".into())).await;
        conn.deliver_response(&request_id, ResponseEvent::Done { full_response: None }).await;
        assert_eq!(conn.pending_request_count(), 0);
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Text(_)));
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Done { .. }));
    }

    #[tokio::test]
    async fn unknown_request_id_is_dropped_silently() {
        let (conn, _outbound) = new_conn(&[]);
        conn.deliver_response("ghost", ResponseEvent::Text("x".into())).await;
        assert_eq!(conn.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_updates_last_seen() {
        let (conn, _outbound) = new_conn(&[]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let before = conn.last_heartbeat_elapsed();
        conn.touch_heartbeat();
        assert!(conn.last_heartbeat_elapsed() < before);
    }

    #[tokio::test]
    async fn connection_loss_synthesizes_error_for_pending_requests() {
        let (conn, _outbound) = new_conn(&[]);
        let (_request_id, mut rx) = conn.send("agent-a", "u", "hi", vec![]).await.unwrap();
        conn.close_with_synthetic_error("heartbeat timeout");
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Error(_)));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn cancel_request_without_feature_is_noop() {
        let (conn, mut outbound) = new_conn(&[]);
        let (request_id, _rx) = conn.send("agent-a", "u", "hi", vec![]).await.unwrap();
        conn.cancel_request(&request_id, None, Duration::from_millis(10)).await;
        // SendMessage is the only frame enqueued — no CancelRequest followed.
        assert!(matches!(outbound.recv().await.unwrap(), OutboundFrame::SendMessage { .. }));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_request_force_closes_after_grace_with_no_agent_reply() {
        let (conn, mut outbound) = new_conn(&["cancellation"]);
        let (request_id, mut rx) = conn.send("agent-a", "u", "hi", vec![]).await.unwrap();
        let _ = outbound.recv().await.unwrap(); // drain SendMessage

        conn.cancel_request(&request_id, Some("user".into()), Duration::from_millis(20)).await;

        assert!(matches!(outbound.recv().await.unwrap(), OutboundFrame::CancelRequest { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Canceled { .. }));
        assert_eq!(conn.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn inject_context_without_feature_fails_unavailable() {
        let (conn, _outbound) = new_conn(&[]);
        let err = conn.inject_context("ctx", Priority::Normal, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn inject_context_resolves_on_ack() {
        let (conn, mut outbound) = new_conn(&["injection"]);
        let conn2 = conn.clone();
        let handle = tokio::spawn(async move { conn2.inject_context("ctx", Priority::Normal, None).await });

        let injection_id = match outbound.recv().await.unwrap() {
            OutboundFrame::InjectContext { injection_id, .. } => injection_id,
            other => panic!("unexpected frame: {other:?}"),
        };

        conn.handle_inbound(
            InboundFrame::InjectionAck { injection_id, accepted: true, reason: None },
            &ToolRouter::new(),
            &[],
        )
        .await;

        let (accepted, reason) = handle.await.unwrap().unwrap();
        assert!(accepted);
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn send_tool_approval_enqueues_frame() {
        let (conn, mut outbound) = new_conn(&[]);
        conn.send_tool_approval("t1", true, false).unwrap();
        assert!(matches!(
            outbound.recv().await.unwrap(),
            OutboundFrame::ToolApprovalResponse { approved: true, .. }
        ));
    }
}
