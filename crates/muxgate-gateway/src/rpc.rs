// SPDX-License-Identifier: Apache-2.0
//! Agent Stream Service: the tonic implementation of the bidirectional RPC.
//! On stream open it authenticates the caller, runs the registration
//! handshake, and on success hands the stream off to an [`AgentConnection`]
//! for the rest of its life.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use muxgate_proto as proto;
use proto::agent_stream_server::AgentStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use muxgate_core::auth::Credential;
use muxgate_core::{AuthGate, ToolRouter};

use crate::connection::{
    AgentConnection, Attachment, InboundFrame, OutboundFrame, Priority, RegistrationMetadata,
    ResponseEvent,
};
use crate::manager::AgentManager;

pub struct AgentStreamService {
    auth: Arc<AuthGate>,
    manager: AgentManager,
    tool_router: Arc<ToolRouter>,
    server_id: String,
    instance_id: String,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    reconnect_grace: Duration,
}

impl AgentStreamService {
    pub fn new(
        auth: Arc<AuthGate>,
        manager: AgentManager,
        tool_router: Arc<ToolRouter>,
        server_id: String,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        reconnect_grace: Duration,
    ) -> Self {
        Self {
            auth,
            manager,
            tool_router,
            server_id,
            instance_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval,
            heartbeat_timeout,
            reconnect_grace,
        }
    }

    fn extract_credential(metadata: &tonic::metadata::MetadataMap) -> Result<Credential, Status> {
        let get = |k: &str| metadata.get(k).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

        if let Some(auth_header) = get("authorization") {
            if let Some(token) = auth_header.strip_prefix("Bearer ") {
                return Ok(Credential::BearerToken(token.to_string()));
            }
        }

        let pubkey_hex = get("x-ssh-pubkey").ok_or_else(|| Status::unauthenticated("missing credentials"))?;
        let signature_b64 = get("x-ssh-signature").ok_or_else(|| Status::unauthenticated("missing credentials"))?;
        let timestamp: i64 = get("x-ssh-timestamp")
            .ok_or_else(|| Status::unauthenticated("missing credentials"))?
            .parse()
            .map_err(|_| Status::unauthenticated("malformed timestamp"))?;
        let nonce = get("x-ssh-nonce").ok_or_else(|| Status::unauthenticated("missing credentials"))?;

        Ok(Credential::SignedChallenge(muxgate_core::auth::SignedChallenge {
            pubkey_hex,
            signature_b64,
            timestamp,
            nonce,
        }))
    }
}

#[tonic::async_trait]
impl AgentStream for AgentStreamService {
    type ConnectStream = Pin<Box<dyn Stream<Item = Result<proto::GatewayFrame, Status>> + Send + 'static>>;

    async fn connect(
        &self,
        request: Request<Streaming<proto::AgentFrame>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let credential = Self::extract_credential(request.metadata())?;
        let principal = self
            .auth
            .authenticate(credential, chrono::Utc::now().timestamp())
            .await
            .map_err(|_| Status::unauthenticated("authentication failed"))?;

        let mut in_stream = request.into_inner();

        let first = in_stream
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("stream closed before handshake"))?
            .map_err(|e| Status::invalid_argument(format!("transport error: {e}")))?;

        let register = match first.payload {
            Some(proto::agent_frame::Payload::Register(r)) => r,
            _ => return Err(Status::invalid_argument("first frame must be RegisterAgent")),
        };

        let metadata = register.metadata.map(|m| RegistrationMetadata {
            working_dir: m.working_dir,
            hostname: m.hostname,
            os: m.os,
            workspaces: m.workspaces,
            backend: m.backend,
        }).unwrap_or_default();

        let (conn, outbound_rx) = AgentConnection::new(
            register.agent_id.clone(),
            register.display_name,
            register.capabilities,
            register.protocol_features,
            metadata,
            principal.id.clone(),
        );

        if let Err(reason) = validate_agent_id(&register.agent_id) {
            let _ = conn
                .enqueue_outbound(OutboundFrame::RegistrationError { reason, suggested_id: None })
                .await;
            warn!(agent_id = %register.agent_id, "rejected malformed agent id");
            let stream = ReceiverStream::new(outbound_rx).map(|f| Ok(outbound_to_proto(f)));
            return Ok(Response::new(Box::pin(stream)));
        }

        if let Some(existing) = self.manager.get(&register.agent_id) {
            if existing.last_heartbeat_elapsed() < self.reconnect_grace {
                let _ = conn
                    .enqueue_outbound(OutboundFrame::RegistrationError {
                        reason: "agent id already connected".to_string(),
                        suggested_id: None,
                    })
                    .await;
                warn!(agent_id = %register.agent_id, "duplicate registration rejected");
                let stream = ReceiverStream::new(outbound_rx).map(|f| Ok(outbound_to_proto(f)));
                return Ok(Response::new(Box::pin(stream)));
            }
            info!(agent_id = %register.agent_id, "reconnect grace elapsed; preempting stale connection");
            existing.close_with_synthetic_error("preempted by reconnect");
            self.manager.replace(conn.clone());
        } else {
            self.manager.register(conn.clone()).map_err(|e| Status::already_exists(e.to_string()))?;
        }

        let available_tools = self.tool_router.manifests_for(&conn.capabilities()).into_iter().map(|m| m.name).collect();
        conn.enqueue_outbound(OutboundFrame::Welcome {
            server_id: self.server_id.clone(),
            agent_id: conn.agent_id().to_string(),
            instance_id: self.instance_id.clone(),
            principal_id: principal.id.clone(),
            available_tools,
            secrets: HashMap::new(),
            mcp_endpoint: None,
            mcp_token: None,
        })
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

        let has_heartbeat = conn.has_feature("heartbeat");
        let receive_conn = conn.clone();
        let manager = self.manager.clone();
        let tool_router = self.tool_router.clone();
        let heartbeat_timeout = self.heartbeat_timeout;
        let heartbeat_interval = self.heartbeat_interval;
        let agent_id = conn.agent_id().to_string();

        tokio::spawn(async move {
            let heartbeat_conn = receive_conn.clone();
            let heartbeat_agent_id = agent_id.clone();
            let watchdog = async move {
                if !has_heartbeat {
                    std::future::pending::<()>().await;
                    return;
                }
                loop {
                    tokio::time::sleep(heartbeat_interval).await;
                    if heartbeat_conn.last_heartbeat_elapsed() > heartbeat_timeout {
                        warn!(agent_id = %heartbeat_agent_id, "heartbeat timeout; closing connection");
                        heartbeat_conn.close_with_synthetic_error("heartbeat timeout");
                        break;
                    }
                }
            };
            tokio::pin!(watchdog);

            loop {
                tokio::select! {
                    _ = &mut watchdog => break,
                    frame = in_stream.next() => {
                        match frame {
                            Some(Ok(f)) => {
                                if let Some(inbound) = inbound_from_proto(f) {
                                    let caps = receive_conn.capabilities();
                                    receive_conn.handle_inbound(inbound, &tool_router, &caps).await;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(%agent_id, error = %e, "agent stream transport error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            manager.unregister(&agent_id);
            receive_conn.close_with_synthetic_error("agent disconnected");
            info!(%agent_id, "agent connection closed");
        });

        let stream = ReceiverStream::new(outbound_rx).map(|f| Ok(outbound_to_proto(f)));
        Ok(Response::new(Box::pin(stream)))
    }
}

const MAX_AGENT_ID_LEN: usize = 128;

/// Agent ids are used as map keys, log fields, and SQL parameters — require
/// a non-empty, bounded, ASCII identifier so a malformed id can't collide
/// with or masquerade as another agent's.
fn validate_agent_id(agent_id: &str) -> Result<(), String> {
    if agent_id.is_empty() {
        return Err("agent id must not be empty".to_string());
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(format!("agent id must be at most {MAX_AGENT_ID_LEN} bytes"));
    }
    if !agent_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')) {
        return Err("agent id must contain only ASCII alphanumerics, '-', '_', '.', or ':'".to_string());
    }
    Ok(())
}

fn inbound_from_proto(frame: proto::AgentFrame) -> Option<InboundFrame> {
    match frame.payload? {
        proto::agent_frame::Payload::Register(r) => Some(InboundFrame::RegisterAgent {
            agent_id: r.agent_id,
            display_name: r.display_name,
            capabilities: r.capabilities,
            metadata: r.metadata.map(|m| RegistrationMetadata {
                working_dir: m.working_dir,
                hostname: m.hostname,
                os: m.os,
                workspaces: m.workspaces,
                backend: m.backend,
            }).unwrap_or_default(),
            protocol_features: r.protocol_features,
        }),
        proto::agent_frame::Payload::MessageResponse(m) => {
            response_event_from_proto(m.event.and_then(|e| e.kind))
                .map(|event| InboundFrame::MessageResponse { request_id: m.request_id, event })
        }
        proto::agent_frame::Payload::Heartbeat(h) => Some(InboundFrame::Heartbeat { timestamp_ms: h.timestamp_ms }),
        proto::agent_frame::Payload::InjectionAck(a) => Some(InboundFrame::InjectionAck {
            injection_id: a.injection_id,
            accepted: a.accepted,
            reason: a.reason,
        }),
        proto::agent_frame::Payload::ExecutePackTool(t) => Some(InboundFrame::ExecutePackTool {
            request_id: t.request_id,
            tool_name: t.tool_name,
            input_json: t.input_json,
        }),
    }
}

fn response_event_from_proto(kind: Option<proto::agent_response_event::Kind>) -> Option<ResponseEvent> {
    use proto::agent_response_event::Kind;
    Some(match kind? {
        Kind::Thinking(s) => ResponseEvent::Thinking(s),
        Kind::Text(s) => ResponseEvent::Text(s),
        Kind::ToolUse(t) => ResponseEvent::ToolUse { id: t.id, name: t.name, input_json: t.input_json },
        Kind::ToolResult(t) => ResponseEvent::ToolResult { id: t.id, output: t.output, is_error: t.is_error },
        Kind::Done(d) => ResponseEvent::Done { full_response: d.full_response },
        Kind::Error(s) => ResponseEvent::Error(s),
        Kind::File(f) => ResponseEvent::File { filename: f.filename, mime_type: f.mime_type, data: f.data },
        Kind::ToolApprovalRequest(t) => {
            ResponseEvent::ToolApprovalRequest { id: t.id, name: t.name, input_json: t.input_json }
        }
        Kind::SessionInit(s) => ResponseEvent::SessionInit { session_id: s.session_id },
        Kind::SessionOrphaned(s) => ResponseEvent::SessionOrphaned { reason: s.reason },
        Kind::Usage(u) => ResponseEvent::Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_tokens,
            cache_write_tokens: u.cache_write_tokens,
            thinking_tokens: u.thinking_tokens,
        },
        Kind::ToolState(t) => ResponseEvent::ToolState {
            id: t.id,
            state: tool_state_from_str(&t.state),
            detail: t.detail,
        },
        Kind::Canceled(c) => ResponseEvent::Canceled { reason: c.reason },
    })
}

fn tool_state_from_str(s: &str) -> muxgate_core::ToolState {
    use muxgate_core::ToolState::*;
    match s {
        "pending" => Pending,
        "awaiting_approval" => AwaitingApproval,
        "running" => Running,
        "completed" => Completed,
        "failed" => Failed,
        "denied" => Denied,
        "timeout" => Timeout,
        "canceled" => Canceled,
        other => {
            warn!(state = other, "unrecognized tool_state value from agent; defaulting to running");
            Running
        }
    }
}

fn outbound_to_proto(frame: OutboundFrame) -> proto::GatewayFrame {
    use proto::gateway_frame::Payload;
    let payload = match frame {
        OutboundFrame::Welcome {
            server_id,
            agent_id,
            instance_id,
            principal_id,
            available_tools,
            secrets,
            mcp_endpoint,
            mcp_token,
        } => Payload::Welcome(proto::Welcome {
            server_id,
            agent_id,
            instance_id,
            principal_id,
            available_tools,
            secrets,
            mcp_endpoint,
            mcp_token,
        }),
        OutboundFrame::SendMessage { request_id, thread_id, sender, content, attachments } => {
            Payload::SendMessage(proto::SendMessage {
                request_id,
                thread_id,
                sender,
                content,
                attachments: attachments.into_iter().map(attachment_to_proto).collect(),
            })
        }
        OutboundFrame::Shutdown { reason } => Payload::Shutdown(proto::Shutdown { reason }),
        OutboundFrame::ToolApprovalResponse { id, approved, approve_all } => {
            Payload::ToolApprovalResponse(proto::ToolApprovalResponse { id, approved, approve_all })
        }
        OutboundFrame::RegistrationError { reason, suggested_id } => {
            Payload::RegistrationError(proto::RegistrationError { reason, suggested_id })
        }
        OutboundFrame::InjectContext { injection_id, content, priority, source } => {
            Payload::InjectContext(proto::InjectContext {
                injection_id,
                content,
                priority: priority_to_proto(priority) as i32,
                source,
            })
        }
        OutboundFrame::CancelRequest { request_id, reason } => {
            Payload::CancelRequest(proto::CancelRequest { request_id, reason })
        }
        OutboundFrame::PackToolResult { request_id, result } => {
            let result = Some(match result {
                Ok(output_json) => proto::pack_tool_result::Result::OutputJson(output_json),
                Err(error) => proto::pack_tool_result::Result::Error(error),
            });
            Payload::PackToolResult(proto::PackToolResult { request_id, result })
        }
    };
    proto::GatewayFrame { payload: Some(payload) }
}

fn attachment_to_proto(a: Attachment) -> proto::Attachment {
    proto::Attachment { filename: a.filename, mime_type: a.mime_type, data: a.data }
}

fn priority_to_proto(p: Priority) -> proto::Priority {
    match p {
        Priority::Immediate => proto::Priority::Immediate,
        Priority::Normal => proto::Priority::Normal,
        Priority::Deferred => proto::Priority::Deferred,
    }
}
