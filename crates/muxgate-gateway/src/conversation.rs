// SPDX-License-Identifier: Apache-2.0
//! Conversation Service: the orchestrator that makes sending a message a
//! coherent record-first-then-dispatch operation, accumulates an agent's
//! streamed text into one ledger row per turn, and fans persisted and
//! live events out to subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use muxgate_core::{
    Broadcaster, DedupCache, EventDirection, EventFilter, EventPage, EventType, GatewayError,
    LedgerEvent, LedgerStore, Result,
};

use crate::connection::{AgentConnection, Attachment, ResponseEvent};
use crate::manager::AgentManager;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// Request accepted by [`ConversationService::send`].
pub struct SendRequest {
    pub conversation_key: String,
    pub content: String,
    pub sender: String,
    pub idempotency_key: Option<String>,
    pub attachments: Vec<Attachment>,
    /// The caller's own broadcaster subscription id, if it has one, so its
    /// live feed doesn't receive a duplicate of what it gets directly.
    pub originator_subscription_id: Option<u64>,
}

pub enum SendOutcome {
    /// Dispatched to an agent. `assigned_id` is the inbound ledger event's
    /// id — the durable anchor for this turn.
    Dispatched { assigned_id: String, events: mpsc::Receiver<ResponseEvent> },
    /// The idempotency key was already seen within TTL; nothing was
    /// dispatched and no new inbound event was written.
    Duplicate,
}

pub struct ConversationService {
    ledger: Arc<dyn LedgerStore>,
    agents: AgentManager,
    broadcaster: Arc<Broadcaster>,
    dedup: Arc<DedupCache>,
    cancel_grace: Duration,
}

impl ConversationService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        agents: AgentManager,
        broadcaster: Arc<Broadcaster>,
        dedup: Arc<DedupCache>,
        cancel_grace: Duration,
    ) -> Self {
        Self { ledger, agents, broadcaster, dedup, cancel_grace }
    }

    pub async fn send(&self, req: SendRequest) -> Result<SendOutcome> {
        if req.conversation_key.trim().is_empty() {
            return Err(GatewayError::Validation("conversation_key must not be empty".into()));
        }
        if req.content.trim().is_empty() {
            return Err(GatewayError::Validation("content must not be empty".into()));
        }

        if let Some(idem) = &req.idempotency_key {
            let dedup_key = format!("send:{}:{}", req.conversation_key, idem);
            if self.dedup.check_and_mark(&dedup_key) {
                return Ok(SendOutcome::Duplicate);
            }
        }

        let inbound = LedgerEvent {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_key: req.conversation_key.clone(),
            direction: EventDirection::InboundToAgent,
            author: req.sender.clone(),
            timestamp: chrono::Utc::now(),
            event_type: EventType::Message,
            text: Some(req.content.clone()),
            raw_transport: None,
            raw_payload_ref: None,
            actor_principal_id: None,
            actor_member_id: None,
        };
        self.ledger.save_event(inbound.clone()).await?;
        self.broadcaster.publish(&req.conversation_key, inbound.clone(), req.originator_subscription_id);

        let target_agent_id = self.resolve_target_agent_id(&req.conversation_key).await?;

        let (conn, request_id, response_rx) = self
            .agents
            .send_message(&target_agent_id, &req.conversation_key, &req.sender, &req.content, req.attachments)
            .await?;

        let (caller_tx, caller_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        tokio::spawn(fan_out(
            response_rx,
            caller_tx,
            self.ledger.clone(),
            self.broadcaster.clone(),
            req.conversation_key.clone(),
            target_agent_id,
            req.originator_subscription_id,
            conn,
            request_id,
            self.cancel_grace,
        ));

        Ok(SendOutcome::Dispatched { assigned_id: inbound.id, events: caller_rx })
    }

    async fn resolve_target_agent_id(&self, conversation_key: &str) -> Result<String> {
        if let Some((frontend, channel)) = conversation_key.split_once(':') {
            if let Some(binding) = self.ledger.get_binding(frontend, channel).await? {
                return Ok(binding.agent_id);
            }
        }
        Ok(conversation_key.to_string())
    }

    pub async fn get_history(&self, conversation_key: &str, filter: EventFilter) -> Result<EventPage> {
        self.ledger.get_events_by_conversation(conversation_key, filter).await
    }

    pub async fn get_thread(&self, thread_id: &str, limit: usize) -> Result<Vec<LedgerEvent>> {
        self.ledger.get_events_by_thread(thread_id, limit).await
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }
}

/// Drains `response_rx`, persisting, broadcasting, and forwarding each
/// event. Persistence is never abandoned just because the caller went away:
/// once the caller's receiver is dropped (S4: SSE client disconnect), this
/// sends exactly one `CancelRequest` to the agent and, if no terminal event
/// arrives within `cancel_grace`, `AgentConnection::cancel_request` force-closes
/// the pending request with a synthetic `canceled` event that still gets
/// persisted below.
async fn fan_out(
    mut response_rx: mpsc::Receiver<ResponseEvent>,
    caller_tx: mpsc::Sender<ResponseEvent>,
    ledger: Arc<dyn LedgerStore>,
    broadcaster: Arc<Broadcaster>,
    conversation_key: String,
    agent_id: String,
    exclude_subscription_id: Option<u64>,
    conn: AgentConnection,
    request_id: String,
    cancel_grace: Duration,
) {
    let author = format!("agent:{agent_id}");
    let mut text_buffer = String::new();
    let mut saw_terminal = false;
    let mut cancel_sent = false;

    while let Some(event) = response_rx.recv().await {
        publish_live(&broadcaster, &conversation_key, &author, &event, exclude_subscription_id);

        match &event {
            ResponseEvent::Text(s) => text_buffer.push_str(s),
            ResponseEvent::ToolUse { id, name, input_json } => {
                persist(
                    &ledger,
                    &conversation_key,
                    &author,
                    EventType::ToolCall,
                    serde_json::json!({"id": id, "name": name, "input_json": input_json}).to_string(),
                )
                .await;
            }
            ResponseEvent::ToolResult { id, output, is_error } => {
                persist(
                    &ledger,
                    &conversation_key,
                    &author,
                    EventType::ToolResult,
                    serde_json::json!({"id": id, "output": output, "is_error": is_error}).to_string(),
                )
                .await;
            }
            ResponseEvent::Done { full_response } => {
                saw_terminal = true;
                let text = full_response.clone().unwrap_or_else(|| std::mem::take(&mut text_buffer));
                if !text.is_empty() {
                    persist(&ledger, &conversation_key, &author, EventType::Message, text).await;
                }
            }
            ResponseEvent::Error(msg) => {
                saw_terminal = true;
                if !text_buffer.is_empty() {
                    persist(&ledger, &conversation_key, &author, EventType::Message, std::mem::take(&mut text_buffer)).await;
                }
                persist(&ledger, &conversation_key, &author, EventType::Error, msg.clone()).await;
            }
            ResponseEvent::Canceled { reason } => {
                saw_terminal = true;
                if !text_buffer.is_empty() {
                    persist(&ledger, &conversation_key, &author, EventType::Message, std::mem::take(&mut text_buffer)).await;
                }
                persist(
                    &ledger,
                    &conversation_key,
                    &author,
                    EventType::Error,
                    serde_json::json!({"status": "canceled", "reason": reason}).to_string(),
                )
                .await;
            }
            _ => {}
        }

        let is_terminal = event.is_terminal();
        if caller_tx.send(event).await.is_err() && !cancel_sent && !is_terminal {
            // Caller dropped its receiver (S4: SSE client disconnect). Persistence
            // above already ran; now ask the agent to stop. `cancel_request`
            // force-closes with a synthetic `canceled` event after `cancel_grace`
            // if the agent never replies, which this loop will observe as the
            // next `response_rx` item and persist like any other terminal event.
            cancel_sent = true;
            let conn = conn.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                conn.cancel_request(&request_id, Some("user".to_string()), cancel_grace).await;
            });
        }
        if is_terminal {
            break;
        }
    }

    if !saw_terminal {
        warn!(conversation_key, "agent response handle closed without a terminal event");
        if !text_buffer.is_empty() {
            persist(&ledger, &conversation_key, &author, EventType::Message, std::mem::take(&mut text_buffer)).await;
        }
        let reason = "connection closed before a terminal event was observed".to_string();
        persist(&ledger, &conversation_key, &author, EventType::Error, reason.clone()).await;
        let _ = caller_tx.send(ResponseEvent::Error(reason)).await;
    }
}

async fn persist(
    ledger: &Arc<dyn LedgerStore>,
    conversation_key: &str,
    author: &str,
    event_type: EventType,
    text: String,
) {
    let event = LedgerEvent {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_key: conversation_key.to_string(),
        direction: EventDirection::OutboundFromAgent,
        author: author.to_string(),
        timestamp: chrono::Utc::now(),
        event_type,
        text: Some(text),
        raw_transport: None,
        raw_payload_ref: None,
        actor_principal_id: None,
        actor_member_id: None,
    };
    if let Err(e) = ledger.save_event(event).await {
        warn!(conversation_key, error = %e, "failed to persist outbound ledger event");
    }
}

/// Publish a best-effort, possibly-transient representation of `event` for
/// live subscribers. Only events with readable text payloads are worth
/// forwarding; this is never the row of record — see the ledger for that.
fn publish_live(
    broadcaster: &Broadcaster,
    conversation_key: &str,
    author: &str,
    event: &ResponseEvent,
    exclude_subscription_id: Option<u64>,
) {
    let (event_type, text) = match event {
        ResponseEvent::Thinking(s) => (EventType::System, s.clone()),
        ResponseEvent::Text(s) => (EventType::Message, s.clone()),
        ResponseEvent::ToolUse { id, name, input_json } => (
            EventType::ToolCall,
            serde_json::json!({"id": id, "name": name, "input_json": input_json}).to_string(),
        ),
        ResponseEvent::ToolResult { id, output, is_error } => (
            EventType::ToolResult,
            serde_json::json!({"id": id, "output": output, "is_error": is_error}).to_string(),
        ),
        ResponseEvent::Done { full_response } => {
            (EventType::Message, full_response.clone().unwrap_or_default())
        }
        ResponseEvent::Error(msg) => (EventType::Error, msg.clone()),
        ResponseEvent::Canceled { reason } => (EventType::Error, reason.clone()),
        _ => return,
    };
    let live = LedgerEvent {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_key: conversation_key.to_string(),
        direction: EventDirection::OutboundFromAgent,
        author: author.to_string(),
        timestamp: chrono::Utc::now(),
        event_type,
        text: Some(text),
        raw_transport: None,
        raw_payload_ref: None,
        actor_principal_id: None,
        actor_member_id: None,
    };
    broadcaster.publish(conversation_key, live, exclude_subscription_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AgentConnection, InboundFrame, OutboundFrame, RegistrationMetadata};
    use muxgate_core::ledger::sqlite::SqliteLedger;
    use muxgate_core::ToolRouter;

    fn service() -> (ConversationService, AgentManager, Arc<dyn LedgerStore>) {
        service_with_grace(Duration::from_secs(2))
    }

    fn service_with_grace(cancel_grace: Duration) -> (ConversationService, AgentManager, Arc<dyn LedgerStore>) {
        let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let agents = AgentManager::new();
        let broadcaster = Arc::new(Broadcaster::new());
        let dedup = Arc::new(DedupCache::new(64, Duration::from_secs(600)));
        let svc = ConversationService::new(ledger.clone(), agents.clone(), broadcaster, dedup, cancel_grace);
        (svc, agents, ledger)
    }

    fn register_agent(agents: &AgentManager, agent_id: &str) -> mpsc::Receiver<OutboundFrame> {
        register_agent_with_features(agents, agent_id, vec![])
    }

    fn register_agent_with_features(
        agents: &AgentManager,
        agent_id: &str,
        protocol_features: Vec<String>,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (conn, outbound) = AgentConnection::new(
            agent_id.to_string(),
            "test agent".to_string(),
            vec![],
            protocol_features,
            RegistrationMetadata::default(),
            "principal-1".to_string(),
        );
        agents.register(conn).unwrap();
        outbound
    }

    async fn drive_agent_replies(agents: AgentManager, agent_id: String, mut outbound: mpsc::Receiver<OutboundFrame>, replies: Vec<ResponseEvent>) {
        let request_id = match outbound.recv().await.unwrap() {
            OutboundFrame::SendMessage { request_id, .. } => request_id,
            other => panic!("unexpected frame: {other:?}"),
        };
        let conn = agents.get(&agent_id).unwrap();
        let router = ToolRouter::new();
        for event in replies {
            conn.handle_inbound(InboundFrame::MessageResponse { request_id: request_id.clone(), event }, &router, &[])
                .await;
        }
    }

    #[tokio::test]
    async fn s1_direct_send_streams_events_and_coalesces_ledger_text() {
        let (svc, agents, ledger) = service();
        let outbound = register_agent(&agents, "A");
        tokio::spawn(drive_agent_replies(
            agents,
            "A".to_string(),
            outbound,
            vec![
                ResponseEvent::Thinking("...".into()),
                ResponseEvent::Text("hello".into()),
                ResponseEvent::Text(" world".into()),
                ResponseEvent::Done { full_response: None },
            ],
        ));

        let outcome = svc
            .send(SendRequest {
                conversation_key: "A".into(),
                content: "hi".into(),
                sender: "u".into(),
                idempotency_key: Some("k1".into()),
                attachments: vec![],
                originator_subscription_id: None,
            })
            .await
            .unwrap();

        let SendOutcome::Dispatched { events: mut rx, .. } = outcome else { panic!("expected dispatch") };
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Thinking(_)));
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Text(_)));
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Text(_)));
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::Done { .. }));
        assert!(rx.recv().await.is_none());

        let page = ledger.get_events_by_conversation("A", EventFilter::default()).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].text.as_deref(), Some("hi"));
        assert_eq!(page.events[1].author, "agent:A");
        assert_eq!(page.events[1].text.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn s2_duplicate_idempotency_key_returns_duplicate_without_dispatch() {
        let (svc, agents, ledger) = service();
        let outbound = register_agent(&agents, "A");
        tokio::spawn(drive_agent_replies(
            agents,
            "A".to_string(),
            outbound,
            vec![ResponseEvent::Done { full_response: None }],
        ));

        let req = || SendRequest {
            conversation_key: "A".into(),
            content: "hi".into(),
            sender: "u".into(),
            idempotency_key: Some("k1".into()),
            attachments: vec![],
            originator_subscription_id: None,
        };
        let first = svc.send(req()).await.unwrap();
        assert!(matches!(first, SendOutcome::Dispatched { .. }));
        if let SendOutcome::Dispatched { mut events, .. } = first {
            let _ = events.recv().await;
        }

        let second = svc.send(req()).await.unwrap();
        assert!(matches!(second, SendOutcome::Duplicate));

        let page = ledger.get_events_by_conversation("A", EventFilter::default()).await.unwrap();
        assert_eq!(page.events.len(), 1, "no additional inbound event for the duplicate");
    }

    #[tokio::test]
    async fn s3_tool_use_persists_tool_call_and_tool_result_individually() {
        let (svc, agents, ledger) = service();
        let outbound = register_agent(&agents, "A");
        tokio::spawn(drive_agent_replies(
            agents,
            "A".to_string(),
            outbound,
            vec![
                ResponseEvent::ToolUse { id: "t1".into(), name: "read".into(), input_json: "{\"p\":\"/x\"}".into() },
                ResponseEvent::ToolState { id: "t1".into(), state: muxgate_core::ToolState::Running, detail: None },
                ResponseEvent::ToolResult { id: "t1".into(), output: "abc".into(), is_error: false },
                ResponseEvent::Text("done".into()),
                ResponseEvent::Done { full_response: None },
            ],
        ));

        let outcome = svc
            .send(SendRequest {
                conversation_key: "A".into(),
                content: "hi".into(),
                sender: "u".into(),
                idempotency_key: None,
                attachments: vec![],
                originator_subscription_id: None,
            })
            .await
            .unwrap();
        let SendOutcome::Dispatched { mut events, .. } = outcome else { panic!("expected dispatch") };
        while events.recv().await.is_some() {}

        let page = ledger.get_events_by_conversation("A", EventFilter::default()).await.unwrap();
        // inbound, tool_call, tool_result, outbound message — tool_state is not persisted.
        assert_eq!(page.events.len(), 4);
        assert_eq!(page.events[1].event_type, EventType::ToolCall);
        assert_eq!(page.events[2].event_type, EventType::ToolResult);
        assert_eq!(page.events[3].text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn s4_caller_disconnect_sends_exactly_one_cancel_request_and_force_closes_after_grace() {
        let (svc, agents, ledger) = service_with_grace(Duration::from_millis(20));
        let mut outbound = register_agent_with_features(&agents, "A", vec!["cancellation".to_string()]);

        let outcome = svc
            .send(SendRequest {
                conversation_key: "A".into(),
                content: "hi".into(),
                sender: "u".into(),
                idempotency_key: None,
                attachments: vec![],
                originator_subscription_id: None,
            })
            .await
            .unwrap();
        let SendOutcome::Dispatched { assigned_id: _, events } = outcome else { panic!("expected dispatch") };

        let request_id = match outbound.recv().await.unwrap() {
            OutboundFrame::SendMessage { request_id, .. } => request_id,
            other => panic!("unexpected frame: {other:?}"),
        };
        let conn = agents.get("A").unwrap();
        conn.handle_inbound(
            InboundFrame::MessageResponse { request_id: request_id.clone(), event: ResponseEvent::Text("hello".into()) },
            &ToolRouter::new(),
            &[],
        )
        .await;

        // Simulate an SSE client disconnect: drop the caller's receive handle
        // without ever observing a terminal event.
        drop(events);

        assert!(matches!(outbound.recv().await.unwrap(), OutboundFrame::CancelRequest { .. }));
        // No second CancelRequest is ever sent for this request.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(outbound.try_recv().is_err());

        let page = ledger.get_events_by_conversation("A", EventFilter::default()).await.unwrap();
        assert_eq!(page.events[0].text.as_deref(), Some("hi"));
        assert_eq!(page.events[1].text.as_deref(), Some("hello"), "partial text persisted before cancellation");
        assert_eq!(page.events[2].event_type, EventType::Error);
    }

    #[tokio::test]
    async fn record_first_persists_inbound_even_when_agent_is_not_registered() {
        let (svc, _agents, ledger) = service();
        let err = svc
            .send(SendRequest {
                conversation_key: "Z".into(),
                content: "x".into(),
                sender: "u".into(),
                idempotency_key: Some("kZ".into()),
                attachments: vec![],
                originator_subscription_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));

        let page = ledger.get_events_by_conversation("Z", EventFilter::default()).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].text.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn empty_content_is_rejected_before_any_ledger_write() {
        let (svc, _agents, ledger) = service();
        let err = svc
            .send(SendRequest {
                conversation_key: "A".into(),
                content: "   ".into(),
                sender: "u".into(),
                idempotency_key: None,
                attachments: vec![],
                originator_subscription_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        let page = ledger.get_events_by_conversation("A", EventFilter::default()).await.unwrap();
        assert!(page.events.is_empty());
    }
}
