// SPDX-License-Identifier: Apache-2.0
//! Route handlers for the HTTP/SSE surface (§4.8).

use std::convert::Infallible;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use muxgate_core::{ChannelBinding, EventFilter, GatewayError};

use crate::connection::{Attachment, ResponseEvent};
use crate::conversation::{SendOutcome, SendRequest};
use crate::http::auth::{is_admin, AuthenticatedPrincipal};
use crate::http::sse::{started_event, to_sse_event};
use crate::http::AppState;

fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn health_ready(State(state): State<AppState>) -> Response {
    let count = state.agents.len();
    let body = Json(json!({ "ready": count > 0, "count": count }));
    if count > 0 {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

// ── Agents ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListAgentsQuery {
    workspace: Option<String>,
}

#[derive(Serialize)]
struct AgentSummary {
    id: String,
    display_name: String,
    capabilities: Vec<String>,
}

pub async fn list_agents(State(state): State<AppState>, Query(q): Query<ListAgentsQuery>) -> Response {
    let conns = match &q.workspace {
        Some(ws) => state.agents.list_by_workspace(ws),
        None => state.agents.list(),
    };
    let out: Vec<AgentSummary> = conns
        .iter()
        .map(|c| AgentSummary {
            id: c.agent_id().to_string(),
            display_name: c.display_name(),
            capabilities: c.capabilities(),
        })
        .collect();
    Json(out).into_response()
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
    since_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    until_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    since_event_id: Option<String>,
    /// Opaque `next_cursor` from a prior page; takes precedence over
    /// `since_event_id` when both are given.
    cursor: Option<String>,
}

pub async fn agent_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let filter = EventFilter {
        limit: q.limit,
        since_timestamp: q.since_timestamp,
        until_timestamp: q.until_timestamp,
        since_event_id: q.since_event_id,
        cursor: q.cursor,
    };
    match state.conversation.get_history(&id, filter).await {
        Ok(page) => Json(page.events).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Send ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendAttachment {
    filename: String,
    mime_type: String,
    /// Base64-encoded file content.
    data: String,
}

#[derive(Deserialize)]
pub struct SendBody {
    conversation_key: String,
    content: String,
    sender: String,
    idempotency_key: Option<String>,
    #[serde(default)]
    attachments: Vec<SendAttachment>,
}

pub async fn send(State(state): State<AppState>, Json(body): Json<SendBody>) -> Response {
    let mut attachments = Vec::with_capacity(body.attachments.len());
    for a in body.attachments {
        let data = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &a.data) {
            Ok(d) => d,
            Err(_) => {
                return error_response(&GatewayError::Validation("attachment data is not valid base64".into()))
            }
        };
        if data.len() > state.max_attachment_bytes {
            return error_response(&GatewayError::Validation(format!(
                "attachment {} exceeds the {}-byte limit",
                a.filename, state.max_attachment_bytes
            )));
        }
        attachments.push(Attachment { filename: a.filename, mime_type: a.mime_type, data });
    }

    let req = SendRequest {
        conversation_key: body.conversation_key,
        content: body.content,
        sender: body.sender,
        idempotency_key: body.idempotency_key,
        attachments,
        originator_subscription_id: None,
    };

    match state.conversation.send(req).await {
        Ok(SendOutcome::Duplicate) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "duplicate" }))).into_response()
        }
        Ok(SendOutcome::Dispatched { assigned_id, events }) => {
            let head = stream::once(async move { Ok::<_, Infallible>(started_event(&assigned_id)) });
            let tail = futures::stream::unfold(events, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .filter_map(|e: ResponseEvent| async move { to_sse_event(&e).map(|ev| Ok::<_, Infallible>(ev)) });
            let combined: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
                Box::pin(head.chain(tail));
            Sse::new(combined).keep_alive(KeepAlive::default()).into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ── Tool approval / questions ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ApproveBody {
    agent_id: String,
    id: String,
    approved: bool,
    #[serde(default)]
    approve_all: bool,
}

pub async fn tools_approve(State(state): State<AppState>, Json(body): Json<ApproveBody>) -> Response {
    let Some(conn) = state.agents.get(&body.agent_id) else {
        return error_response(&GatewayError::NotFound(format!("agent {}", body.agent_id)));
    };
    match conn.send_tool_approval(&body.id, body.approved, body.approve_all) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct AnswerBody {
    question_id: String,
    answer: String,
}

pub async fn questions_answer(State(state): State<AppState>, Json(body): Json<AnswerBody>) -> Response {
    match state.questions.answer(&body.question_id, body.answer) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(()) => error_response(&GatewayError::NotFound(format!("question {}", body.question_id))),
    }
}

// ── Bindings ────────────────────────────────────────────────────────────────

pub async fn list_bindings(State(state): State<AppState>) -> Response {
    match state.ledger.list_bindings().await {
        Ok(bindings) => Json(bindings).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct CreateBindingBody {
    frontend: String,
    external_channel_id: String,
    agent_id: String,
    working_dir_hint: Option<String>,
}

pub async fn create_binding(
    State(state): State<AppState>,
    Extension(AuthenticatedPrincipal(principal)): Extension<AuthenticatedPrincipal>,
    Json(body): Json<CreateBindingBody>,
) -> Response {
    if !is_admin(&state.ledger, &principal).await {
        return error_response(&GatewayError::Forbidden("admin role required to mutate bindings".into()));
    }
    if state.ledger.get_binding(&body.frontend, &body.external_channel_id).await.ok().flatten().is_some() {
        return error_response(&GatewayError::Conflict("binding already exists".into()));
    }
    let binding = ChannelBinding {
        frontend: body.frontend,
        external_channel_id: body.external_channel_id,
        agent_id: body.agent_id,
        created_at: chrono::Utc::now(),
        working_dir_hint: body.working_dir_hint,
    };
    match state.ledger.create_binding(binding.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(binding)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct DeleteBindingQuery {
    frontend: String,
    external_channel_id: String,
}

pub async fn delete_binding(
    State(state): State<AppState>,
    Extension(AuthenticatedPrincipal(principal)): Extension<AuthenticatedPrincipal>,
    Query(q): Query<DeleteBindingQuery>,
) -> Response {
    if !is_admin(&state.ledger, &principal).await {
        return error_response(&GatewayError::Forbidden("admin role required to mutate bindings".into()));
    }
    match state.ledger.delete_binding(&q.frontend, &q.external_channel_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
