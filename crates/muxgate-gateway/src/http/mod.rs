// SPDX-License-Identifier: Apache-2.0
//! The HTTP/SSE surface (§4.8): router assembly, shared state, and the
//! middleware stack (security headers, CSRF guard, bearer auth).

pub mod auth;
pub mod routes;
pub mod security;
pub mod sse;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use muxgate_core::{AuthGate, LedgerStore};

use crate::conversation::ConversationService;
use crate::manager::AgentManager;

/// Broker for the `/api/questions/answer` route: a tool pack that needs a
/// user-facing answer registers a waiter under an id; the HTTP handler
/// resolves it when the answer arrives.
#[derive(Clone, Default)]
pub struct QuestionBroker {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
}

impl QuestionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending question, returning the receiver half the caller
    /// awaits for the answer.
    pub fn ask(&self, question_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("question broker mutex poisoned").insert(question_id.to_string(), tx);
        rx
    }

    /// Deliver an answer. Returns `Err(())` if no waiter is registered under
    /// this id (already answered, expired, or never asked).
    pub fn answer(&self, question_id: &str, answer: String) -> Result<(), ()> {
        let tx = self.waiters.lock().expect("question broker mutex poisoned").remove(question_id);
        match tx {
            Some(tx) => tx.send(answer).map_err(|_| ()),
            None => Err(()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub conversation: Arc<ConversationService>,
    pub agents: AgentManager,
    pub auth: Arc<AuthGate>,
    pub ledger: Arc<dyn LedgerStore>,
    pub questions: QuestionBroker,
    pub failure_limiter: Arc<auth::FailureLimiter>,
    pub max_attachment_bytes: usize,
    pub max_body_bytes: usize,
}

/// Assemble the full router: public health routes, everything else behind
/// bearer auth, with security headers and the CSRF guard applied to all
/// responses.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(routes::health))
        .route("/health/ready", get(routes::health_ready));

    let protected = Router::new()
        .route("/api/agents", get(routes::list_agents))
        .route("/api/send", post(routes::send))
        .route("/api/agents/:id/history", get(routes::agent_history))
        .route("/api/tools/approve", post(routes::tools_approve))
        .route("/api/questions/answer", post(routes::questions_answer))
        .route(
            "/api/bindings",
            get(routes::list_bindings).post(routes::create_binding).delete(routes::delete_binding),
        )
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::bearer_auth_mw));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes))
        .layer(axum::middleware::from_fn(security::csrf_guard))
        .layer(axum::middleware::from_fn(security::security_headers))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Bind and serve the HTTP surface until `shutdown` resolves, per the
/// lifecycle orchestrator's graceful-shutdown deadline.
pub async fn serve(bind: &str, state: AppState, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let app = router(state);
    info!(%addr, "HTTP/SSE surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_broker_answers_registered_waiter() {
        let broker = QuestionBroker::new();
        let mut rx = broker.ask("q1");
        assert!(broker.answer("q1", "42".into()).is_ok());
        assert_eq!(rx.try_recv().unwrap(), "42");
    }

    #[test]
    fn question_broker_rejects_unknown_id() {
        let broker = QuestionBroker::new();
        assert!(broker.answer("ghost", "x".into()).is_err());
    }
}
