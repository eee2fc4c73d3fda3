// SPDX-License-Identifier: Apache-2.0
//! SSE framing for `/api/send`: `event: <type>\ndata: <json>\n\n`, headers
//! `Content-Type: text/event-stream` and `Cache-Control: no-cache`, flushed
//! after each event. `done`, `error`, and `canceled` terminate the stream.

use axum::response::sse::Event;
use serde_json::json;

use crate::connection::ResponseEvent;

/// The event emitted before the agent has produced anything, marking the
/// stream as accepted and under way.
pub fn started_event(assigned_id: &str) -> Event {
    Event::default().event("started").json_data(json!({ "assigned_id": assigned_id })).expect("started event always serializes")
}

/// Convert one [`ResponseEvent`] into its SSE wire representation. Returns
/// `None` for variants with no HTTP-surface representation (there are
/// none today, but this keeps the mapping total as the vocabulary grows).
pub fn to_sse_event(event: &ResponseEvent) -> Option<Event> {
    let (name, data) = match event {
        ResponseEvent::Thinking(s) => ("thinking", json!({ "text": s })),
        ResponseEvent::Text(s) => ("text", json!({ "text": s })),
        ResponseEvent::ToolUse { id, name, input_json } => (
            "tool_use",
            json!({ "id": id, "name": name, "input": parse_or_raw(input_json) }),
        ),
        ResponseEvent::ToolResult { id, output, is_error } => {
            ("tool_result", json!({ "id": id, "output": output, "is_error": is_error }))
        }
        ResponseEvent::Done { full_response } => ("done", json!({ "full_response": full_response })),
        ResponseEvent::Error(msg) => ("error", json!({ "message": msg })),
        ResponseEvent::File { filename, mime_type, data } => (
            "file",
            json!({
                "filename": filename,
                "mime_type": mime_type,
                "data": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, data),
            }),
        ),
        ResponseEvent::ToolApprovalRequest { id, name, input_json } => (
            "tool_approval",
            json!({ "id": id, "name": name, "input": parse_or_raw(input_json) }),
        ),
        ResponseEvent::SessionInit { session_id } => ("session_init", json!({ "session_id": session_id })),
        ResponseEvent::SessionOrphaned { reason } => ("session_orphaned", json!({ "reason": reason })),
        ResponseEvent::Usage {
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
            thinking_tokens,
        } => (
            "usage",
            json!({
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "cache_read_tokens": cache_read_tokens,
                "cache_write_tokens": cache_write_tokens,
                "thinking_tokens": thinking_tokens,
            }),
        ),
        ResponseEvent::ToolState { id, state, detail } => {
            ("tool_state", json!({ "id": id, "state": state, "detail": detail }))
        }
        ResponseEvent::Canceled { reason } => ("canceled", json!({ "reason": reason })),
    };
    Some(Event::default().event(name).json_data(data).expect("sse event always serializes"))
}

fn parse_or_raw(input_json: &str) -> serde_json::Value {
    serde_json::from_str(input_json).unwrap_or_else(|_| json!(input_json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_event_carries_text_field() {
        let ev = to_sse_event(&ResponseEvent::Text("hi".into())).unwrap();
        let rendered = format!("{ev:?}");
        assert!(rendered.contains("text"));
    }

    #[test]
    fn tool_state_event_serializes_state_enum() {
        let ev = to_sse_event(&ResponseEvent::ToolState {
            id: "t1".into(),
            state: muxgate_core::ToolState::Running,
            detail: None,
        });
        assert!(ev.is_some());
    }
}
