// SPDX-License-Identifier: Apache-2.0
//! The narrow interface the core consumes from a ledger implementation.
//!
//! Any store — embedded SQL, an in-memory map for tests, a remote service —
//! is acceptable as long as it honors: append-only with unique-id failure on
//! collision, and read-your-writes (a successful `save_event` followed by a
//! query for that conversation observes the new event).

pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ChannelBinding, LedgerEvent, Principal, RoleAssignment};

/// Filter applied to a conversation history query.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub since_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub until_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub since_event_id: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// Opaque cursor + page of results for `get_events_by_conversation`.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrincipalFilter {
    pub kind: Option<crate::model::PrincipalKind>,
    pub status: Option<crate::model::PrincipalStatus>,
}

/// Append-only event log keyed by conversation; also principals, bindings,
/// and the audit log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append an event. `id` collisions fail with [`crate::error::GatewayError::Conflict`].
    async fn save_event(&self, event: LedgerEvent) -> Result<()>;

    /// Ordered by `(timestamp ascending, id ascending)`.
    async fn get_events_by_conversation(
        &self,
        conversation_key: &str,
        filter: EventFilter,
    ) -> Result<EventPage>;

    /// Compatibility query for legacy thread identifiers — a thread id is
    /// treated as a conversation key alias with no filter beyond a limit.
    async fn get_events_by_thread(&self, thread_id: &str, limit: usize) -> Result<Vec<LedgerEvent>>;

    async fn get_principal(&self, id: &str) -> Result<Option<Principal>>;
    async fn get_principal_by_pubkey(&self, fingerprint: &str) -> Result<Option<Principal>>;
    async fn create_principal(&self, principal: Principal) -> Result<()>;
    async fn update_principal_status(
        &self,
        id: &str,
        status: crate::model::PrincipalStatus,
    ) -> Result<()>;
    async fn touch_principal_last_seen(&self, id: &str) -> Result<()>;
    async fn count_principals(&self, filter: PrincipalFilter) -> Result<u64>;
    async fn delete_principal(&self, id: &str) -> Result<()>;

    async fn add_role(&self, assignment: RoleAssignment) -> Result<()>;
    async fn list_roles(&self, subject_id: &str) -> Result<Vec<RoleAssignment>>;

    async fn create_binding(&self, binding: ChannelBinding) -> Result<()>;
    async fn get_binding(
        &self,
        frontend: &str,
        external_channel_id: &str,
    ) -> Result<Option<ChannelBinding>>;
    async fn list_bindings(&self) -> Result<Vec<ChannelBinding>>;
    async fn delete_binding(&self, frontend: &str, external_channel_id: &str) -> Result<()>;

    async fn append_audit(&self, actor_principal_id: &str, action: &str, detail: &str)
        -> Result<()>;
}
