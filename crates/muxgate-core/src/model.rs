// SPDX-License-Identifier: Apache-2.0
//! Domain types shared across the core: principals, ledger events, channel
//! bindings, and the small enums they're built from.

use serde::{Deserialize, Serialize};

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    /// 64 lowercase hex chars, unique across all principals.
    pub pubkey_fingerprint: String,
    pub display_name: String,
    pub status: PrincipalStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Client,
    Agent,
    Pack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalStatus {
    Pending,
    Approved,
    Revoked,
    Online,
    Offline,
}

impl PrincipalStatus {
    /// Whether a principal in this status may authenticate and act.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PrincipalStatus::Approved | PrincipalStatus::Online | PrincipalStatus::Offline
        )
    }

    /// Validates a status transition per the invariant in the data model:
    /// pending→approved|revoked, approved↔online↔offline, any→revoked.
    pub fn can_transition_to(&self, next: PrincipalStatus) -> bool {
        use PrincipalStatus::*;
        if next == Revoked {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Approved)
                | (Approved, Online)
                | (Approved, Offline)
                | (Online, Offline)
                | (Offline, Online)
                | (Online, Approved)
                | (Offline, Approved)
        )
    }
}

/// (subject-type, subject-id, role-name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub subject_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Leader,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

/// The atomic unit of durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: String,
    pub conversation_key: String,
    pub direction: EventDirection,
    pub author: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: EventType,
    pub text: Option<String>,
    pub raw_transport: Option<String>,
    pub raw_payload_ref: Option<String>,
    pub actor_principal_id: Option<String>,
    pub actor_member_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    InboundToAgent,
    OutboundFromAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    ToolCall,
    ToolResult,
    System,
    Error,
}

/// (frontend-name, external-channel-id) → agent-id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub frontend: String,
    pub external_channel_id: String,
    pub agent_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub working_dir_hint: Option<String>,
}

/// Lifecycle state of a tool invocation, reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    AwaitingApproval,
    Running,
    Completed,
    Failed,
    Denied,
    Timeout,
    Canceled,
}
