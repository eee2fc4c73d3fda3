// SPDX-License-Identifier: Apache-2.0
//! Gateway-agnostic core: domain model, ledger, dedup cache, broadcaster,
//! tool router, and auth gate. The gateway crate wires these into the
//! Agent Stream RPC and HTTP surfaces.

pub mod auth;
pub mod broadcaster;
pub mod dedup;
pub mod error;
pub mod ledger;
pub mod model;
pub mod tools;

pub use auth::{AuthGate, AutoRegisterPolicy, Credential, SignedChallenge};
pub use broadcaster::{Broadcaster, Subscription};
pub use dedup::DedupCache;
pub use error::{GatewayError, Result};
pub use ledger::{EventFilter, EventPage, LedgerStore, PrincipalFilter};
pub use model::{
    ChannelBinding, EventDirection, EventType, LedgerEvent, Principal, PrincipalKind,
    PrincipalStatus, Role, RoleAssignment, ToolState,
};
pub use tools::{ResolveError, ToolManifest, ToolProvider, ToolRouter};
