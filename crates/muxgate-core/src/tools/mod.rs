// SPDX-License-Identifier: Apache-2.0
//! Tool-call router: dispatches tool invocations from agents to in-process
//! providers ("packs"), with capability-based authorization and per-tool
//! timeouts.

pub mod registry;

pub use registry::ToolRouter;

use async_trait::async_trait;
use serde_json::Value;

/// Declares a set of callable tools. One pack may back several tool names.
#[derive(Debug, Clone)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    /// A tool is invocable only if the caller's capability set is a
    /// superset of this list.
    pub required_capabilities: Vec<String>,
    pub timeout_secs: u64,
}

/// An in-process module supplying one callable tool to agents.
///
/// A single provider may receive concurrent invocations; it is the
/// provider's own responsibility to be thread-safe. The router does not
/// serialize calls to a provider.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn manifest(&self) -> ToolManifest;

    /// Execute the tool. Errors are returned as a plain message string —
    /// the router wraps them into the gateway's error taxonomy.
    async fn invoke(&self, input: Value) -> Result<Value, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    NotFound,
    Forbidden,
}
