// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};

use super::{ResolveError, ToolManifest, ToolProvider};

struct Registered {
    manifest: ToolManifest,
    provider: Arc<dyn ToolProvider>,
}

/// Holds registered tool packs and performs capability-checked dispatch.
pub struct ToolRouter {
    tools: HashMap<String, Registered>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Declare a tool backed by `provider`.
    pub fn register_pack(&mut self, provider: Arc<dyn ToolProvider>) {
        let manifest = provider.manifest();
        self.tools.insert(manifest.name.clone(), Registered { manifest, provider });
    }

    /// A tool is invocable only if `caller_capabilities` is a superset of
    /// the tool's required capabilities.
    pub fn resolve_tool(
        &self,
        name: &str,
        caller_capabilities: &[String],
    ) -> std::result::Result<Arc<dyn ToolProvider>, ResolveError> {
        let Some(reg) = self.tools.get(name) else {
            return Err(ResolveError::NotFound);
        };
        let has_all = reg
            .manifest
            .required_capabilities
            .iter()
            .all(|req| caller_capabilities.iter().any(|c| c == req));
        if !has_all {
            return Err(ResolveError::Forbidden);
        }
        Ok(reg.provider.clone())
    }

    pub fn manifest(&self, name: &str) -> Option<ToolManifest> {
        self.tools.get(name).map(|r| r.manifest.clone())
    }

    pub fn manifests_for(&self, caller_capabilities: &[String]) -> Vec<ToolManifest> {
        let mut out: Vec<ToolManifest> = self
            .tools
            .values()
            .filter(|r| {
                r.manifest
                    .required_capabilities
                    .iter()
                    .all(|req| caller_capabilities.iter().any(|c| c == req))
            })
            .map(|r| r.manifest.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a tool, bounded by its declared timeout and an optional
    /// external cancellation signal — whichever comes first.
    pub async fn invoke(
        &self,
        tool_name: &str,
        input: Value,
        caller_capabilities: &[String],
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<Value> {
        let provider = match self.resolve_tool(tool_name, caller_capabilities) {
            Ok(p) => p,
            Err(ResolveError::NotFound) => {
                return Err(GatewayError::NotFound(format!("tool {tool_name}")))
            }
            Err(ResolveError::Forbidden) => {
                return Err(GatewayError::Forbidden(format!(
                    "caller lacks required capabilities for tool {tool_name}"
                )))
            }
        };
        let timeout_secs = self
            .manifest(tool_name)
            .map(|m| m.timeout_secs)
            .unwrap_or(30);

        let invocation = provider.invoke(input);
        let timeout = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(invocation);
        tokio::pin!(timeout);

        match cancel {
            Some(mut cancel_rx) => {
                tokio::select! {
                    result = &mut invocation => {
                        result.map_err(GatewayError::Internal)
                    }
                    _ = &mut timeout => {
                        Err(GatewayError::Timeout(format!("tool {tool_name} timed out")))
                    }
                    _ = &mut cancel_rx => {
                        Err(GatewayError::Canceled)
                    }
                }
            }
            None => {
                tokio::select! {
                    result = &mut invocation => {
                        result.map_err(GatewayError::Internal)
                    }
                    _ = &mut timeout => {
                        Err(GatewayError::Timeout(format!("tool {tool_name} timed out")))
                    }
                }
            }
        }
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct EchoTool;

    #[async_trait]
    impl ToolProvider for EchoTool {
        fn manifest(&self) -> ToolManifest {
            ToolManifest {
                name: "echo".into(),
                description: "echoes input".into(),
                parameters_schema: json!({"type": "object"}),
                required_capabilities: vec![],
                timeout_secs: 5,
            }
        }
        async fn invoke(&self, input: Value) -> std::result::Result<Value, String> {
            Ok(input)
        }
    }

    struct GuardedTool;

    #[async_trait]
    impl ToolProvider for GuardedTool {
        fn manifest(&self) -> ToolManifest {
            ToolManifest {
                name: "guarded".into(),
                description: "requires capability".into(),
                parameters_schema: json!({"type": "object"}),
                required_capabilities: vec!["admin".into()],
                timeout_secs: 5,
            }
        }
        async fn invoke(&self, _input: Value) -> std::result::Result<Value, String> {
            Ok(json!({"ok": true}))
        }
    }

    struct SlowTool {
        timeout_secs: u64,
    }

    #[async_trait]
    impl ToolProvider for SlowTool {
        fn manifest(&self) -> ToolManifest {
            ToolManifest {
                name: "slow".into(),
                description: "sleeps".into(),
                parameters_schema: json!({"type": "object"}),
                required_capabilities: vec![],
                timeout_secs: self.timeout_secs,
            }
        }
        async fn invoke(&self, _input: Value) -> std::result::Result<Value, String> {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[test]
    fn resolve_unknown_tool_is_not_found() {
        let router = ToolRouter::new();
        assert_eq!(router.resolve_tool("nope", &[]), Err(ResolveError::NotFound));
    }

    #[test]
    fn resolve_without_capability_is_forbidden() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(GuardedTool));
        assert_eq!(
            router.resolve_tool("guarded", &[]),
            Err(ResolveError::Forbidden)
        );
    }

    #[test]
    fn resolve_with_capability_succeeds() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(GuardedTool));
        assert!(router
            .resolve_tool("guarded", &["admin".to_string()])
            .is_ok());
    }

    #[tokio::test]
    async fn invoke_known_tool_returns_output() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(EchoTool));
        let out = router
            .invoke("echo", json!({"x": 1}), &[], None)
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_not_found_error() {
        let router = ToolRouter::new();
        let err = router.invoke("nope", Value::Null, &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn invoke_forbidden_tool_is_forbidden_error() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(GuardedTool));
        let err = router
            .invoke("guarded", Value::Null, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(SlowTool { timeout_secs: 0 }));
        let err = router.invoke("slow", Value::Null, &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    #[tokio::test]
    async fn invoke_canceled_by_external_signal() {
        let mut router = ToolRouter::new();
        router.register_pack(Arc::new(SlowTool { timeout_secs: 3600 }));
        let (tx, rx) = oneshot::channel();
        let router = Arc::new(router);
        let router2 = router.clone();
        let handle = tokio::spawn(async move {
            router2.invoke("slow", Value::Null, &[], Some(rx)).await
        });
        tx.send(()).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::Canceled));
    }
}
