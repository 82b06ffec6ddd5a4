//! Shared wire-adjacent types.
//!
//! The core treats application-level message/hook/permission shapes as
//! opaque JSON (spec §1, §3) — it only needs to read the `type`/`subtype`
//! discriminators to route records. Concrete typed payloads are an external
//! concern left to the embedding application.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

/// One decoded line of the wire protocol: a JSON object tagged by `type`.
pub type Record = Value;

pub(crate) fn record_type(record: &Record) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Context passed alongside a `can_use_tool` callback invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    pub suggestions: Vec<Value>,
}

/// Context passed alongside a `hook_callback` invocation.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub tool_use_id: Option<String>,
}

/// Application-provided tool permission decision callback. Takes the tool
/// name and input and returns the opaque JSON decision the spec passes back
/// to the peer unmodified (§4.7).
pub type PermissionCallback =
    Arc<dyn Fn(String, Value, ToolPermissionContext) -> BoxFuture<'static, Value> + Send + Sync>;

/// Application-provided hook callback, referenced across the protocol by a
/// stable id assigned at initialize time (§4.5).
pub type HookCallback =
    Arc<dyn Fn(Value, HookContext) -> BoxFuture<'static, Value> + Send + Sync>;

/// One matcher entry for a single hook event, prior to callback-id
/// assignment.
#[derive(Clone)]
pub struct HookMatcherConfig {
    pub matcher: Option<String>,
    pub timeout: Option<u64>,
    pub hooks: Vec<HookCallback>,
}

/// Hook configuration supplied to `initialize`, keyed by event name. The
/// concrete `HookEvent` enum is an application-level type (spec §1); the
/// core only needs the wire name.
pub type HooksConfig = HashMap<String, Vec<HookMatcherConfig>>;

/// In-process tool server handle for `mcp_message` requests (spec §1, §4.7).
pub trait McpServerHandle: Send + Sync {
    fn handle_message(&self, message: Value) -> BoxFuture<'static, Result<Value, String>>;
}

pub type McpServers = HashMap<String, Arc<dyn McpServerHandle>>;

/// Permission mode accepted by `set_permission_mode` (spec §6). Kept as a
/// thin wire-name wrapper rather than a concrete policy enum, consistent
/// with the core's opaque treatment of application-level types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMode(pub String);

impl PermissionMode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PermissionMode {
    fn from(value: &str) -> Self {
        PermissionMode(value.to_string())
    }
}

impl From<String> for PermissionMode {
    fn from(value: String) -> Self {
        PermissionMode(value)
    }
}
