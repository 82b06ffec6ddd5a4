//! Ergonomic builder tying [`TransportConfig`] and [`QueryConfig`] together,
//! modeled on the client builder the assistant-CLI wrapper this core grew
//! out of once exposed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::process::StderrCallback;
use crate::query::{QueryConfig, QueryHandler, DEFAULT_CONTROL_TIMEOUT};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::transport::{SubprocessTransport, TransportConfig};
use crate::types::{HooksConfig, McpServerHandle, McpServers, PermissionCallback};

/// Fluent builder for a [`QueryHandler`] and the [`SubprocessTransport`] it
/// drives.
#[derive(Clone)]
pub struct SessionBuilder {
    binary: Option<PathBuf>,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    streaming: bool,
    stderr_callback: Option<StderrCallback>,
    minimum_version: Option<semver::Version>,
    max_buffer_bytes: usize,
    queue_capacity: usize,
    control_timeout: Duration,
    stream_close_timeout: Option<Duration>,
    permission_callback: Option<PermissionCallback>,
    hooks: Option<HooksConfig>,
    mcp_servers: McpServers,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            streaming: true,
            stderr_callback: None,
            minimum_version: None,
            max_buffer_bytes: crate::frame::DEFAULT_MAX_BUFFER_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            stream_close_timeout: None,
            permission_callback: None,
            hooks: None,
            mcp_servers: McpServers::new(),
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// When false, stdin is closed immediately after spawn: a single
    /// one-shot turn rather than an interactive session (spec §4.2).
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn stderr_callback(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.stderr_callback = Some(Arc::new(callback));
        self
    }

    pub fn minimum_version(mut self, version: semver::Version) -> Self {
        self.minimum_version = Some(version);
        self
    }

    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Overrides `CLAUDE_CODE_STREAM_CLOSE_TIMEOUT` for this handler. Left
    /// unset, the env var (default 60s) is resolved at handler construction.
    pub fn stream_close_timeout(mut self, timeout: Duration) -> Self {
        self.stream_close_timeout = Some(timeout);
        self
    }

    pub fn permission_callback(mut self, callback: PermissionCallback) -> Self {
        self.permission_callback = Some(callback);
        self
    }

    pub fn hooks(mut self, hooks: HooksConfig) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn mcp_server(mut self, name: impl Into<String>, server: Arc<dyn McpServerHandle>) -> Self {
        self.mcp_servers.insert(name.into(), server);
        self
    }

    /// Builds the transport and query handler. Does not connect the
    /// process; call [`QueryHandler::start`] or [`QueryHandler::initialize`]
    /// to do that.
    pub fn build(self) -> (Arc<SubprocessTransport>, QueryHandler, Option<HooksConfig>) {
        let binary = self.binary.unwrap_or_else(|| PathBuf::from("claude"));
        let mut env = self.env;
        env.entry("DISABLE_AUTOUPDATER".to_string())
            .or_insert_with(|| "1".to_string());

        let mut transport_config = TransportConfig::new(binary, env!("CARGO_PKG_VERSION"));
        transport_config.args = self.args;
        transport_config.env = env;
        transport_config.working_dir = self.working_dir;
        transport_config.stderr_callback = self.stderr_callback;
        transport_config.streaming = self.streaming;
        transport_config.minimum_version = self.minimum_version;
        transport_config.max_buffer_bytes = self.max_buffer_bytes;
        transport_config.queue_capacity = self.queue_capacity;

        let transport = Arc::new(SubprocessTransport::new(transport_config));

        let query_config = QueryConfig {
            streaming: self.streaming,
            permission_callback: self.permission_callback,
            mcp_servers: self.mcp_servers,
            initialize_timeout: self.control_timeout,
            queue_capacity: self.queue_capacity,
            stream_close_timeout: self.stream_close_timeout,
        };
        let handler = QueryHandler::new(transport.clone(), query_config);

        (transport, handler, self.hooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_produces_a_disconnected_transport() {
        let (transport, _handler, _hooks) = SessionBuilder::new().binary("claude").build();
        assert!(!transport.is_ready());
    }
}
