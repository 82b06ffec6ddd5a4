//! Query Handler: the control-protocol engine sitting on top of the
//! transport (spec §4.4-§4.9). Owns the single reader task that classifies
//! inbound records into control responses, control requests, and data
//! messages (C6); the outbound control-request API (C7); and the
//! initialize/close lifecycle (C9).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::callbacks::CallbackRegistry;
use crate::control::{
    self, build_error_response, build_success_response, is_control_request, is_control_response,
    InboundControlRequest, InboundParseError, OutboundControlRequest,
};
use crate::error::{Result, SdkError};
use crate::pending::PendingTable;
use crate::queue::{ConsumerQueue, QueueConsumer, DEFAULT_QUEUE_CAPACITY};
use crate::transport::SubprocessTransport;
use crate::types::{HookContext, HooksConfig, McpServers, PermissionCallback, Record, ToolPermissionContext};

/// Default timeout for an outbound control request awaiting its response.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout applied to an inbound callback invocation (permission/hook/MCP).
const INBOUND_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide env var carrying a stream-close timeout override, in
/// milliseconds (spec §4.9, §6). Resolved once, at handler construction.
const STREAM_CLOSE_TIMEOUT_ENV: &str = "CLAUDE_CODE_STREAM_CLOSE_TIMEOUT";
const DEFAULT_STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

fn resolve_stream_close_timeout(override_value: Option<Duration>) -> Duration {
    if let Some(value) = override_value {
        return value;
    }
    std::env::var(STREAM_CLOSE_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_STREAM_CLOSE_TIMEOUT)
}

/// Configuration for a [`QueryHandler`].
pub struct QueryConfig {
    pub streaming: bool,
    pub permission_callback: Option<PermissionCallback>,
    pub mcp_servers: McpServers,
    pub initialize_timeout: Duration,
    pub queue_capacity: usize,
    /// Overrides `CLAUDE_CODE_STREAM_CLOSE_TIMEOUT` when set; otherwise the
    /// env var is resolved at handler construction (spec §4.9).
    pub stream_close_timeout: Option<Duration>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            permission_callback: None,
            mcp_servers: McpServers::new(),
            initialize_timeout: DEFAULT_CONTROL_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_close_timeout: None,
        }
    }
}

/// A one-shot latch observable by late subscribers: fires once, on the first
/// `result` record or on reader termination, whichever comes first.
struct FirstResultEvent {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl FirstResultEvent {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    fn latch(&self) {
        let _ = self.tx.send(true);
    }

    async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// State shared between the `QueryHandler` and its spawned reader/dispatch
/// tasks.
struct Shared {
    transport: Arc<SubprocessTransport>,
    permission_callback: Option<PermissionCallback>,
    callbacks: CallbackRegistry,
    mcp_servers: McpServers,
    pending: PendingTable,
    consumer_queue: ConsumerQueue,
    request_counter: AtomicU64,
    first_result: FirstResultEvent,
    initialized: AtomicBool,
    closed: AtomicBool,
    init_response: Mutex<Option<Value>>,
    needs_stream_wait: AtomicBool,
}

/// Control-protocol engine mediating a single assistant session.
pub struct QueryHandler {
    shared: Arc<Shared>,
    streaming: bool,
    initialize_timeout: Duration,
    stream_close_timeout: Duration,
    reader_started: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueryHandler {
    pub fn new(transport: Arc<SubprocessTransport>, config: QueryConfig) -> Self {
        let mcp_servers_configured = !config.mcp_servers.is_empty();
        let shared = Shared {
            transport,
            permission_callback: config.permission_callback,
            callbacks: CallbackRegistry::new(),
            mcp_servers: config.mcp_servers,
            pending: PendingTable::new(),
            consumer_queue: ConsumerQueue::new(config.queue_capacity),
            request_counter: AtomicU64::new(0),
            first_result: FirstResultEvent::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            init_response: Mutex::new(None),
            needs_stream_wait: AtomicBool::new(mcp_servers_configured),
        };
        Self {
            shared: Arc::new(shared),
            streaming: config.streaming,
            initialize_timeout: config.initialize_timeout,
            stream_close_timeout: resolve_stream_close_timeout(config.stream_close_timeout),
            reader_started: AtomicBool::new(false),
            reader_task: Mutex::new(None),
        }
    }

    /// Connects the transport (if not already) and starts the single reader
    /// task. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SdkError::closed());
        }
        self.shared.transport.connect().await?;
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = self.shared.transport.read_records()?;
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            reader_loop(shared, consumer).await;
        });
        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    /// A no-op returning `None` when this handler is not in streaming mode.
    /// Otherwise sends the `initialize` control request with assigned hook
    /// callback ids exactly once; a repeat call returns the cached response
    /// rather than re-registering hooks and re-sending (spec §4.9).
    pub async fn initialize(&self, hooks: Option<HooksConfig>) -> Result<Option<Value>> {
        if !self.streaming {
            return Ok(None);
        }

        self.start().await?;

        if self
            .shared
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(self.shared.init_response.lock().await.clone());
        }

        if hooks.as_ref().is_some_and(|hooks| !hooks.is_empty()) {
            self.shared.needs_stream_wait.store(true, Ordering::SeqCst);
        }
        let hooks_wire = match hooks {
            Some(hooks) => Some(self.register_hooks_and_build_wire(hooks).await),
            None => None,
        };

        match self
            .send_control(
                OutboundControlRequest::Initialize { hooks: hooks_wire },
                self.initialize_timeout,
            )
            .await
        {
            Ok(response) => {
                *self.shared.init_response.lock().await = Some(response.clone());
                Ok(Some(response))
            }
            Err(err) => {
                self.shared.initialized.store(false, Ordering::SeqCst);
                self.shared.callbacks.clear().await;
                self.shared.transport.close().await;
                Err(SdkError::other(format!("Failed to initialize: {err}")))
            }
        }
    }

    async fn register_hooks_and_build_wire(&self, hooks: HooksConfig) -> Value {
        let mut wire = serde_json::Map::new();
        for (event, matchers) in hooks {
            let mut wire_matchers = Vec::with_capacity(matchers.len());
            for matcher in matchers {
                let mut ids = Vec::with_capacity(matcher.hooks.len());
                for callback in matcher.hooks {
                    ids.push(self.shared.callbacks.register(callback).await);
                }
                wire_matchers.push(json!({
                    "matcher": matcher.matcher,
                    "timeout": matcher.timeout,
                    "hookCallbackIds": ids,
                }));
            }
            wire.insert(event, Value::Array(wire_matchers));
        }
        Value::Object(wire)
    }

    pub async fn interrupt(&self) -> Result<Value> {
        self.send_control(OutboundControlRequest::Interrupt, DEFAULT_CONTROL_TIMEOUT)
            .await
    }

    pub async fn set_model(&self, model: Option<String>) -> Result<Value> {
        self.send_control(
            OutboundControlRequest::SetModel { model },
            DEFAULT_CONTROL_TIMEOUT,
        )
        .await
    }

    pub async fn set_permission_mode(&self, mode: String) -> Result<Value> {
        self.send_control(
            OutboundControlRequest::SetPermissionMode { mode },
            DEFAULT_CONTROL_TIMEOUT,
        )
        .await
    }

    pub async fn rewind_files(&self, user_message_id: String) -> Result<Value> {
        self.send_control(
            OutboundControlRequest::RewindFiles { user_message_id },
            DEFAULT_CONTROL_TIMEOUT,
        )
        .await
    }

    pub async fn mcp_status(&self) -> Result<Value> {
        self.send_control(OutboundControlRequest::McpMessageStatus, DEFAULT_CONTROL_TIMEOUT)
            .await
    }

    /// Writes a data record (e.g. a user-turn message) straight to the
    /// transport; not part of the request/response correlation table.
    pub async fn send_message(&self, record: Record) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SdkError::closed());
        }
        self.shared.transport.write(&record.to_string()).await
    }

    /// Closes stdin; no further outbound messages are possible but pending
    /// control requests and the inbound data stream continue.
    pub async fn end_input(&self) {
        self.shared.transport.end_input().await;
    }

    /// Writes each record from `records` to the transport, then closes
    /// stdin. When hooks or in-process tool servers are configured, gives
    /// the peer a chance to finish bidirectional exchanges first: waits for
    /// the first-result event up to the stream-close timeout before calling
    /// `EndInput`. Otherwise closes stdin immediately after the last record
    /// (spec §4.9).
    pub async fn stream_input<I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        for record in records {
            self.send_message(record).await?;
        }

        if self.shared.needs_stream_wait.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(
                self.stream_close_timeout,
                self.shared.first_result.wait(),
            )
            .await;
        }

        self.end_input().await;
        Ok(())
    }

    /// Returns a handle to the classified data-record stream (C8).
    pub fn messages(&self) -> QueueConsumer {
        self.shared.consumer_queue.consumer()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether this handler was configured for an interactive (stdin stays
    /// open) session versus a single one-shot turn (spec §4.2).
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Resolves once the first `result` record has been observed, or once
    /// the reader has terminated, whichever is first.
    pub async fn wait_for_first_result(&self) {
        self.shared.first_result.wait().await;
    }

    async fn send_control(&self, payload: OutboundControlRequest, timeout: Duration) -> Result<Value> {
        if !self.streaming {
            return Err(SdkError::IllegalState(
                "control requests require a streaming session".into(),
            ));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SdkError::closed());
        }
        let request_id = self.next_request_id();
        let rx = self.shared.pending.register(request_id.clone()).await;
        let record = control::build_control_request(&request_id, &payload);

        if let Err(err) = self.shared.transport.write(&record.to_string()).await {
            self.shared.pending.forget(&request_id).await;
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SdkError::other(format!(
                "pending slot for {request_id} dropped without a response"
            ))),
            Err(_) => {
                self.shared.pending.forget(&request_id).await;
                Err(SdkError::timeout_for(payload.subtype()))
            }
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.shared.request_counter.fetch_add(1, Ordering::SeqCst);
        let random = Uuid::new_v4().simple().to_string()[..8].to_string();
        format!("req_{n}_{random}")
    }

    /// Idempotent, ordered shutdown: marks closed (rejecting new outbound
    /// requests), aborts any still-pending ones, then tears the transport
    /// down so the reader task observes end-of-stream and exits.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.transport.close().await;
        self.shared
            .pending
            .abort_all("QueryHandler is closing")
            .await;
        self.shared.callbacks.clear().await;
        if let Some(task) = self.reader_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn reader_loop(shared: Arc<Shared>, consumer: QueueConsumer) {
    let mut fatal: Option<String> = None;
    loop {
        match consumer.recv().await {
            Ok(Some(record)) => classify_and_dispatch(&shared, record).await,
            Ok(None) => break,
            Err(err) => {
                shared.pending.abort_all(err.to_string()).await;
                fatal = Some(err.to_string());
                break;
            }
        }
    }
    // Always enqueue `end` and mark the queue closed, fatal error or not, so
    // every consumer (not just the one that happens to drain the error
    // sentinel) observes termination rather than polling forever.
    if let Some(message) = fatal {
        shared.consumer_queue.push_error(message).await;
    }
    shared.consumer_queue.push_end().await;
    shared.consumer_queue.mark_closed();
    shared.first_result.latch();
}

async fn classify_and_dispatch(shared: &Arc<Shared>, record: Record) {
    if is_control_response(&record) {
        handle_control_response(shared, record).await;
        return;
    }

    if is_control_request(&record) {
        let shared = shared.clone();
        tokio::spawn(async move {
            handle_control_request(&shared, record).await;
        });
        return;
    }

    if crate::types::record_type(&record) == Some("control_cancel_request") {
        debug!("control_cancel_request received; accepted and ignored");
        return;
    }

    if crate::types::record_type(&record) == Some("result") {
        shared.first_result.latch();
    }

    shared.consumer_queue.push_data(record).await;
}

async fn handle_control_response(shared: &Shared, record: Record) {
    let Some(response) = record.get("response") else {
        warn!("control_response record missing response object; dropping");
        return;
    };
    let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
        warn!("control_response missing request_id; dropping");
        return;
    };

    let subtype = response.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype == "success" {
        let payload = response.get("response").cloned().unwrap_or(Value::Null);
        shared.pending.complete_success(request_id, payload).await;
    } else {
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown control error")
            .to_string();
        shared.pending.complete_error(request_id, message).await;
    }
}

/// Handles one inbound `control_request`, on its own spawned task (the
/// "control worker pool"): concurrent inbound requests never block each
/// other or the reader loop.
async fn handle_control_request(shared: &Arc<Shared>, record: Record) {
    let Some(request_id) = record.get("request_id").and_then(Value::as_str).map(str::to_string) else {
        warn!("inbound control_request missing request_id; dropping");
        return;
    };
    let request_value = record.get("request").cloned().unwrap_or(Value::Null);

    let response_record = match process_inbound(shared, &request_value).await {
        Ok(data) => build_success_response(&request_id, data),
        Err(message) => build_error_response(&request_id, &message),
    };

    if shared.closed.load(Ordering::SeqCst) || !shared.transport.is_ready() {
        return;
    }
    if let Err(err) = shared.transport.write(&response_record.to_string()).await {
        debug!("failed to deliver control response (transport likely closing): {err}");
    }
}

async fn process_inbound(shared: &Arc<Shared>, request_value: &Value) -> std::result::Result<Value, String> {
    let parsed = control::parse_inbound_request(request_value).map_err(|err| match err {
        InboundParseError::ProtocolViolation(subtype) => {
            format!("unexpected inbound control request subtype: {subtype}")
        }
        InboundParseError::Malformed(message) => message,
    })?;

    match parsed {
        InboundControlRequest::CanUseTool {
            tool_name,
            input,
            suggestions,
        } => {
            let Some(callback) = shared.permission_callback.clone() else {
                return Err("canUseTool callback is not provided".to_string());
            };
            let context = ToolPermissionContext { suggestions };
            let future = callback(tool_name, input, context);
            tokio::time::timeout(INBOUND_CALLBACK_TIMEOUT, future)
                .await
                .map_err(|_| "canUseTool callback timed out".to_string())
        }
        InboundControlRequest::HookCallback {
            callback_id,
            input,
            tool_use_id,
        } => {
            let Some(callback) = shared.callbacks.get(&callback_id).await else {
                return Err(format!("unknown hook callback id: {callback_id}"));
            };
            let context = HookContext { tool_use_id };
            let future = callback(input, context);
            tokio::time::timeout(INBOUND_CALLBACK_TIMEOUT, future)
                .await
                .map_err(|_| format!("hook callback {callback_id} timed out"))
        }
        InboundControlRequest::McpMessage {
            server_name,
            message,
        } => {
            let (server_name, message) = match (server_name, message) {
                (Some(name), Some(message)) => (name, message),
                _ => return Err("mcp_message missing server_name or message".to_string()),
            };
            let Some(server) = shared.mcp_servers.get(&server_name).cloned() else {
                return Err(format!("mcp server '{server_name}' is not registered"));
            };
            let future = server.handle_message(message);
            match tokio::time::timeout(INBOUND_CALLBACK_TIMEOUT, future).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(message),
                Err(_) => Err(format!("mcp server '{server_name}' timed out")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_result_event_fires_once_and_replays_to_late_waiters() {
        let event = FirstResultEvent::new();
        event.latch();
        tokio::time::timeout(Duration::from_millis(50), event.wait())
            .await
            .expect("late waiter should observe an already-fired latch");
    }

    #[tokio::test]
    async fn request_id_format_matches_spec() {
        let transport = Arc::new(SubprocessTransport::new(crate::transport::TransportConfig::new(
            "true", "0.0.0-test",
        )));
        let handler = QueryHandler::new(transport, QueryConfig::default());
        let id = handler.next_request_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[tokio::test]
    async fn non_streaming_handler_rejects_control_requests() {
        let transport = Arc::new(SubprocessTransport::new(crate::transport::TransportConfig::new(
            "true", "0.0.0-test",
        )));
        let mut config = QueryConfig::default();
        config.streaming = false;
        let handler = QueryHandler::new(transport, config);
        let err = handler
            .send_control(OutboundControlRequest::Interrupt, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::IllegalState(_)));
    }

    #[test]
    fn stream_close_timeout_resolves_from_env_and_override() {
        std::env::remove_var(STREAM_CLOSE_TIMEOUT_ENV);
        assert_eq!(resolve_stream_close_timeout(None), DEFAULT_STREAM_CLOSE_TIMEOUT);
        assert_eq!(
            resolve_stream_close_timeout(Some(Duration::from_millis(5))),
            Duration::from_millis(5)
        );
        std::env::set_var(STREAM_CLOSE_TIMEOUT_ENV, "1234");
        assert_eq!(resolve_stream_close_timeout(None), Duration::from_millis(1234));
        std::env::remove_var(STREAM_CLOSE_TIMEOUT_ENV);
    }
}
