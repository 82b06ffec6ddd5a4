use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cli_bridge_core::types::{BoxFuture, HookContext, HookMatcherConfig, ToolPermissionContext};
use cli_bridge_core::{QueryConfig, QueryHandler, SubprocessTransport, TransportConfig};
use serde_json::{json, Value};

fn fixture(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .display()
        .to_string()
}

fn sh_transport(script: &str, extra_args: Vec<String>) -> TransportConfig {
    std::env::set_var("CLI_VERSION_PROBE_SKIP", "1");
    let mut config = TransportConfig::new("sh", "0.0.0-test");
    config.args = std::iter::once(fixture(script)).chain(extra_args).collect();
    config
}

#[tokio::test]
async fn initialize_handshake_completes_and_first_result_fires() {
    let transport = Arc::new(SubprocessTransport::new(sh_transport(
        "echo_initialize.sh",
        vec![],
    )));
    let handler = QueryHandler::new(transport, QueryConfig::default());

    let response = handler.initialize(None).await.unwrap().unwrap();
    assert_eq!(response["initialized"], true);

    tokio::time::timeout(Duration::from_secs(2), handler.wait_for_first_result())
        .await
        .expect("first result should latch promptly");

    let consumer = handler.messages();
    let record = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("should not time out")
        .unwrap()
        .expect("should yield a record, not end-of-stream");
    assert_eq!(record["type"], "result");

    handler.close().await;
}

#[tokio::test]
async fn can_use_tool_round_trips_through_the_permission_callback() {
    let out_file = tempfile::NamedTempFile::new().unwrap();
    let out_path = out_file.path().to_path_buf();

    let transport = Arc::new(SubprocessTransport::new(sh_transport(
        "can_use_tool.sh",
        vec![out_path.display().to_string()],
    )));

    let callback: cli_bridge_core::PermissionCallback = Arc::new(
        move |tool_name: String, _input: Value, _ctx: ToolPermissionContext| -> BoxFuture<'static, Value> {
            Box::pin(async move {
                assert_eq!(tool_name, "Bash");
                json!({"behavior": "allow"})
            })
        },
    );

    let mut config = QueryConfig::default();
    config.permission_callback = Some(callback);
    let handler = QueryHandler::new(transport, config);

    handler.initialize(None).await.unwrap();

    let consumer = handler.messages();
    let record = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record["type"], "result");

    let written = tokio::fs::read_to_string(&out_path).await.unwrap();
    assert!(written.contains("\"allow\""), "unexpected payload: {written}");

    handler.close().await;
}

#[tokio::test]
async fn oversize_line_surfaces_as_buffer_overflow_error() {
    let mut config = sh_transport("oversize_line.sh", vec![]);
    config.max_buffer_bytes = 64;
    let transport = SubprocessTransport::new(config);
    transport.connect().await.unwrap();
    let consumer = transport.read_records().unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, cli_bridge_core::SdkError::BufferOverflow { limit: 64 }),
        "unexpected error: {err:?}"
    );

    transport.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn close_force_kills_a_process_that_ignores_sigterm() {
    let config = sh_transport("ignore_sigterm.sh", vec![]);
    let transport = SubprocessTransport::new(config);
    transport.connect().await.unwrap();
    let _consumer = transport.read_records().unwrap();

    let start = std::time::Instant::now();
    transport.close().await;
    assert!(
        start.elapsed() < Duration::from_secs(9),
        "close() should force-kill well within the grace + force-kill windows"
    );
}

#[tokio::test]
async fn stream_input_waits_for_first_result_before_closing_stdin_when_hooks_configured() {
    let transport = Arc::new(SubprocessTransport::new(sh_transport(
        "stream_input_then_result.sh",
        vec![],
    )));
    let handler = QueryHandler::new(transport, QueryConfig::default());

    let callback: cli_bridge_core::types::HookCallback =
        Arc::new(move |_input: Value, _ctx: HookContext| -> BoxFuture<'static, Value> {
            Box::pin(async move { json!({}) })
        });
    let mut hooks = HashMap::new();
    hooks.insert(
        "PreToolUse".to_string(),
        vec![HookMatcherConfig {
            matcher: None,
            timeout: None,
            hooks: vec![callback],
        }],
    );

    handler.initialize(Some(hooks)).await.unwrap();

    handler
        .stream_input(vec![json!({"type": "user", "message": "hi"})])
        .await
        .unwrap();

    // stream_input only returns once the first-result event has latched (or
    // the stream-close timeout elapses); confirm it already fired.
    tokio::time::timeout(Duration::from_millis(10), handler.wait_for_first_result())
        .await
        .expect("first result should already be latched by the time stream_input returns");

    handler.close().await;
}

#[tokio::test]
async fn non_streaming_handler_refuses_control_requests() {
    let transport = Arc::new(SubprocessTransport::new(sh_transport(
        "echo_initialize.sh",
        vec![],
    )));
    let mut config = QueryConfig::default();
    config.streaming = false;
    let handler = QueryHandler::new(transport, config);

    let initialized = handler.initialize(None).await.unwrap();
    assert!(initialized.is_none());
    assert!(handler.interrupt().await.is_err());
}

#[tokio::test]
async fn missing_permission_callback_is_reported_as_a_control_error() {
    let out_file = tempfile::NamedTempFile::new().unwrap();
    let out_path = out_file.path().to_path_buf();

    let transport = Arc::new(SubprocessTransport::new(sh_transport(
        "can_use_tool.sh",
        vec![out_path.display().to_string()],
    )));
    let handler = QueryHandler::new(transport, QueryConfig::default());
    handler.initialize(None).await.unwrap();

    let consumer = handler.messages();
    tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap();

    let written = tokio::fs::read_to_string(&out_path).await.unwrap();
    assert!(
        written.contains("\"error\""),
        "expected an error control_response, got: {written}"
    );
    assert!(written.contains("canUseTool callback is not provided"));

    handler.close().await;
}
