//! Wire shapes for the control protocol (spec §6): outbound control-request
//! payloads, inbound control-request parsing, and control-response framing.

use serde_json::{json, Value};

use crate::types::Record;

/// Outbound-only subtypes (spec §3). Any of these arriving *inbound* is a
/// protocol violation.
pub const OUTBOUND_ONLY_SUBTYPES: &[&str] = &[
    "initialize",
    "interrupt",
    "set_model",
    "set_permission_mode",
    "rewind_files",
    "mcp_message_status",
];

/// An outbound control-request payload the core sends to the peer.
#[derive(Debug, Clone)]
pub enum OutboundControlRequest {
    Initialize { hooks: Option<Value> },
    Interrupt,
    SetModel { model: Option<String> },
    SetPermissionMode { mode: String },
    RewindFiles { user_message_id: String },
    McpMessageStatus,
}

impl OutboundControlRequest {
    pub fn subtype(&self) -> &'static str {
        match self {
            OutboundControlRequest::Initialize { .. } => "initialize",
            OutboundControlRequest::Interrupt => "interrupt",
            OutboundControlRequest::SetModel { .. } => "set_model",
            OutboundControlRequest::SetPermissionMode { .. } => "set_permission_mode",
            OutboundControlRequest::RewindFiles { .. } => "rewind_files",
            OutboundControlRequest::McpMessageStatus => "mcp_message_status",
        }
    }

    fn payload(&self) -> Value {
        let subtype = self.subtype();
        match self {
            OutboundControlRequest::Initialize { hooks } => json!({
                "subtype": subtype,
                "hooks": hooks,
            }),
            OutboundControlRequest::Interrupt => json!({ "subtype": subtype }),
            OutboundControlRequest::SetModel { model } => json!({
                "subtype": subtype,
                "model": model,
            }),
            OutboundControlRequest::SetPermissionMode { mode } => json!({
                "subtype": subtype,
                "mode": mode,
            }),
            OutboundControlRequest::RewindFiles { user_message_id } => json!({
                "subtype": subtype,
                "user_message_id": user_message_id,
            }),
            OutboundControlRequest::McpMessageStatus => json!({ "subtype": subtype }),
        }
    }
}

/// Builds the full `{"type":"control_request", ...}` wire record.
pub fn build_control_request(request_id: &str, payload: &OutboundControlRequest) -> Record {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": payload.payload(),
    })
}

pub fn build_success_response(request_id: &str, data: Value) -> Record {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": data,
        }
    })
}

pub fn build_error_response(request_id: &str, message: &str) -> Record {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        }
    })
}

/// A peer-originated control request, parsed from the wire (spec §4.7).
#[derive(Debug, Clone)]
pub enum InboundControlRequest {
    CanUseTool {
        tool_name: String,
        input: Value,
        suggestions: Vec<Value>,
    },
    HookCallback {
        callback_id: String,
        input: Value,
        tool_use_id: Option<String>,
    },
    McpMessage {
        server_name: Option<String>,
        message: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub enum InboundParseError {
    /// The peer sent a subtype the core only ever sends itself.
    ProtocolViolation(String),
    /// The record was not a well-formed control request.
    Malformed(String),
}

/// Parses the `request` object of an inbound `control_request` record.
pub fn parse_inbound_request(request: &Value) -> Result<InboundControlRequest, InboundParseError> {
    let subtype = request
        .get("subtype")
        .and_then(Value::as_str)
        .ok_or_else(|| InboundParseError::Malformed("control request missing subtype".into()))?;

    if OUTBOUND_ONLY_SUBTYPES.contains(&subtype) {
        return Err(InboundParseError::ProtocolViolation(subtype.to_string()));
    }

    match subtype {
        "can_use_tool" => {
            let tool_name = request
                .get("tool_name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    InboundParseError::Malformed("can_use_tool missing tool_name".into())
                })?
                .to_string();
            let input = request.get("input").cloned().unwrap_or(Value::Null);
            let suggestions = request
                .get("permission_suggestions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(InboundControlRequest::CanUseTool {
                tool_name,
                input,
                suggestions,
            })
        }
        "hook_callback" => {
            let callback_id = request
                .get("callback_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    InboundParseError::Malformed("hook_callback missing callback_id".into())
                })?
                .to_string();
            let input = request.get("input").cloned().unwrap_or(Value::Null);
            let tool_use_id = request
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(InboundControlRequest::HookCallback {
                callback_id,
                input,
                tool_use_id,
            })
        }
        "mcp_message" => {
            let server_name = request
                .get("server_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = request.get("message").cloned();
            Ok(InboundControlRequest::McpMessage {
                server_name,
                message,
            })
        }
        other => Err(InboundParseError::Malformed(format!(
            "unrecognized control request subtype: {other}"
        ))),
    }
}

pub(crate) fn is_control_response(record: &Record) -> bool {
    record.get("type").and_then(Value::as_str) == Some("control_response")
}

pub(crate) fn is_control_request(record: &Record) -> bool {
    record.get("type").and_then(Value::as_str) == Some("control_request")
}
