#![forbid(unsafe_code)]
//! Core transport and control-protocol engine for mediating a bidirectional,
//! JSON-line control protocol with an external coding-assistant CLI process.
//!
//! This crate covers two layers:
//!
//! - a **subprocess transport** ([`process`], [`frame`], [`transport`]) that
//!   spawns and supervises the assistant process and frames newline-delimited
//!   JSON records over its stdio with bounded buffering, and
//! - a **query handler** ([`pending`], [`callbacks`], [`queue`], [`control`],
//!   [`query`]) implementing the control protocol on top of it: the
//!   initialize handshake, correlated outbound control requests, inbound
//!   control dispatch for permission/hook/MCP callbacks, and coordinated
//!   shutdown.
//!
//! Application-level message, hook, and permission payloads are treated as
//! opaque JSON throughout (see [`types`]); concrete typed wrappers around
//! them are left to the embedding application.

pub mod builder;
pub mod callbacks;
pub mod control;
pub mod error;
pub mod frame;
pub mod pending;
pub mod process;
pub mod query;
pub mod queue;
pub mod transport;
pub mod types;

pub use builder::SessionBuilder;
pub use error::{Result, SdkError, SpawnError};
pub use frame::LineFramer;
pub use query::{QueryConfig, QueryHandler};
pub use queue::QueueConsumer;
pub use transport::{SubprocessTransport, TransportConfig};
pub use types::{
    HookCallback, HookContext, HookMatcherConfig, HooksConfig, McpServerHandle, McpServers,
    PermissionCallback, PermissionMode, Record, ToolPermissionContext,
};
