//! Agent RPC Library
//!
//! Client side of a session-multiplexing JSON-RPC 2.0 protocol for driving a
//! long-lived agent process:
//!
//! - `ipc` - framing, message model, request correlation and dispatch
//! - `session` - routing of server calls and events to sessions
//! - `client` - connection lifecycle and the session API
//! - `transport` - stdio, TCP and external-server streams
//!
//! # Usage
//!
//! ```ignore
//! use agent_rpc::{AgentClient, ClientOptions, MessageOptions, SessionConfig};
//!
//! let client = AgentClient::new(ClientOptions::default())?;
//! client.start().await?;
//!
//! let session = client.create_session(SessionConfig::new()).await?;
//! session.on_type("assistant.message", |event| println!("{}", event.data));
//! session.send(MessageOptions::new("What changed in this repo?")).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod methods;
pub mod session;
pub mod transport;

pub use client::{
    AgentClient, AgentClientBuilder, Connection, ConnectionState, MessageOptions, PingResponse,
    SessionConfig, SessionHandle, SessionMetadata, StatusResponse, ToolDefinition,
    PROTOCOL_VERSION,
};
pub use config::ClientOptions;
pub use error::{RpcError, RpcResult};
pub use events::{EventParser, SessionEvent};
pub use session::{
    PermissionHandler, PermissionRequest, PermissionResult, PermissionResultKind, Session,
    SessionRouter, SubscriptionId, ToolHandler, ToolInvocation, ToolResult, ToolResultType,
    UserInputHandler, UserInputRequest, UserInputResponse, HookHandler,
};
pub use transport::{Connector, Transport};
