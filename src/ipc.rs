//! JSON-RPC 2.0 transport layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐      stdio or TCP       ┌─────────────────────┐
//! │  AgentClient    │  ◄────────────────────► │   agent server      │
//! │ (RpcConnection) │  JSON-RPC 2.0 + framing │   (CLI process)     │
//! └─────────────────┘                         └─────────────────────┘
//! ```
//!
//! Either side may send requests; both share one connection.
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 40\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"ping","id":1}
//! ```
//!
//! # Layers
//!
//! - [`framing`]: Content-Length codec
//! - [`message`]: the four message shapes and their classification
//! - [`pending`]: outstanding request table
//! - [`dispatch`]: handlers for server-initiated calls
//! - [`connection`]: read loop, writer task and request correlation

pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod message;
pub mod pending;

pub use connection::RpcConnection;
pub use dispatch::{
    handler_fn, Dispatcher, DispatcherBuilder, InboundNotification, NotificationHandler,
    RequestHandler,
};
pub use framing::{encode, ContentLengthCodec, FrameBuffer, MAX_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use message::{error_codes, ErrorObject, Message, RequestId};
pub use pending::PendingRequests;
