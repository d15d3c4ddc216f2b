//! Scripted in-memory agent server shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use agent_rpc::ipc::{ContentLengthCodec, Message, RequestId};
use agent_rpc::{
    AgentClient, ClientOptions, Connector, RpcResult, Transport, PROTOCOL_VERSION,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound any wait in a test.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("Test timed out")
}

/// Server end of a duplex pipe, speaking framed JSON-RPC.
pub struct FakeServer {
    reader: FramedRead<ReadHalf<DuplexStream>, ContentLengthCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, ContentLengthCodec>,
}

impl FakeServer {
    pub async fn recv(&mut self) -> Message {
        let payload = within(self.reader.next())
            .await
            .expect("Client closed the stream")
            .expect("Read failed");
        Message::parse(&payload).expect("Client sent an invalid message")
    }

    /// Next raw payload, or `None` once the client closed its end.
    pub async fn next_frame(&mut self) -> Option<String> {
        match self.reader.next().await {
            Some(Ok(payload)) => Some(payload),
            Some(Err(_)) | None => None,
        }
    }

    /// Next message, which must be a request for `method`.
    pub async fn expect_request(&mut self, method: &str) -> (RequestId, Option<Value>) {
        match self.recv().await {
            Message::Request {
                id,
                method: got,
                params,
            } if got == method => (id, params),
            other => panic!("Expected request {}, got {:?}", method, other),
        }
    }

    /// Next message, which must be a notification for `method`.
    pub async fn expect_notification(&mut self, method: &str) -> Option<Value> {
        match self.recv().await {
            Message::Notification { method: got, params } if got == method => params,
            other => panic!("Expected notification {}, got {:?}", method, other),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.writer
            .send(message.serialize())
            .await
            .expect("Server write failed");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let inner = self.writer.get_mut();
        inner.write_all(bytes).await.expect("Raw write failed");
        inner.flush().await.expect("Flush failed");
    }

    pub async fn reply(&mut self, id: RequestId, result: Value) {
        self.send(Message::response(id, result)).await;
    }

    /// Answer the client's handshake ping.
    pub async fn handshake(&mut self) {
        let (id, _) = self.expect_request("ping").await;
        self.reply(
            id,
            json!({"message": "pong", "timestamp": 0, "protocolVersion": PROTOCOL_VERSION}),
        )
        .await;
    }

    pub async fn send_event(&mut self, session_id: &str, event_type: &str, data: Value) {
        self.send(Message::notification(
            "session.event",
            Some(json!({
                "sessionId": session_id,
                "event": {"type": event_type, "data": data}
            })),
        ))
        .await;
    }
}

/// A connected client stream and the server end that drives it.
pub fn duplex_pair() -> (Transport, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    (
        Transport::from_streams(client_read, client_write),
        FakeServer {
            reader: FramedRead::new(server_read, ContentLengthCodec),
            writer: FramedWrite::new(server_write, ContentLengthCodec),
        },
    )
}

/// Connector handing each new server end to the test.
pub struct DuplexConnector {
    servers: mpsc::UnboundedSender<FakeServer>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> RpcResult<Transport> {
        let (transport, server) = duplex_pair();
        self.servers
            .send(server)
            .expect("Test dropped the server receiver");
        Ok(transport)
    }
}

/// A client wired to in-memory servers. Every (re)connect yields a new
/// `FakeServer` on the returned receiver.
pub fn fake_client(options: ClientOptions) -> (AgentClient, mpsc::UnboundedReceiver<FakeServer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = AgentClient::builder(options)
        .connector(Arc::new(DuplexConnector { servers: tx }))
        .build()
        .expect("Valid options");
    (client, rx)
}

/// A started client and the server end it is talking to.
pub async fn connected_client(
    options: ClientOptions,
) -> (AgentClient, FakeServer, mpsc::UnboundedReceiver<FakeServer>) {
    let (client, mut servers) = fake_client(options);

    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start().await });

    let mut server = within(servers.recv()).await.expect("No server created");
    server.handshake().await;
    within(start)
        .await
        .expect("Start task panicked")
        .expect("Handshake failed");

    (client, server, servers)
}

/// Create a session, answering `session.create` with `session_id`.
pub async fn open_session(
    client: &AgentClient,
    server: &mut FakeServer,
    session_id: &str,
    config: agent_rpc::SessionConfig,
) -> agent_rpc::SessionHandle {
    let creator = client.clone();
    let task = tokio::spawn(async move { creator.create_session(config).await });

    let (id, _) = server.expect_request("session.create").await;
    server.reply(id, json!({ "sessionId": session_id })).await;

    within(task)
        .await
        .expect("Create task panicked")
        .expect("session.create failed")
}
