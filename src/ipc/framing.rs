//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). It is used unchanged for both the
//! stdio pipes of a spawned agent and a TCP socket.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! The header key match is case-insensitive and unknown headers are ignored.
//! A header block without a usable Content-Length is discarded and scanning
//! resumes after it. Header bytes beyond `MAX_HEADER_SIZE` with no terminator
//! are dropped as well.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::RpcError;

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Longest header block scanned before the bytes are discarded as garbage.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encode a payload as a complete Content-Length frame.
///
/// `n` in the header is the byte length of the UTF-8 body, not its char count.
///
/// # Example
///
/// ```
/// let frame = agent_rpc::ipc::encode("{}");
/// assert_eq!(frame, b"Content-Length: 2\r\n\r\n{}");
/// ```
pub fn encode(body: &str) -> Vec<u8> {
    let mut dst = BytesMut::with_capacity(body.len() + 32);
    encode_into(body, &mut dst);
    dst.to_vec()
}

fn encode_into(body: &str, dst: &mut BytesMut) {
    let body_bytes = body.as_bytes();
    let header = format!("Content-Length: {}\r\n\r\n", body_bytes.len());
    dst.reserve(header.len() + body_bytes.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(body_bytes);
}

/// Parse a single header line, returning the Content-Length value if this is
/// that header.
fn parse_content_length_line(line: &str) -> Option<usize> {
    let trimmed = line.trim();
    let colon_pos = trimmed.find(':')?;
    let key = trimmed[..colon_pos].trim();
    let value = trimmed[colon_pos + 1..].trim();

    if key.eq_ignore_ascii_case("Content-Length") {
        value.parse::<usize>().ok()
    } else {
        None
    }
}

/// Scan a whole header block (without the terminator).
fn parse_header_block(block: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(block).ok()?;
    text.split("\r\n").find_map(parse_content_length_line)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Pull the next complete payload out of `buf`, consuming it.
///
/// Returns `None` when more bytes are needed. Bad header blocks and non-UTF-8
/// bodies are dropped with a warning and scanning continues.
fn decode_frame(buf: &mut BytesMut) -> Option<String> {
    loop {
        let Some(header_end) = find_terminator(buf) else {
            if buf.len() > MAX_HEADER_SIZE {
                // Keep a tail that may hold the start of a split terminator
                let discard = buf.len() - (HEADER_TERMINATOR.len() - 1);
                warn!(
                    bytes = discard,
                    max = MAX_HEADER_SIZE,
                    "No header terminator found; discarding"
                );
                buf.advance(discard);
            }
            return None;
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let size = match parse_header_block(&buf[..header_end]) {
            Some(size) if size <= MAX_MESSAGE_SIZE => size,
            Some(size) => {
                warn!(
                    size,
                    max = MAX_MESSAGE_SIZE,
                    "Frame exceeds maximum size; discarding header"
                );
                buf.advance(body_start);
                continue;
            }
            None => {
                warn!(
                    header = %String::from_utf8_lossy(&buf[..header_end]),
                    "Frame header missing valid Content-Length; discarding"
                );
                buf.advance(body_start);
                continue;
            }
        };

        if buf.len() < body_start + size {
            // Reserve up front so a large body is not grown chunk by chunk
            buf.reserve(body_start + size - buf.len());
            return None;
        }

        buf.advance(body_start);
        let body = buf.split_to(size);

        match String::from_utf8(body.to_vec()) {
            Ok(text) => return Some(text),
            Err(e) => {
                warn!("Frame body is not valid UTF-8: {}", e);
                continue;
            }
        }
    }
}

/// Incremental frame decoder over arbitrary chunk boundaries.
///
/// Feed it raw bytes as they arrive; it hands back every payload that became
/// complete, in arrival order.
///
/// # Example
///
/// ```
/// use agent_rpc::ipc::FrameBuffer;
///
/// let mut frames = FrameBuffer::new();
/// assert!(frames.feed(b"Content-Length: 2\r\n").is_empty());
/// assert_eq!(frames.feed(b"\r\n{}"), vec!["{}".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain every complete payload.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(payload) = decode_frame(&mut self.buf) {
            payloads.push(payload);
        }
        payloads
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// `tokio_util` codec wrapping the same framing rules, for use with
/// `FramedRead`/`FramedWrite` over any async byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentLengthCodec;

impl Decoder for ContentLengthCodec {
    type Item = String;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, RpcError> {
        Ok(decode_frame(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, RpcError> {
        if let Some(frame) = decode_frame(src) {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            warn!(bytes = src.len(), "Stream ended inside a frame; dropping partial data");
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<String> for ContentLengthCodec {
    type Error = RpcError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), RpcError> {
        encode_into(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;
    use tokio_util::codec::{FramedRead, FramedWrite};

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_encode_uses_byte_length() {
        // "é" is two bytes in UTF-8
        let encoded = encode(r#"{"a":"é"}"#);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("Content-Length: 10\r\n\r\n"), "{}", text);
    }

    #[test]
    fn test_two_messages_in_one_chunk() {
        let mut chunk = frame(r#"{"id":1}"#);
        chunk.extend(frame(r#"{"id":2}"#));

        let mut frames = FrameBuffer::new();
        let payloads = frames.feed(&chunk);

        assert_eq!(payloads, vec![r#"{"id":1}"#, r#"{"id":2}"#]);
        assert_eq!(frames.buffered_len(), 0);
    }

    #[test]
    fn test_split_across_three_chunks() {
        let bytes = frame(r#"{"jsonrpc":"2.0","method":"ping"}"#);
        let mut frames = FrameBuffer::new();

        // Split inside the header, then inside the body
        assert!(frames.feed(&bytes[..7]).is_empty());
        assert!(frames.feed(&bytes[7..30]).is_empty());
        let payloads = frames.feed(&bytes[30..]);

        assert_eq!(payloads, vec![r#"{"jsonrpc":"2.0","method":"ping"}"#]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = frame(r#"{"x":true}"#);
        let mut frames = FrameBuffer::new();
        let mut yielded = Vec::new();
        for b in &bytes {
            yielded.extend(frames.feed(std::slice::from_ref(b)));
        }
        assert_eq!(yielded, vec![r#"{"x":true}"#]);
    }

    #[test]
    fn test_header_parsing_case_variations() {
        assert_eq!(parse_content_length_line("Content-Length: 100"), Some(100));
        assert_eq!(parse_content_length_line("content-length: 200"), Some(200));
        assert_eq!(parse_content_length_line("CONTENT-LENGTH: 300"), Some(300));
        assert_eq!(parse_content_length_line("Content-Length :  100"), Some(100));
        assert_eq!(parse_content_length_line("Content-Length:\t100"), Some(100));
    }

    #[test]
    fn test_header_parsing_invalid_cases() {
        assert_eq!(parse_content_length_line("Content-Length 100"), None);
        assert_eq!(parse_content_length_line("Content-Type: text/plain"), None);
        assert_eq!(parse_content_length_line("Content-Length: abc"), None);
        assert_eq!(parse_content_length_line("Content-Length:"), None);
        assert_eq!(parse_content_length_line(""), None);
    }

    #[test]
    fn test_extra_headers_ignored() {
        let body = r#"{"ok":1}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut frames = FrameBuffer::new();
        assert_eq!(frames.feed(raw.as_bytes()), vec![body]);
    }

    #[test]
    fn test_bad_header_is_discarded_and_scanning_resumes() {
        let mut chunk = b"Content-Length: nope\r\n\r\n".to_vec();
        chunk.extend(frame(r#"{"after":true}"#));

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.feed(&chunk), vec![r#"{"after":true}"#]);
    }

    #[test]
    fn test_missing_content_length_is_discarded() {
        let mut chunk = b"X-Other: 1\r\n\r\n".to_vec();
        chunk.extend(frame("{}"));

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.feed(&chunk), vec!["{}"]);
    }

    #[test]
    fn test_oversized_frame_is_discarded() {
        let mut chunk = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_SIZE + 1).into_bytes();
        chunk.extend(frame("{}"));

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.feed(&chunk), vec!["{}"]);
    }

    #[test]
    fn test_unterminated_header_is_bounded() {
        let mut frames = FrameBuffer::new();
        let garbage = vec![b'x'; 4 * MAX_HEADER_SIZE];
        for chunk in garbage.chunks(1024) {
            assert!(frames.feed(chunk).is_empty());
            assert!(frames.buffered_len() <= MAX_HEADER_SIZE + 1024);
        }

        // A real frame after the garbage still decodes
        let mut chunk = b"\r\n".to_vec();
        chunk.extend(frame(r#"{"ok":1}"#));
        assert_eq!(frames.feed(&chunk), vec![r#"{"ok":1}"#]);
    }

    #[test]
    fn test_invalid_utf8_body_is_skipped() {
        let mut chunk = b"Content-Length: 2\r\n\r\n\xff\xfe".to_vec();
        chunk.extend(frame(r#"{"next":1}"#));

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.feed(&chunk), vec![r#"{"next":1}"#]);
    }

    #[tokio::test]
    async fn test_codec_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, ContentLengthCodec);
        let mut reader = FramedRead::new(server, ContentLengthCodec);

        let message = r#"{"jsonrpc":"2.0","method":"test","id":1}"#.to_string();
        writer.send(message.clone()).await.expect("Write failed");

        let received = timeout(TEST_TIMEOUT, reader.next())
            .await
            .expect("Test timed out")
            .expect("Stream ended")
            .expect("Read failed");

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_codec_truncated_stream_ends_cleanly() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FramedRead::new(server, ContentLengthCodec);

        client
            .write_all(b"Content-Length: 50\r\n\r\n{\"partial\"")
            .await
            .expect("Write failed");
        drop(client);

        let next = timeout(TEST_TIMEOUT, reader.next())
            .await
            .expect("Test timed out");
        assert!(next.is_none(), "Expected end of stream, got {:?}", next);
    }
}
