//! Byte streams to the agent server.
//!
//! Three ways in, all yielding a read half, a write half and (when we spawned
//! it) the child process:
//!
//! - **stdio**: spawn the CLI and speak over its stdin/stdout;
//! - **TCP**: spawn the CLI with `--port`, wait for it to announce the port on
//!   stdout, then connect;
//! - **external**: connect to `cli_url` without spawning anything.
//!
//! The child's stderr is forwarded to `tracing` at debug level.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};
use url::Url;

use crate::config::ClientOptions;
use crate::error::{RpcError, RpcResult};

/// How long a spawned TCP server gets to announce its port.
pub const PORT_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_HOST: &str = "localhost";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream plus the process behind it, if we own one.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub child: Option<Child>,
}

impl Transport {
    /// Wrap arbitrary streams, e.g. an in-memory duplex in tests.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

/// Opens a fresh transport each time the client (re)connects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> RpcResult<Transport>;
}

/// Default connector: spawn the CLI or dial `cli_url` per [`ClientOptions`].
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    options: ClientOptions,
}

impl ProcessConnector {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self) -> RpcResult<Transport> {
        open(&self.options).await
    }
}

/// Open the transport described by `opts`.
///
/// # Errors
///
/// - `RpcError::Configuration` for invalid options or an unparsable `cli_url`
/// - `RpcError::ProcessSpawn` if the CLI cannot be started or never
///   announces its port
/// - `RpcError::ConnectionFailed` if the TCP connect fails
pub async fn open(opts: &ClientOptions) -> RpcResult<Transport> {
    opts.validate()?;

    if let Some(cli_url) = &opts.cli_url {
        let (host, port) = parse_cli_url(cli_url)?;
        info!(host = %host, port, "Connecting to external agent server");
        return connect_tcp(&host, port, None).await;
    }

    let mut child = spawn_cli(opts)?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr));
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::ProcessSpawn("Failed to capture CLI stdout".to_string()))?;

    if opts.use_stdio {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::ProcessSpawn("Failed to capture CLI stdin".to_string()))?;
        return Ok(Transport {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        });
    }

    let mut lines = BufReader::new(stdout).lines();
    let port = match tokio::time::timeout(PORT_ANNOUNCE_TIMEOUT, read_announced_port(&mut lines))
        .await
    {
        Ok(Ok(port)) => port,
        Ok(Err(e)) => {
            let _ = child.start_kill();
            return Err(e);
        }
        Err(_) => {
            let _ = child.start_kill();
            return Err(RpcError::ProcessSpawn(format!(
                "CLI did not announce a port within {}s",
                PORT_ANNOUNCE_TIMEOUT.as_secs()
            )));
        }
    };

    // Keep draining stdout so the child never blocks on a full pipe
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "agent_rpc::cli", "{}", line);
        }
    });

    connect_tcp(DEFAULT_HOST, port, Some(child)).await
}

fn spawn_cli(opts: &ClientOptions) -> RpcResult<Child> {
    let args = opts.spawn_args();
    let mut cmd = Command::new(&opts.cli_path);
    cmd.args(&args)
        .envs(&opts.env)
        .stdin(if opts.use_stdio {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    let child = cmd
        .spawn()
        .map_err(|e| RpcError::ProcessSpawn(format!("{}: {}", opts.cli_path, e)))?;
    info!(
        cli_path = %opts.cli_path,
        pid = child.id(),
        stdio = opts.use_stdio,
        "Spawned agent CLI"
    );
    Ok(child)
}

async fn connect_tcp(host: &str, port: u16, child: Option<Child>) -> RpcResult<Transport> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(RpcError::ConnectionFailed)?;
    let (reader, writer) = stream.into_split();
    debug!(host, port, "TCP transport connected");
    Ok(Transport {
        reader: Box::new(reader),
        writer: Box::new(writer),
        child,
    })
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "agent_rpc::cli", "{}", line);
    }
}

/// Scan stdout lines until the server announces its port.
async fn read_announced_port<R>(lines: &mut Lines<R>) -> RpcResult<u16>
where
    R: AsyncBufRead + Unpin,
{
    let pattern = Regex::new(r"(?i)listening on port (\d+)")
        .map_err(|e| RpcError::Protocol(format!("Invalid port pattern: {}", e)))?;

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| RpcError::ProcessSpawn(format!("Reading CLI stdout: {}", e)))?
            .ok_or_else(|| {
                RpcError::ProcessSpawn("CLI exited before announcing its port".to_string())
            })?;

        if let Some(port) = pattern
            .captures(&line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        {
            debug!(port, "CLI announced port");
            return Ok(port);
        }
        debug!(target: "agent_rpc::cli", "{}", line);
    }
}

/// Parse `cli_url` into a host and port.
///
/// Accepts a bare port (`"8080"`), `host:port`, or `http(s)://host:port`.
pub fn parse_cli_url(cli_url: &str) -> RpcResult<(String, u16)> {
    let trimmed = cli_url.trim();
    let invalid = |why: &str| RpcError::Configuration(format!("Invalid cli_url '{}': {}", cli_url, why));

    if let Ok(port) = trimmed.parse::<u16>() {
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        return Ok((DEFAULT_HOST.to_string(), port));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("tcp://{}", trimmed)
    };
    let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid("missing port"))?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_bare_port() {
        assert_eq!(parse_cli_url("8080").unwrap(), ("localhost".to_string(), 8080));
        assert!(parse_cli_url("0").is_err());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_cli_url("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            parse_cli_url("agent.local:1234").unwrap(),
            ("agent.local".to_string(), 1234)
        );
    }

    #[test]
    fn test_parse_http_urls() {
        assert_eq!(
            parse_cli_url("http://localhost:3000").unwrap(),
            ("localhost".to_string(), 3000)
        );
        assert_eq!(
            parse_cli_url("https://example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_cli_url("localhost"),
            Err(RpcError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_port_announcement_is_found() {
        let stdout: &[u8] = b"starting up\nServer LISTENING ON PORT 41234\nready\n";
        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(read_announced_port(&mut lines).await.unwrap(), 41234);

        // The remaining output is still readable
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_port_announcement_missing() {
        let stdout: &[u8] = b"no port here\n";
        let mut lines = BufReader::new(stdout).lines();
        assert!(matches!(
            read_announced_port(&mut lines).await,
            Err(RpcError::ProcessSpawn(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let opts = ClientOptions::new().with_cli_path("/nonexistent/agent-cli-for-tests");
        let err = open(&opts).await.unwrap_err();
        assert!(matches!(err, RpcError::ProcessSpawn(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_external_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let opts = ClientOptions::new().with_cli_url(format!("127.0.0.1:{}", port));
        let err = open(&opts).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionFailed(_)), "{:?}", err);
    }
}
