//! agent-rpc-probe - connect to an agent server and check it responds.
//!
//! Spawns (or dials) the agent CLI, performs the handshake, prints the server
//! status and optionally lists stored sessions or runs a single prompt.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_rpc::events::event_types;
use agent_rpc::{AgentClient, ClientOptions, MessageOptions, SessionConfig};

/// Upper bound on waiting for a prompt's turn to finish.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "agent-rpc-probe", version, about)]
struct Args {
    /// Agent CLI to spawn (defaults to $AGENT_CLI_PATH or "copilot")
    #[arg(long)]
    cli_path: Option<String>,

    /// Connect to a running server instead: PORT, HOST:PORT or http://HOST:PORT
    #[arg(long, conflicts_with_all = ["cli_path", "tcp"])]
    cli_url: Option<String>,

    /// Spawn the CLI in TCP mode instead of stdio
    #[arg(long)]
    tcp: bool,

    /// TCP port for the spawned CLI (0 = any)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Log level passed to the CLI
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print stored sessions
    #[arg(long)]
    list_sessions: bool,

    /// Create a session, send this prompt and stream its events
    #[arg(long)]
    prompt: Option<String>,
}

impl Args {
    fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new()
            .with_log_level(self.log_level.clone())
            .with_auto_restart(false);
        if let Some(url) = &self.cli_url {
            return options.with_cli_url(url.clone());
        }
        if let Some(path) = &self.cli_path {
            options = options.with_cli_path(path.clone());
        }
        if self.tcp {
            options = options.with_stdio(false).with_port(self.port);
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for results
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agent_rpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    info!("Starting agent-rpc-probe v{}", env!("CARGO_PKG_VERSION"));

    let client = AgentClient::new(args.client_options()).context("Invalid client options")?;
    client
        .start()
        .await
        .context("Failed to connect to agent server")?;

    let result = run(&client, &args).await;

    for err in client.stop().await {
        tracing::warn!(error = %err, "Cleanup error");
    }
    result
}

async fn run(client: &AgentClient, args: &Args) -> Result<()> {
    let ping = client.ping(Some("probe")).await.context("ping failed")?;
    println!(
        "ping: {} (protocol {})",
        ping.message.as_deref().unwrap_or("-"),
        ping.protocol_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string())
    );

    let status = client.get_status().await.context("status.get failed")?;
    println!("server version: {}", status.version.as_deref().unwrap_or("unknown"));

    if args.list_sessions {
        let sessions = client
            .list_sessions()
            .await
            .context("session.list failed")?;
        if sessions.is_empty() {
            println!("no stored sessions");
        }
        for session in sessions {
            println!(
                "{}  {}",
                session.session_id,
                session.summary.as_deref().unwrap_or("")
            );
        }
    }

    if let Some(prompt) = &args.prompt {
        let session = client
            .create_session(SessionConfig::new())
            .await
            .context("session.create failed")?;
        println!("session: {}", session.id());

        session.on(|event| {
            if event.event_type == event_types::ASSISTANT_MESSAGE {
                if let Some(content) = event.data.get("content").and_then(|c| c.as_str()) {
                    println!("{}", content);
                }
            } else {
                println!("[{}]", event.event_type);
            }
        });
        let idle = session.wait_for_event(event_types::SESSION_IDLE);

        session
            .send(MessageOptions::new(prompt.clone()))
            .await
            .context("session.send failed")?;

        tokio::time::timeout(PROMPT_TIMEOUT, idle)
            .await
            .context("Timed out waiting for the turn to finish")?
            .context("Session closed before going idle")?;

        session.destroy().await.context("session.destroy failed")?;
    }

    Ok(())
}
