//! Client options.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{RpcError, RpcResult};

/// Environment variable overriding the default CLI path.
pub const CLI_PATH_ENV: &str = "AGENT_CLI_PATH";

/// CLI spawned when neither an explicit path nor the env override is set.
pub const DEFAULT_CLI_PATH: &str = "copilot";

/// How [`crate::AgentClient`] reaches the agent server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Agent CLI executable.
    pub cli_path: String,
    /// Extra arguments placed before the fixed flags.
    pub cli_args: Vec<String>,
    /// Connect to an already running server instead of spawning one.
    pub cli_url: Option<String>,
    /// Talk over the child's stdin/stdout rather than TCP.
    pub use_stdio: bool,
    /// TCP port for the spawned server; 0 lets it pick.
    pub port: u16,
    pub log_level: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Connect on first use when not started explicitly.
    pub auto_start: bool,
    /// Rebuild the connection after an unexpected close.
    pub auto_restart: bool,
    /// Set when `cli_path` was chosen by the caller.
    cli_path_explicit: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cli_path: std::env::var(CLI_PATH_ENV).unwrap_or_else(|_| DEFAULT_CLI_PATH.to_string()),
            cli_args: Vec::new(),
            cli_url: None,
            use_stdio: true,
            port: 0,
            log_level: "info".to_string(),
            cwd: None,
            env: HashMap::new(),
            auto_start: true,
            auto_restart: true,
            cli_path_explicit: false,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = path.into();
        self.cli_path_explicit = true;
        self
    }

    pub fn with_cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Use an external server. Turns stdio off, since the two are exclusive.
    pub fn with_cli_url(mut self, url: impl Into<String>) -> Self {
        self.cli_url = Some(url.into());
        self.use_stdio = false;
        self
    }

    pub fn with_stdio(mut self, use_stdio: bool) -> Self {
        self.use_stdio = use_stdio;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    /// Reject contradictory combinations.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Configuration` if `cli_url` is combined with
    /// `use_stdio` or an explicit `cli_path`.
    pub fn validate(&self) -> RpcResult<()> {
        if self.cli_url.is_some() {
            if self.use_stdio {
                return Err(RpcError::Configuration(
                    "cli_url is mutually exclusive with use_stdio".to_string(),
                ));
            }
            if self.cli_path_explicit {
                return Err(RpcError::Configuration(
                    "cli_url is mutually exclusive with cli_path".to_string(),
                ));
            }
        }
        if self.cli_url.is_none() && self.cli_path.trim().is_empty() {
            return Err(RpcError::Configuration("cli_path is empty".to_string()));
        }
        Ok(())
    }

    /// Full argument list for a spawned CLI.
    pub fn spawn_args(&self) -> Vec<String> {
        let mut args = self.cli_args.clone();
        args.push("--headless".to_string());
        args.push("--log-level".to_string());
        args.push(self.log_level.clone());
        if self.use_stdio {
            args.push("--stdio".to_string());
        } else if self.port != 0 {
            args.push("--port".to_string());
            args.push(self.port.to_string());
        }
        args
    }
}
