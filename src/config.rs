//! Environment-driven server configuration.
//!
//! Every value has a sensible default except the JWT secret and issuer,
//! which must be provided. Values that would make a session misbehave
//! (negative error limits, sub-second keepalive) are normalised here so the
//! session code can trust what it receives.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Consecutive outbound write failures tolerated when none is configured.
pub const DEFAULT_CONNECTION_ERROR_LIMIT: usize = 10;

/// Keepalive interval substituted for values at or below one second.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

const DEFAULT_PORT: u16 = 9999;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_COMMAND: &str = "/bin/bash";
const DEFAULT_BUFFER_SIZE: usize = 512;
const DEFAULT_WEB_ROOT: &str = "front/dist";

/// Largest PTY read chunk; one buffer of this size is allocated per session.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Settings for a single shell session.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Hostnames allowed to open a session (`*` allows any).
    pub allowed_hostnames: Vec<String>,
    /// Path of the binary to run inside the PTY.
    pub command: String,
    /// Arguments passed to `command`.
    pub arguments: Vec<String>,
    /// Consecutive outbound write failures tolerated before the session ends.
    pub connection_error_limit: usize,
    /// Maximum silence between ping and pong before the connection is deemed dead.
    pub keepalive_ping_timeout: Duration,
    /// PTY read chunk size and WebSocket write buffer size.
    pub max_buffer_size_bytes: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_message_size_bytes: usize,
}

impl ShellConfig {
    /// Clamp raw values into the ranges the session relies on.
    pub fn normalized(mut self) -> Self {
        if self.keepalive_ping_timeout <= Duration::from_secs(1) {
            self.keepalive_ping_timeout = DEFAULT_KEEPALIVE;
        }
        self.max_buffer_size_bytes = self.max_buffer_size_bytes.clamp(1, MAX_BUFFER_SIZE);
        self.max_message_size_bytes = self.max_message_size_bytes.max(self.max_buffer_size_bytes);
        self
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            allowed_hostnames: vec!["localhost".to_string()],
            command: DEFAULT_COMMAND.to_string(),
            arguments: Vec::new(),
            connection_error_limit: DEFAULT_CONNECTION_ERROR_LIMIT,
            keepalive_ping_timeout: Duration::from_secs(60),
            max_buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// JWT verification settings.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding the browser terminal, served at `/`.
    pub web_root: PathBuf,
    pub shell: ShellConfig,
    pub jwt: JwtConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `HOST`, `PORT` - listen address (default `0.0.0.0:9999`)
    /// - `WEB_ROOT_DIR` - static browser terminal (default `front/dist`)
    /// - `ALLOWED_HOSTS` - comma-separated hostname allow-list (default `localhost`)
    /// - `SHELL_COMMAND`, `SHELL_ARGS` - program to run in the PTY
    /// - `CONNECTION_ERROR_LIMIT` - negative values select the default
    /// - `KEEPALIVE_PING_TIMEOUT_SECS` - keepalive window in seconds
    /// - `MAX_BUFFER_SIZE_BYTES` (at most 64 KiB), `MAX_MESSAGE_SIZE_BYTES`
    /// - `JWT_SECRET`, `JWT_ISSUER` - required
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(&env::vars().collect())
    }

    /// Build the configuration from an already collected set of variables.
    pub fn from_vars(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let defaults = ShellConfig::default();
        let var = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let port = match var("PORT") {
            Some(p) => p
                .parse::<u16>()
                .with_context(|| format!("PORT must be a valid port number, got '{}'", p))?,
            None => DEFAULT_PORT,
        };

        let allowed_hostnames = var("ALLOWED_HOSTS")
            .map(|raw| parse_list(raw, ','))
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or(defaults.allowed_hostnames);

        let command = var("SHELL_COMMAND")
            .map(str::to_string)
            .unwrap_or(defaults.command);

        let arguments = var("SHELL_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let connection_error_limit = match parse_var::<i64>(vars, "CONNECTION_ERROR_LIMIT")? {
            Some(limit) => error_limit_from(limit),
            None => defaults.connection_error_limit,
        };

        let keepalive_ping_timeout = parse_var::<u64>(vars, "KEEPALIVE_PING_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.keepalive_ping_timeout);

        let max_buffer_size_bytes = parse_var::<usize>(vars, "MAX_BUFFER_SIZE_BYTES")?
            .unwrap_or(defaults.max_buffer_size_bytes);
        let max_message_size_bytes = parse_var::<usize>(vars, "MAX_MESSAGE_SIZE_BYTES")?
            .unwrap_or(defaults.max_message_size_bytes);

        let jwt = JwtConfig {
            secret: required(vars, "JWT_SECRET")?,
            issuer: required(vars, "JWT_ISSUER")?,
        };

        Ok(Self {
            host: var("HOST").unwrap_or(DEFAULT_HOST).to_string(),
            port,
            web_root: PathBuf::from(var("WEB_ROOT_DIR").unwrap_or(DEFAULT_WEB_ROOT)),
            shell: ShellConfig {
                allowed_hostnames,
                command,
                arguments,
                connection_error_limit,
                keepalive_ping_timeout,
                max_buffer_size_bytes,
                max_message_size_bytes,
            }
            .normalized(),
            jwt,
        })
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> anyhow::Result<String> {
    match vars.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        Some(_) => anyhow::bail!("{} must not be empty", name),
        None => anyhow::bail!("{} must be set", name),
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name).map(|raw| raw.trim()) {
        Some(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {} '{}': {}", name, raw, e)),
        _ => Ok(None),
    }
}

fn parse_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn error_limit_from(raw: i64) -> usize {
    if raw < 0 {
        DEFAULT_CONNECTION_ERROR_LIMIT
    } else {
        raw as usize
    }
}
