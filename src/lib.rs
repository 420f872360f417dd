//! # Web Shell
//!
//! Exposes an interactive shell to a browser terminal over a WebSocket.
//!
//! ## Session Flow
//! 1. `GET /goshell?token=...` is admitted only for allow-listed hosts
//! 2. The connection is upgraded and the configured command is started on a PTY
//! 3. The token is checked; failures are reported as a text frame
//! 4. Output, input, resizes and keepalive pings flow until the first fatal
//!    condition, after which the process, PTY and connection are released
//!
//! ```text
//!   browser ──ws──▶ inbound pump ──▶ pty writer ──▶ ┌─────────┐
//!                                                   │  child  │
//!   browser ◀──ws── outbound pump ◀── pty reader ◀─ └─────────┘
//!          ◀─ping── monitor (keepalive + token expiry)
//! ```
//!
//! ## Modules
//! - `api`: routes, admission check, token checking
//! - `session`: orchestration, byte pumps, keepalive monitor
//! - `pty`: child process on a pseudo-terminal

pub mod api;
pub mod config;
pub mod metrics;
pub mod pty;
pub mod session;

pub use config::Config;
