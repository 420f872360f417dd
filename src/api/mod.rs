//! HTTP surface: the shell WebSocket endpoint, its admission check and the
//! token capability it authenticates with.

pub mod auth;
pub mod origin;
pub mod routes;
pub mod shell;

pub use routes::{router, serve, AppState};
