//! Local control API: one JSON frame per connection over loopback TCP
//! (the CLI) or a world-writable Unix socket (sandboxed containers), with
//! capability-scoped token auth.

pub mod auth;
pub mod dispatch;
pub mod frames;
pub mod server;

pub use auth::AuthState;
pub use dispatch::{ActionResult, ActionTable};
pub use frames::{ApiRequest, ApiResponse};
pub use server::ApiServer;

/// Loopback TCP port the CLI talks to.
pub const API_TCP_PORT: u16 = 1453;
