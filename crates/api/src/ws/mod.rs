//! WebSocket transport and session management.
//!
//! Each connection gets a session from [`SessionManager`]; a writer task
//! drains the session's outbound queue (with periodic pings) while the
//! connection task processes `subscribe` / `unsubscribe` control messages.

mod handler;
pub mod session;

pub use handler::{ws_handler, ws_task_handler};
pub use session::{SessionConfig, SessionGuard, SessionHandle, SessionManager};
