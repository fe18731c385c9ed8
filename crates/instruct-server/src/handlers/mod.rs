//! HTTP and WebSocket handlers.

pub mod abort;
pub mod health;
pub mod ws;

pub use abort::handle_abort;
pub use health::handle_health;
pub use ws::handle_ws;
