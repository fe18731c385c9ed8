//! # instruct-server
//!
//! Streams replies from a generation backend to WebSocket clients.
//!
//! Each connection gets its own conversation. Every request becomes a task
//! that waits in a global FIFO admission queue, reports its queue position,
//! streams fragments while it holds one of the limited execution slots and
//! ends with exactly one terminal frame. Tasks can be cancelled by id, either
//! inline on the socket or through `POST /abort`.

pub mod config;
pub mod conversation;
pub mod error;
pub mod generation;
pub mod handlers;
pub mod models;
pub mod server;
pub mod session;
pub mod state;

pub use config::{Config, ConfigError};
pub use conversation::ConversationStore;
pub use error::ServerError;
pub use generation::{GenerationTask, TaskEvent, UserTurn};
pub use models::{ClientMessage, Frame, TaskStatus};
pub use server::{create_router, run_server};
pub use session::SessionProtocol;
pub use state::AppState;
