//! WebSocket and HTTP wire types.

pub mod frame;
pub mod request;

pub use frame::{Frame, TaskStatus};
pub use request::{decode_attachment, AbortRequest, AbortResponse, ClientMessage, GenerateRequest, RequestError};
