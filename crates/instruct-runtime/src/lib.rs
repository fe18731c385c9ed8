//! # instruct-runtime
//!
//! Runtime backend selection for instruct.rs. Turns the configured engine tag
//! into a concrete [`GenerationBackend`](instruct_engine::GenerationBackend),
//! ships the deterministic [`MockBackend`], and provides telemetry hooks
//! (time to first fragment, fragments/sec).

pub mod backend;
pub mod mock;
pub mod telemetry;

pub use backend::BackendSelector;
pub use mock::{MockBackend, MockConfig};
pub use telemetry::{
    GenerationMetrics, GenerationTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};
