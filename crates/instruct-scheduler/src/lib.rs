//! # instruct-scheduler
//!
//! Admission control and cooperative cancellation for generation tasks.
//!
//! - [`CancellationRegistry`] maps in-flight task ids to cancellation flags.
//! - [`AdmissionQueue`] admits waiting tasks in strict arrival order while
//!   keeping the number of executing tasks under a configured limit.
//! - [`TaskState`] is the per-task lifecycle:
//!   `Waiting -> Executing -> {Finished | Aborted | Error}` plus
//!   `Waiting -> Aborted`.
//!
//! Both services are plain owned objects shared through `Arc`; every
//! operation takes a single short exclusive lock and never holds it across an
//! `.await`, so no lock ordering between the two is needed.

pub mod admission;
pub mod cancellation;
pub mod error;
pub mod task;

pub use admission::{Admission, AdmissionQueue, ExecutionSlot, QueueTicket, DEFAULT_POLL_INTERVAL};
pub use cancellation::{CancellationGuard, CancellationRegistry, FlagState};
pub use error::{Result, SchedulerError};
pub use task::{TaskId, TaskState};

pub use tokio_util::sync::CancellationToken;
