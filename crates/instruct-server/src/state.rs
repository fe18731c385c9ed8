//! Application state shared across handlers and sessions.

use std::sync::Arc;

use instruct_engine::GenerationBackend;
use instruct_runtime::{BackendSelector, TelemetryHook, TracingTelemetry};
use instruct_scheduler::{AdmissionQueue, CancellationRegistry, TaskId};

use crate::config::Config;
use crate::conversation::ConversationStore;

/// Services shared by every connection. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Engine serving generation calls.
    pub backend: Arc<dyn GenerationBackend>,
    pub config: Arc<Config>,
    pub conversations: Arc<ConversationStore>,
    pub cancellations: Arc<CancellationRegistry>,
    /// Global concurrency limit over executing tasks.
    pub queue: Arc<AdmissionQueue>,
    pub telemetry: Arc<dyn TelemetryHook>,
}

impl AppState {
    /// Build fresh services from `config`, selecting the backend by its tag.
    pub fn from_config(config: Config) -> Self {
        let backend = BackendSelector::new(config.engine)
            .with_mock_config(config.mock.clone())
            .build();
        let queue = AdmissionQueue::new(
            config.scheduler.max_concurrent_tasks,
            config.scheduler.poll_interval(),
        );
        Self {
            backend,
            config: Arc::new(config),
            conversations: Arc::new(ConversationStore::new()),
            cancellations: CancellationRegistry::new(),
            queue,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Request cancellation of `task_id`. Safe for unknown or finished tasks;
    /// returns whether a task was flagged.
    pub fn abort(&self, task_id: TaskId) -> bool {
        let signaled = self.cancellations.signal(task_id);
        tracing::info!(%task_id, signaled, "abort requested");
        signaled
    }
}
