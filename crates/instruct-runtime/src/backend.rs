//! Backend selection by configuration tag.
//!
//! The configured [`BackendKind`] decides two things: which sampling schema
//! requests are validated against, and which implementation produces
//! fragments. Only the mock engine is linked into this crate; the external
//! engines (HF pipeline, vLLM, llama.cpp) are served by the mock engine with
//! their own sampling schema until an adapter is plugged in through
//! [`BackendSelector::with_backend`].

use std::sync::Arc;

use instruct_engine::{BackendKind, GenerationBackend};

use crate::mock::{MockBackend, MockConfig};

/// Picks the active generation backend.
#[derive(Clone)]
pub struct BackendSelector {
    kind: BackendKind,
    mock: MockConfig,
    custom: Option<Arc<dyn GenerationBackend>>,
}

impl BackendSelector {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            mock: MockConfig::default(),
            custom: None,
        }
    }

    /// Settings used when the mock engine serves the requests.
    pub fn with_mock_config(mut self, config: MockConfig) -> Self {
        self.mock = config;
        self
    }

    /// Use an externally built backend instead of the built-in one.
    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.kind = backend.kind();
        self.custom = Some(backend);
        self
    }

    /// The selected tag.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Whether the selected tag has a built-in implementation.
    pub fn is_native(kind: BackendKind) -> bool {
        matches!(kind, BackendKind::Mock)
    }

    /// Build the backend for the selected tag.
    pub fn build(&self) -> Arc<dyn GenerationBackend> {
        if let Some(custom) = &self.custom {
            return Arc::clone(custom);
        }
        if !Self::is_native(self.kind) {
            tracing::warn!(
                engine = %self.kind,
                "engine is not linked into this build, serving it with the mock engine"
            );
        }
        Arc::new(MockBackend::new(self.kind, self.mock.clone()))
    }
}
