//! Deterministic built-in engine.
//!
//! Echoes the last user turn back one word per fragment. Useful for demos,
//! load tests of the admission layer, and integration tests: the delay between
//! fragments and a scripted failure point are configurable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use instruct_engine::{
    BackendKind, EngineError, FragmentStream, GenerationBackend, GenerationRequest, Role,
};

/// Settings for [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Pause before each fragment, in milliseconds.
    pub fragment_delay_ms: u64,
    /// Accept image attachments. When false, turns with attachments fail.
    pub vision: bool,
    /// Fail with a generation error after this many fragments.
    pub fail_after: Option<usize>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            fragment_delay_ms: 20,
            vision: true,
            fail_after: None,
        }
    }
}

impl MockConfig {
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn failing_after(mut self, fragments: usize) -> Self {
        self.fail_after = Some(fragments);
        self
    }
}

/// Echo engine honoring `max_new_tokens` as a fragment cap.
pub struct MockBackend {
    kind: BackendKind,
    config: MockConfig,
    /// Live request ids, mapped to whether an abort was requested.
    live: Arc<LiveRequests>,
}

impl MockBackend {
    /// Build a mock engine that validates requests with `kind`'s schema.
    pub fn new(kind: BackendKind, config: MockConfig) -> Self {
        Self {
            kind,
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(BackendKind::Mock, MockConfig::default())
    }
}

type LiveRequests = Mutex<HashMap<String, bool>>;

fn lock(live: &LiveRequests) -> MutexGuard<'_, HashMap<String, bool>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a request id live for as long as its stream exists.
struct LiveRequest {
    live: Arc<LiveRequests>,
    request_id: String,
}

impl LiveRequest {
    fn open(live: &Arc<LiveRequests>, request_id: String) -> Self {
        lock(live).insert(request_id.clone(), false);
        Self {
            live: Arc::clone(live),
            request_id,
        }
    }

    fn is_aborted(&self) -> bool {
        lock(&self.live)
            .get(&self.request_id)
            .copied()
            .unwrap_or(false)
    }
}

impl Drop for LiveRequest {
    fn drop(&mut self) {
        lock(&self.live).remove(&self.request_id);
    }
}

impl GenerationBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn generate(&self, request: GenerationRequest) -> FragmentStream {
        let Some(last_user) = request.history.iter().rev().find(|t| t.role == Role::User) else {
            return futures::stream::once(async {
                Err(EngineError::Generation("history has no user turn".to_string()))
            })
            .boxed();
        };

        if !self.config.vision && !last_user.attachments.is_empty() {
            return futures::stream::once(async {
                Err(EngineError::Unsupported("image input not supported".to_string()))
            })
            .boxed();
        }

        // A reply prefix is already on the wire; continue after it.
        let continues = !request.reply_prefix.is_empty();
        let limit = request.params.max_new_tokens() as usize;
        let words: Vec<String> = last_user
            .content
            .split_whitespace()
            .take(limit)
            .enumerate()
            .map(|(i, w)| {
                if i == 0 && !continues {
                    w.to_string()
                } else {
                    format!(" {w}")
                }
            })
            .collect();

        let delay = Duration::from_millis(self.config.fragment_delay_ms);
        let fail_after = self.config.fail_after;
        let live = LiveRequest::open(&self.live, request.request_id);

        let stream = async_stream::stream! {
            let total = words.len();
            for (i, word) in words.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(EngineError::Generation(format!("mock failure after {i} fragments")));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if live.is_aborted() {
                    tracing::debug!(request_id = %live.request_id, "mock generation aborted");
                    return;
                }
                yield Ok(word);
            }
            if fail_after == Some(total) {
                yield Err(EngineError::Generation(format!("mock failure after {total} fragments")));
            }
        };
        stream.boxed()
    }

    fn abort(&self, request_id: &str) {
        // Unknown or finished ids are ignored.
        if let Some(flag) = lock(&self.live).get_mut(request_id) {
            *flag = true;
        }
    }
}
