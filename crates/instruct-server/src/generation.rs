//! One generation call against the backend.
//!
//! A [`GenerationTask`] records the new user turn, pulls fragments from the
//! backend one at a time and appends the assistant reply to the conversation.
//! Cancellation is cooperative: the token is checked before every fragment is
//! requested and while waiting for it, and the backend stream is dropped as
//! soon as cancellation is observed.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use instruct_engine::{Attachment, GenerationBackend, GenerationRequest, SamplingParams, Turn};
use instruct_runtime::{GenerationTimer, TelemetryHook};
use instruct_scheduler::{CancellationToken, TaskId};

use crate::conversation::ConversationStore;

/// The caller's side of one exchange.
#[derive(Debug, Clone, Default)]
pub struct UserTurn {
    /// Non-empty system prompt, if any.
    pub system_prompt: Option<String>,
    pub prompt: String,
    /// Seeds the assistant reply; empty for none.
    pub reply_prefix: String,
    pub attachments: Vec<Attachment>,
}

/// Progress of a generation call. Exactly one terminal event ends the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Fragment(String),
    Finished,
    Aborted,
    Error(String),
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Fragment(_))
    }
}

/// A generation call that has been admitted for execution.
pub struct GenerationTask {
    pub task_id: TaskId,
    pub conversation_id: String,
    pub turn: UserTurn,
    pub params: SamplingParams,
}

/// The assistant reply under construction. Committed to the store exactly once,
/// at the latest when dropped.
struct ReplyDraft {
    store: Arc<ConversationStore>,
    conversation_id: String,
    content: String,
    committed: bool,
}

impl ReplyDraft {
    fn new(store: Arc<ConversationStore>, conversation_id: String, prefix: &str) -> Self {
        Self {
            store,
            conversation_id,
            content: prefix.to_string(),
            committed: false,
        }
    }

    fn push(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        let content = std::mem::take(&mut self.content);
        self.store.append(&self.conversation_id, Turn::assistant(content));
    }
}

impl Drop for ReplyDraft {
    fn drop(&mut self) {
        self.commit();
    }
}

impl GenerationTask {
    /// Run the call. Dropping the returned stream stops generation and still
    /// commits whatever was produced.
    pub fn run(
        self,
        backend: Arc<dyn GenerationBackend>,
        store: Arc<ConversationStore>,
        telemetry: Arc<dyn TelemetryHook>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TaskEvent> + Send + 'static {
        let GenerationTask {
            task_id,
            conversation_id,
            turn,
            params,
        } = self;

        async_stream::stream! {
            if let Some(system_prompt) = turn.system_prompt.as_deref() {
                store.append_system(&conversation_id, system_prompt);
            }
            store.append(
                &conversation_id,
                Turn::user(turn.prompt).with_attachments(turn.attachments),
            );
            let history = store.history(&conversation_id);
            let mut draft = ReplyDraft::new(Arc::clone(&store), conversation_id, &turn.reply_prefix);
            let mut timer = GenerationTimer::new(backend.kind(), history.len(), telemetry);

            if cancel.is_cancelled() {
                tracing::debug!(%task_id, "cancelled before any output");
                draft.commit();
                timer.finish();
                yield TaskEvent::Aborted;
                return;
            }

            if !turn.reply_prefix.is_empty() {
                yield TaskEvent::Fragment(turn.reply_prefix.clone());
            }

            let request_id = task_id.to_string();
            let mut fragments = backend.generate(GenerationRequest {
                request_id: request_id.clone(),
                history,
                reply_prefix: turn.reply_prefix,
                params,
            });

            loop {
                // Stop pulling as soon as cancellation is observed, even while
                // the backend is still working on the next fragment.
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = fragments.next() => Some(next),
                };

                match step {
                    None => {
                        backend.abort(&request_id);
                        drop(fragments);
                        tracing::debug!(%task_id, "generation cancelled");
                        draft.commit();
                        timer.finish();
                        yield TaskEvent::Aborted;
                        return;
                    }
                    Some(Some(Ok(fragment))) => {
                        timer.mark_fragment();
                        draft.push(&fragment);
                        yield TaskEvent::Fragment(fragment);
                    }
                    Some(Some(Err(e))) => {
                        tracing::error!(%task_id, error = %e, "backend failed");
                        draft.commit();
                        timer.finish();
                        yield TaskEvent::Error(e.to_string());
                        return;
                    }
                    Some(None) => {
                        draft.commit();
                        timer.finish();
                        yield TaskEvent::Finished;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instruct_engine::{BackendKind, Role, SamplingDefaults};
    use instruct_runtime::{LogTelemetry, MockBackend, MockConfig, NoopTelemetry};
    use serde_json::json;
    use std::time::Duration;

    fn params(max_new_tokens: u32) -> SamplingParams {
        BackendKind::Mock
            .validate_sampling(&json!({ "max_new_tokens": max_new_tokens }), &SamplingDefaults::default())
            .unwrap()
    }

    fn task(prompt: &str, prefix: &str) -> GenerationTask {
        GenerationTask {
            task_id: TaskId::new(),
            conversation_id: "c".to_string(),
            turn: UserTurn {
                system_prompt: Some("sys".to_string()),
                prompt: prompt.to_string(),
                reply_prefix: prefix.to_string(),
                attachments: Vec::new(),
            },
            params: params(100),
        }
    }

    fn backend(config: MockConfig) -> Arc<dyn GenerationBackend> {
        Arc::new(MockBackend::new(
            BackendKind::Mock,
            config.with_fragment_delay(Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn finished_run_commits_reply() {
        let store = Arc::new(ConversationStore::new());
        let log = LogTelemetry::new();
        let events: Vec<TaskEvent> = task("hello there", "")
            .run(
                backend(MockConfig::default()),
                Arc::clone(&store),
                Arc::new(log.clone()),
                CancellationToken::new(),
            )
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                TaskEvent::Fragment("hello".into()),
                TaskEvent::Fragment(" there".into()),
                TaskEvent::Finished,
            ]
        );
        let history = store.history("c");
        let roles: Vec<Role> = history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(history[2].content, "hello there");
        assert_eq!(log.last_metrics().unwrap().fragments, 2);
    }

    #[tokio::test]
    async fn reply_prefix_is_first_fragment_and_part_of_reply() {
        let store = Arc::new(ConversationStore::new());
        let events: Vec<TaskEvent> = task("a b", "Sure:")
            .run(
                backend(MockConfig::default()),
                Arc::clone(&store),
                Arc::new(NoopTelemetry),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(events[0], TaskEvent::Fragment("Sure:".into()));
        assert_eq!(store.history("c")[2].content, "Sure: a b");
    }

    #[tokio::test]
    async fn cancelled_before_start_yields_only_aborted() {
        let store = Arc::new(ConversationStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<TaskEvent> = task("a b c", "")
            .run(backend(MockConfig::default()), Arc::clone(&store), Arc::new(NoopTelemetry), cancel)
            .collect()
            .await;
        assert_eq!(events, vec![TaskEvent::Aborted]);
        let history = store.history("c");
        assert_eq!(history.last().unwrap().role, Role::Assistant);
        assert_eq!(history.last().unwrap().content, "");
    }

    #[tokio::test]
    async fn cancellation_mid_stream_keeps_partial_reply() {
        let store = Arc::new(ConversationStore::new());
        let cancel = CancellationToken::new();
        let stream = task("a b c d e", "").run(
            backend(MockConfig::default()),
            Arc::clone(&store),
            Arc::new(NoopTelemetry),
            cancel.clone(),
        );
        futures::pin_mut!(stream);

        assert_eq!(stream.next().await, Some(TaskEvent::Fragment("a".into())));
        assert_eq!(stream.next().await, Some(TaskEvent::Fragment(" b".into())));
        cancel.cancel();
        assert_eq!(stream.next().await, Some(TaskEvent::Aborted));
        assert_eq!(stream.next().await, None);
        assert_eq!(store.history("c").last().unwrap().content, "a b");
    }

    #[tokio::test]
    async fn backend_error_keeps_produced_fragments() {
        let store = Arc::new(ConversationStore::new());
        let events: Vec<TaskEvent> = task("a b c d", "")
            .run(
                backend(MockConfig::default().failing_after(2)),
                Arc::clone(&store),
                Arc::new(NoopTelemetry),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], TaskEvent::Error(_)));
        assert_eq!(store.history("c").last().unwrap().content, "a b");
    }

    #[tokio::test]
    async fn dropped_stream_commits_once() {
        let store = Arc::new(ConversationStore::new());
        {
            let stream = task("a b c", "").run(
                backend(MockConfig::default()),
                Arc::clone(&store),
                Arc::new(NoopTelemetry),
                CancellationToken::new(),
            );
            futures::pin_mut!(stream);
            stream.next().await;
        }
        let history = store.history("c");
        let assistants = history.iter().filter(|t| t.role == Role::Assistant).count();
        assert_eq!(assistants, 1);
        assert_eq!(history.last().unwrap().content, "a");
    }
}
