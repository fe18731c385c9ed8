//! Per-connection streaming protocol.
//!
//! A [`SessionProtocol`] reads client messages, turns each generation request
//! into a task and relays the task's progress as [`Frame`]s:
//!
//! ```text
//! starting -> waiting* -> running* -> finished | abort | error
//! ```
//!
//! Requests are served one at a time per connection. While a task is in
//! flight the inbound side keeps being read: inline aborts apply immediately
//! and further requests are queued behind the current one. When the
//! connection goes away the in-flight task is dropped, which releases its
//! queue entry, execution slot and cancellation entry through their guards.

use std::collections::VecDeque;

use futures::{Sink, SinkExt, Stream, StreamExt};
use instruct_engine::SamplingParams;
use instruct_scheduler::{Admission, CancellationGuard, QueueTicket, TaskId, TaskState};
use tracing::Instrument;
use uuid::Uuid;

use crate::generation::{GenerationTask, TaskEvent, UserTurn};
use crate::models::{ClientMessage, Frame, GenerateRequest};
use crate::state::AppState;

enum Flow {
    Continue,
    Closed,
}

/// Drives one client connection, independent of the transport.
pub struct SessionProtocol {
    state: AppState,
    conversation_id: String,
    pending: VecDeque<String>,
}

impl SessionProtocol {
    /// A session with a fresh conversation.
    pub fn new(state: AppState) -> Self {
        Self::with_conversation(state, Uuid::new_v4().to_string())
    }

    pub fn with_conversation(state: AppState, conversation_id: impl Into<String>) -> Self {
        Self {
            state,
            conversation_id: conversation_id.into(),
            pending: VecDeque::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Serve until the inbound side ends or a frame cannot be delivered.
    /// The conversation is forgotten on return.
    pub async fn run<I, O>(mut self, mut inbound: I, mut outbound: O)
    where
        I: Stream<Item = String> + Unpin + Send,
        O: Sink<Frame> + Unpin + Send,
    {
        let span = tracing::info_span!("session", conversation_id = %self.conversation_id);
        async {
            tracing::info!("session opened");
            loop {
                let text = match self.pending.pop_front() {
                    Some(text) => text,
                    None => match inbound.next().await {
                        Some(text) => text,
                        None => break,
                    },
                };
                if let Flow::Closed = self.handle_message(&text, &mut inbound, &mut outbound).await {
                    break;
                }
            }
            self.state.conversations.forget(&self.conversation_id);
            tracing::info!("session closed");
        }
        .instrument(span)
        .await
    }

    async fn handle_message<I, O>(&mut self, text: &str, inbound: &mut I, outbound: &mut O) -> Flow
    where
        I: Stream<Item = String> + Unpin + Send,
        O: Sink<Frame> + Unpin + Send,
    {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Abort { task_id }) => {
                self.apply_abort(&task_id);
                Flow::Continue
            }
            Ok(ClientMessage::Generate(request)) => self.serve(*request, inbound, outbound).await,
            Err(e) => {
                tracing::warn!(error = %e, "rejected request");
                send(outbound, Frame::error(None, e.to_string())).await
            }
        }
    }

    fn apply_abort(&self, task_id: &str) {
        match task_id.parse::<TaskId>() {
            Ok(task_id) => {
                self.state.abort(task_id);
            }
            Err(_) => tracing::warn!(task_id, "abort for malformed task id ignored"),
        }
    }

    async fn serve<I, O>(&mut self, request: GenerateRequest, inbound: &mut I, outbound: &mut O) -> Flow
    where
        I: Stream<Item = String> + Unpin + Send,
        O: Sink<Frame> + Unpin + Send,
    {
        let (turn, params) =
            match request.prepare(self.state.backend.kind(), &self.state.config.sampling) {
                Ok(prepared) => prepared,
                Err(e) => {
                    tracing::warn!(error = %e, "rejected request");
                    return send(outbound, Frame::error(None, e.to_string())).await;
                }
            };

        let task_id = TaskId::new();
        let span = tracing::debug_span!("task", %task_id);
        let admitted = span.in_scope(|| {
            let guard = self.state.cancellations.register(task_id)?;
            let ticket = self.state.queue.enqueue(task_id)?;
            Ok::<_, instruct_scheduler::SchedulerError>((guard, ticket))
        });
        let (guard, ticket) = match admitted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "could not schedule task");
                return send(outbound, Frame::error(Some(task_id), e.to_string())).await;
            }
        };

        if let Flow::Closed = send(outbound, Frame::starting(task_id)).await {
            return Flow::Closed;
        }

        let frames = task_frames(
            self.state.clone(),
            self.conversation_id.clone(),
            guard,
            ticket,
            turn,
            params,
        );
        futures::pin_mut!(frames);

        async {
            loop {
                tokio::select! {
                    frame = frames.next() => match frame {
                        Some(frame) => {
                            let terminal = frame.is_terminal();
                            if let Flow::Closed = send(outbound, frame).await {
                                tracing::warn!("client gone, dropping task");
                                return Flow::Closed;
                            }
                            if terminal {
                                return Flow::Continue;
                            }
                        }
                        None => return Flow::Continue,
                    },
                    text = inbound.next() => match text {
                        Some(text) => match ClientMessage::parse(&text) {
                            Ok(ClientMessage::Abort { task_id }) => self.apply_abort(&task_id),
                            _ => self.pending.push_back(text),
                        },
                        None => {
                            tracing::warn!("connection lost, dropping task");
                            return Flow::Closed;
                        }
                    },
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn send<O>(outbound: &mut O, frame: Frame) -> Flow
where
    O: Sink<Frame> + Unpin,
{
    match outbound.send(frame).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Closed,
    }
}

/// Frames for one task, from admission to its single terminal frame.
///
/// Every resource the task holds (execution slot, cancellation entry) is
/// released before the terminal frame is yielded.
fn task_frames(
    state: AppState,
    conversation_id: String,
    guard: CancellationGuard,
    ticket: QueueTicket,
    turn: UserTurn,
    params: SamplingParams,
) -> impl Stream<Item = Frame> + Send + 'static {
    async_stream::stream! {
        let task_id = guard.task_id();
        let cancel = guard.token();
        let mut lifecycle = TaskState::Waiting;

        let mut slot = None;
        {
            let admission = ticket.dequeue_when_admitted(cancel.clone());
            futures::pin_mut!(admission);
            while let Some(step) = admission.next().await {
                match step {
                    Admission::Waiting { rank } => yield Frame::waiting(task_id, rank),
                    Admission::Admitted(admitted) => {
                        slot = Some(admitted);
                        break;
                    }
                    Admission::Abandoned => break,
                }
            }
        }
        let Some(slot) = slot else {
            tracing::debug!(%task_id, "abandoned while waiting");
            guard.consume();
            drop(guard);
            yield conclude(task_id, &mut lifecycle, TaskState::Aborted, None);
            return;
        };
        lifecycle = match lifecycle.advance(TaskState::Executing) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "task cannot start");
                drop(slot);
                drop(guard);
                yield Frame::error(Some(task_id), e.to_string());
                return;
            }
        };
        tracing::debug!(%task_id, order = slot.admission_order(), "executing");

        let task = GenerationTask {
            task_id,
            conversation_id,
            turn,
            params,
        };
        let mut events = Box::pin(task.run(
            state.backend.clone(),
            state.conversations.clone(),
            state.telemetry.clone(),
            cancel,
        ));

        let mut outcome = (
            TaskState::Error,
            Some("generation ended without an outcome".to_string()),
        );
        while let Some(event) = events.next().await {
            match event {
                TaskEvent::Fragment(text) => yield Frame::running(task_id, text),
                TaskEvent::Finished => {
                    outcome = (TaskState::Finished, None);
                    break;
                }
                TaskEvent::Aborted => {
                    guard.consume();
                    outcome = (TaskState::Aborted, None);
                    break;
                }
                TaskEvent::Error(message) => {
                    outcome = (TaskState::Error, Some(message));
                    break;
                }
            }
        }
        drop(events);
        slot.complete();
        drop(guard);
        let (next, message) = outcome;
        let terminal = conclude(task_id, &mut lifecycle, next, message);
        tracing::debug!(%task_id, state = %lifecycle, "task done");
        yield terminal;
    }
}

/// Move `lifecycle` into the terminal state `next` and build its frame.
/// A transition the lifecycle forbids ends the task in ERROR instead.
fn conclude(
    task_id: TaskId,
    lifecycle: &mut TaskState,
    next: TaskState,
    message: Option<String>,
) -> Frame {
    match lifecycle.advance(next) {
        Ok(TaskState::Finished) => {
            *lifecycle = TaskState::Finished;
            Frame::finished(task_id)
        }
        Ok(TaskState::Aborted) => {
            *lifecycle = TaskState::Aborted;
            Frame::aborted(task_id)
        }
        Ok(state) => {
            *lifecycle = state;
            Frame::error(Some(task_id), message.unwrap_or_default())
        }
        Err(e) => {
            tracing::error!(%task_id, error = %e, "illegal task transition");
            *lifecycle = TaskState::Error;
            Frame::error(Some(task_id), e.to_string())
        }
    }
}
