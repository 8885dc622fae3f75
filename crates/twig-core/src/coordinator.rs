use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use twig_llm::{GenerateRequest, LanguageModel, StreamEvent, Usage};

use crate::conversation::Shared;
use crate::convert::to_messages;
use crate::error::Result;
use crate::event::ConversationEvent;
use crate::part::Delta;
use crate::record::{ChunkApplied, ConversationRecord, GenerationOutcome, GenerationStatus};
use crate::tree::BranchId;

// ---------------------------------------------------------------------------
// Generation handle
// ---------------------------------------------------------------------------

/// A running generation. Dropping the handle does not stop it; use
/// [`Conversation::cancel_generation`](crate::Conversation::cancel_generation).
#[derive(Debug)]
pub struct Generation {
    seq: u64,
    branch_id: BranchId,
    handle: JoinHandle<GenerationOutcome>,
}

impl Generation {
    /// The model branch receiving the reply.
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    /// Monotonic per-record generation number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the generation task to end.
    ///
    /// The returned outcome is the one the task observed. If the generation
    /// was cancelled or superseded the record was already settled by the
    /// canceller, and the task reports `Cancelled`.
    pub async fn wait(self) -> GenerationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => GenerationOutcome::Failed {
                message: err.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// StreamCoordinator
// ---------------------------------------------------------------------------

/// Drives one reply from `sending` to `idle`.
///
/// The coordinator is a spawned task that owns the provider stream. It never
/// holds the record lock across an await: every chunk is applied under a
/// short lock, tagged with the generation's `seq` so a superseded task can
/// not write into a newer generation's target.
pub(crate) struct StreamCoordinator {
    shared: Arc<Shared>,
    seq: u64,
    branch_id: BranchId,
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

impl StreamCoordinator {
    /// Arm a generation on `record` targeting the active version of
    /// `branch_id` and spawn its task.
    ///
    /// `record` must be the guard of `shared.record`; arming happens under
    /// the caller's lock so it is atomic with whatever tree mutation created
    /// the target.
    pub(crate) fn launch(
        shared: &Arc<Shared>,
        record: &mut ConversationRecord,
        branch_id: &BranchId,
    ) -> Result<Generation> {
        let history = to_messages(record.tree().history_before(branch_id)?);
        let (seq, token) = record.begin_generation(branch_id, &shared.config)?;

        let model = shared.provider.model(record.model());
        let mut request = twig_llm::request();
        request
            .messages(history)
            .meta("conversation_id", record.id());
        let request = request.build();

        debug!(
            conversation_id = %record.id(),
            generation = seq,
            branch_id = %branch_id,
            model = %model.model_id(),
            "generation started"
        );

        let coordinator = StreamCoordinator {
            shared: Arc::clone(shared),
            seq,
            branch_id: branch_id.clone(),
            token,
            timed_out: Arc::new(AtomicBool::new(false)),
        };
        let handle = tokio::spawn(coordinator.run(model, request));

        Ok(Generation {
            seq,
            branch_id: branch_id.clone(),
            handle,
        })
    }

    async fn run(self, model: LanguageModel, request: GenerateRequest) -> GenerationOutcome {
        self.shared.emit(ConversationEvent::StatusChanged {
            status: GenerationStatus::Sending,
        });
        let watchdog = tokio::spawn(watchdog(
            Arc::clone(&self.shared),
            self.seq,
            self.token.clone(),
            Arc::clone(&self.timed_out),
        ));

        // A panicking backend still settles the record as failed.
        let consumed = AssertUnwindSafe(self.consume(model, request, &watchdog))
            .catch_unwind()
            .await;
        watchdog.abort();
        let (outcome, usage) = consumed.unwrap_or_else(|panic| {
            (
                GenerationOutcome::Failed {
                    message: panic_message(&*panic),
                },
                None,
            )
        });

        if let GenerationOutcome::Failed { message } = &outcome {
            warn!(generation = self.seq, branch_id = %self.branch_id, error = %message, "generation failed");
        }
        self.finish(&outcome, usage).await;
        outcome
    }

    /// Read the provider stream until it ends, fails, or the token is
    /// cancelled.
    async fn consume(
        &self,
        model: LanguageModel,
        request: GenerateRequest,
        watchdog: &JoinHandle<()>,
    ) -> (GenerationOutcome, Option<Usage>) {
        let mut events = model.generate(request, self.token.clone()).events();
        let mut usage = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => return (self.cancelled_outcome(), None),
                event = events.next() => event,
            };

            let delta = match event {
                None => return (GenerationOutcome::Completed, usage),
                Some(Ok(StreamEvent::TextDelta(text))) if text.is_empty() => continue,
                Some(Ok(StreamEvent::TextDelta(text))) => Delta::Text(text),
                Some(Ok(StreamEvent::Image { url })) => Delta::Image(url),
                Some(Ok(StreamEvent::Finish { usage: u, .. })) => {
                    usage = u;
                    continue;
                }
                Some(Ok(StreamEvent::Error(message))) => {
                    return (GenerationOutcome::Failed { message }, None);
                }
                Some(Err(err)) if err.is_aborted() && self.token.is_cancelled() => {
                    return (self.cancelled_outcome(), None);
                }
                Some(Err(err)) => {
                    return (
                        GenerationOutcome::Failed {
                            message: err.to_string(),
                        },
                        None,
                    );
                }
            };

            let applied = self.shared.record.lock().apply_chunk(self.seq, delta.clone());
            match applied {
                Ok(ChunkApplied::First) => {
                    watchdog.abort();
                    self.shared.emit(ConversationEvent::StatusChanged {
                        status: GenerationStatus::Receiving,
                    });
                }
                Ok(ChunkApplied::More) => {}
                Ok(ChunkApplied::Stale) => return (GenerationOutcome::Cancelled, None),
                Err(err) => {
                    return (
                        GenerationOutcome::Failed {
                            message: err.to_string(),
                        },
                        None,
                    );
                }
            }
            self.shared.emit(ConversationEvent::ContentAppended {
                branch_id: self.branch_id.clone(),
                delta,
            });
        }
    }

    fn cancelled_outcome(&self) -> GenerationOutcome {
        if self.timed_out.load(Ordering::SeqCst) {
            GenerationOutcome::TimedOut
        } else {
            GenerationOutcome::Cancelled
        }
    }

    /// Apply the terminal mutation and persist. A generation that was already
    /// settled by a canceller leaves both to the canceller.
    async fn finish(&self, outcome: &GenerationOutcome, usage: Option<Usage>) {
        let finished =
            self.shared
                .record
                .lock()
                .finish_generation(self.seq, outcome, usage, &self.shared.config);
        let Some(branch_id) = finished else {
            debug!(generation = self.seq, "generation already settled");
            return;
        };

        self.shared.emit(ConversationEvent::GenerationFinished {
            branch_id,
            outcome: outcome.clone(),
        });
        self.shared.emit(ConversationEvent::StatusChanged {
            status: GenerationStatus::Idle,
        });
        self.shared.persist().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "the model backend panicked".to_string()
    }
}

/// Cancel the generation if its first chunk has not arrived within the
/// configured timeout. The check runs under the record lock, so it can not
/// race a first chunk being applied.
async fn watchdog(shared: Arc<Shared>, seq: u64, token: CancellationToken, fired: Arc<AtomicBool>) {
    tokio::time::sleep(shared.config.first_chunk_timeout).await;

    let record = shared.record.lock();
    if record.is_awaiting_first_chunk(seq) {
        debug!(
            conversation_id = %record.id(),
            generation = seq,
            timeout_secs = shared.config.first_chunk_timeout.as_secs(),
            "first chunk timed out"
        );
        fired.store(true, Ordering::SeqCst);
        token.cancel();
    }
}
