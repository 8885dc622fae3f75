use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;
use twig_llm::LanguageModelProvider;

use crate::config::GenerationConfig;
use crate::coordinator::{Generation, StreamCoordinator};
use crate::deletion::Deletion;
use crate::editor::Edit;
use crate::error::Result;
use crate::event::ConversationEvent;
use crate::part::Part;
use crate::persistence::{ConversationSnapshot, PersistenceGateway};
use crate::record::{ConversationRecord, GenerationOutcome, GenerationStatus};
use crate::tree::{BranchId, Role, VersionId};

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Shared state (between the handle and spawned generation tasks)
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) record: Mutex<ConversationRecord>,
    pub(crate) provider: Arc<LanguageModelProvider>,
    pub(crate) gateway: Arc<dyn PersistenceGateway>,
    pub(crate) config: GenerationConfig,
    events: broadcast::Sender<ConversationEvent>,
    /// Held from snapshot to stored, so saves land in mutation order.
    saving: tokio::sync::Mutex<()>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Store the current snapshot. Failures are logged and announced but the
    /// in-memory record stays authoritative.
    pub(crate) async fn persist(&self) {
        let _saving = self.saving.lock().await;
        let snapshot = self.record.lock().snapshot();
        if let Err(err) = self.gateway.save_conversation(&snapshot).await {
            warn!(conversation_id = %snapshot.id, error = %err, "failed to save conversation");
            self.emit(ConversationEvent::PersistenceFailed {
                error: err.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Handle to one live conversation.
///
/// Cheap to clone; all clones share the same record. Every command applies
/// its mutation under one lock acquisition, then broadcasts a
/// [`ConversationEvent`] and stores a snapshot through the gateway.
#[derive(Clone)]
pub struct Conversation {
    shared: Arc<Shared>,
}

impl Conversation {
    pub fn new(
        record: ConversationRecord,
        provider: Arc<LanguageModelProvider>,
        gateway: Arc<dyn PersistenceGateway>,
        config: GenerationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                record: Mutex::new(record),
                provider,
                gateway,
                config,
                events,
                saving: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.events.subscribe()
    }

    // -- queries --

    pub fn id(&self) -> String {
        self.shared.record.lock().id().to_string()
    }

    pub fn title(&self) -> Option<String> {
        self.shared.record.lock().title().map(str::to_string)
    }

    pub fn current_path(&self) -> Vec<BranchId> {
        self.shared.record.lock().current_path().to_vec()
    }

    pub fn generation_status(&self) -> GenerationStatus {
        self.shared.record.lock().generation_status()
    }

    pub fn has_error(&self) -> bool {
        self.shared.record.lock().has_error()
    }

    pub fn path_text(&self) -> String {
        self.shared.record.lock().path_text()
    }

    /// Active content of `branch_id`.
    pub fn content(&self, branch_id: &BranchId) -> Option<Vec<Part>> {
        let record = self.shared.record.lock();
        let branch = record.tree().branch(branch_id)?;
        Some(branch.current_version().parts().to_vec())
    }

    /// `(active index, version count)` of `branch_id`.
    pub fn version_position(&self, branch_id: &BranchId) -> Option<(usize, usize)> {
        let record = self.shared.record.lock();
        let branch = record.tree().branch(branch_id)?;
        Some((branch.current_version_index(), branch.version_count()))
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.shared.record.lock().snapshot()
    }

    /// Run `f` against the record under its lock.
    pub fn read<T>(&self, f: impl FnOnce(&ConversationRecord) -> T) -> T {
        f(&self.shared.record.lock())
    }

    // -- commands --

    /// Append a user turn and stream a reply to it.
    pub async fn send_message(&self, parts: Vec<Part>) -> Result<Generation> {
        let generation = {
            let mut record = self.shared.record.lock();
            record.ensure_idle("send a message")?;
            record.add_branch(Role::User, parts)?;
            let reply = record.add_branch(Role::Model, vec![Part::placeholder()])?;
            StreamCoordinator::launch(&self.shared, &mut record, &reply)?
        };
        self.changed().await;
        Ok(generation)
    }

    pub async fn add_branch(&self, role: Role, parts: Vec<Part>) -> Result<BranchId> {
        let branch_id = self.shared.record.lock().add_branch(role, parts)?;
        self.changed().await;
        Ok(branch_id)
    }

    pub async fn add_version(
        &self,
        branch_id: &BranchId,
        parts: Vec<Part>,
        inherit_continuation: bool,
    ) -> Result<VersionId> {
        let version_id =
            self.shared
                .record
                .lock()
                .add_version(branch_id, parts, inherit_continuation)?;
        self.changed().await;
        Ok(version_id)
    }

    /// Edit a user message. Returns the reply generation when the content
    /// actually changed.
    pub async fn edit_user_message(
        &self,
        branch_id: &BranchId,
        parts: Vec<Part>,
    ) -> Result<Option<Generation>> {
        let generation = {
            let mut record = self.shared.record.lock();
            match record.edit_user_message(branch_id, parts)? {
                Edit::Unchanged => return Ok(None),
                Edit::Edited { .. } => None,
                Edit::NeedsReply { reply_branch, .. } => Some(StreamCoordinator::launch(
                    &self.shared,
                    &mut record,
                    &reply_branch,
                )?),
            }
        };
        self.changed().await;
        Ok(generation)
    }

    pub async fn edit_ai_message(&self, branch_id: &BranchId, parts: Vec<Part>) -> Result<Edit> {
        let edit = self.shared.record.lock().edit_ai_message(branch_id, parts)?;
        if edit != Edit::Unchanged {
            self.changed().await;
        }
        Ok(edit)
    }

    /// Stream a fresh reply into a new version of a model branch.
    pub async fn regenerate(&self, branch_id: &BranchId) -> Result<Generation> {
        let generation = {
            let mut record = self.shared.record.lock();
            record.regenerate(branch_id)?;
            StreamCoordinator::launch(&self.shared, &mut record, branch_id)?
        };
        self.changed().await;
        Ok(generation)
    }

    pub async fn switch_version(&self, branch_id: &BranchId, direction: i32) -> Result<()> {
        self.shared
            .record
            .lock()
            .switch_version(branch_id, direction)?;
        self.changed().await;
        Ok(())
    }

    pub async fn delete_version(&self, branch_id: &BranchId) -> Result<Deletion> {
        let deletion = self.shared.record.lock().delete_version(branch_id)?;
        self.changed().await;
        Ok(deletion)
    }

    pub async fn delete_branch(&self, branch_id: &BranchId) -> Result<usize> {
        let removed = self.shared.record.lock().delete_branch(branch_id)?;
        self.changed().await;
        Ok(removed)
    }

    /// Stream a reply into the active version of an existing model branch.
    pub async fn start_generation(&self, branch_id: &BranchId) -> Result<Generation> {
        let generation = {
            let mut record = self.shared.record.lock();
            record.ensure_idle("start a generation")?;
            StreamCoordinator::launch(&self.shared, &mut record, branch_id)?
        };
        self.changed().await;
        Ok(generation)
    }

    /// Stop the in-flight generation. The record is settled before this
    /// returns. Returns `false` when nothing was running.
    pub async fn cancel_generation(&self) -> bool {
        let cancelled = self
            .shared
            .record
            .lock()
            .cancel_generation(&self.shared.config);
        let Some(branch_id) = cancelled else {
            return false;
        };

        self.shared.emit(ConversationEvent::GenerationFinished {
            branch_id,
            outcome: GenerationOutcome::Cancelled,
        });
        self.shared.emit(ConversationEvent::StatusChanged {
            status: GenerationStatus::Idle,
        });
        self.shared.persist().await;
        true
    }

    pub async fn acknowledge_error(&self) {
        self.shared.record.lock().acknowledge_error();
        self.changed().await;
    }

    async fn changed(&self) {
        self.shared.emit(ConversationEvent::TreeChanged);
        self.shared.persist().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Poll;
    use std::time::Duration;

    use async_trait::async_trait;
    use twig_llm::{
        CancellationToken, FinishReason, GenerateRequest, LanguageModel, LanguageModelBackend,
        LanguageModelProviderBackend, Response, StreamEvent, Usage,
    };

    use super::*;
    use crate::error::Error;
    use crate::persistence::{ConversationSummary, InMemoryGateway, PersistenceError};

    /// How a scripted reply behaves.
    #[derive(Clone)]
    pub(crate) enum Script {
        /// Yield these events, then end the stream.
        Events(Vec<StreamEvent>),
        /// Yield these events, then stall until cancelled and report
        /// `Aborted`.
        Stall(Vec<StreamEvent>),
        /// Fail the request outright.
        Fail(String),
        /// Panic on the first poll of the stream.
        Panic(String),
    }

    /// Provider whose models replay queued scripts, one per request, and
    /// record the requests they received.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedProvider {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        pub(crate) requests: Arc<Mutex<Vec<GenerateRequest>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn push(&self, script: Script) -> &Self {
            self.scripts.lock().push_back(script);
            self
        }
    }

    impl LanguageModelProviderBackend for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self, model_id: &str) -> LanguageModel {
            LanguageModel::new(ScriptedModel {
                model_id: model_id.to_string(),
                provider: self.clone(),
            })
        }
    }

    struct ScriptedModel {
        model_id: String,
        provider: ScriptedProvider,
    }

    impl LanguageModelBackend for ScriptedModel {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn provider(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: GenerateRequest, signal: CancellationToken) -> Response {
            self.provider.requests.lock().push(request);
            let script = self
                .provider
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Events(Vec::new()));

            match script {
                Script::Events(events) => {
                    Response::new(futures::stream::iter(events.into_iter().map(Ok)))
                }
                Script::Stall(events) => Response::new(async_stream::stream! {
                    for event in events {
                        yield Ok(event);
                    }
                    signal.cancelled().await;
                    yield Err(twig_llm::Error::Aborted);
                }),
                Script::Fail(message) => Response::error(twig_llm::Error::Other(message)),
                Script::Panic(message) => Response::new(futures::stream::poll_fn(
                    move |_| -> Poll<Option<std::result::Result<StreamEvent, twig_llm::Error>>> {
                        panic!("{message}")
                    },
                )),
            }
        }
    }

    /// Gateway that rejects every save.
    struct FailingGateway;

    #[async_trait]
    impl PersistenceGateway for FailingGateway {
        async fn save_conversation(&self, _: &ConversationSnapshot) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::InvalidSnapshot("disk full".into()))
        }

        async fn load_conversation(
            &self,
            _: &str,
        ) -> std::result::Result<Option<ConversationSnapshot>, PersistenceError> {
            Ok(None)
        }

        async fn delete_conversation(&self, _: &str) -> std::result::Result<bool, PersistenceError> {
            Ok(false)
        }

        async fn list_conversations(
            &self,
        ) -> std::result::Result<Vec<ConversationSummary>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    /// In-memory gateway whose first save is slow.
    #[derive(Default)]
    struct SlowFirstSave {
        inner: InMemoryGateway,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceGateway for SlowFirstSave {
        async fn save_conversation(
            &self,
            snapshot: &ConversationSnapshot,
        ) -> std::result::Result<(), PersistenceError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save_conversation(snapshot).await
        }

        async fn load_conversation(
            &self,
            id: &str,
        ) -> std::result::Result<Option<ConversationSnapshot>, PersistenceError> {
            self.inner.load_conversation(id).await
        }

        async fn delete_conversation(&self, id: &str) -> std::result::Result<bool, PersistenceError> {
            self.inner.delete_conversation(id).await
        }

        async fn list_conversations(
            &self,
        ) -> std::result::Result<Vec<ConversationSummary>, PersistenceError> {
            self.inner.list_conversations().await
        }
    }

    fn text(s: &str) -> Vec<Part> {
        vec![Part::text(s)]
    }

    fn delta(s: &str) -> StreamEvent {
        StreamEvent::TextDelta(s.to_string())
    }

    fn finish() -> StreamEvent {
        StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: Some(Usage {
                input_tokens: 4,
                output_tokens: 2,
                ..Usage::default()
            }),
        }
    }

    fn conversation(provider: &ScriptedProvider) -> (Conversation, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let conversation = Conversation::new(
            ConversationRecord::new("scripted-1"),
            Arc::new(LanguageModelProvider::new(provider.clone())),
            gateway.clone(),
            GenerationConfig::default(),
        );
        (conversation, gateway)
    }

    #[tokio::test]
    async fn streamed_chunks_are_concatenated() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Events(vec![delta("He"), delta("llo"), finish()]));
        let (conversation, gateway) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        assert_eq!(generation.wait().await, GenerationOutcome::Completed);

        assert_eq!(conversation.content(&reply), Some(text("Hello")));
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);
        assert!(!conversation.has_error());
        assert_eq!(conversation.title().as_deref(), Some("hi"));

        let stored = gateway
            .load_conversation(&conversation.id())
            .await
            .expect("load")
            .expect("stored");
        let restored = ConversationRecord::from_snapshot(stored);
        assert_eq!(restored.path_text(), "hi\n\nHello");
        let usage = restored
            .tree()
            .branch(&reply)
            .and_then(|b| b.current_version().usage().cloned());
        assert_eq!(usage.map(|u| u.output_tokens), Some(2));
    }

    #[tokio::test]
    async fn request_carries_the_history_before_the_reply() {
        let provider = ScriptedProvider::default();
        provider
            .push(Script::Events(vec![delta("first answer")]))
            .push(Script::Events(vec![delta("second answer")]));
        let (conversation, _) = conversation(&provider);

        conversation.send_message(text("one")).await.expect("send").wait().await;
        conversation.send_message(text("two")).await.expect("send").wait().await;

        let requests = provider.requests.lock();
        let last = requests.last().expect("request");
        let texts: Vec<String> = last.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, ["one", "first answer", "two"]);
    }

    #[tokio::test]
    async fn sending_while_generating_is_rejected() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Stall(vec![delta("partial")]));
        let (conversation, _) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let err = conversation.send_message(text("again")).await.expect_err("busy");
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(conversation.current_path().len(), 2);

        assert!(conversation.cancel_generation().await);
        assert_eq!(generation.wait().await, GenerationOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_keeps_partial_content() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Stall(vec![delta("partial")]));
        let (conversation, _) = conversation(&provider);
        let mut events = conversation.subscribe();

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        loop {
            if let Ok(ConversationEvent::ContentAppended { .. }) = events.recv().await {
                break;
            }
        }

        assert!(conversation.cancel_generation().await);
        assert_eq!(conversation.content(&reply), Some(text("partial")));
        assert!(!conversation.has_error());
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);
        generation.wait().await;
        assert_eq!(conversation.content(&reply), Some(text("partial")));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_provider_times_out() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Stall(Vec::new()));
        let (conversation, _) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        assert_eq!(generation.wait().await, GenerationOutcome::TimedOut);

        let config = GenerationConfig::default();
        assert_eq!(conversation.content(&reply), Some(text(&config.timeout_message())));
        assert!(conversation.has_error());
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);

        conversation.acknowledge_error().await;
        assert!(!conversation.has_error());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_is_disarmed_by_the_first_chunk() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Stall(vec![delta("thinking")]));
        let (conversation, _) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        tokio::time::sleep(GenerationConfig::default().first_chunk_timeout * 2).await;

        assert_eq!(conversation.generation_status(), GenerationStatus::Receiving);
        assert!(conversation.cancel_generation().await);
        assert_eq!(generation.wait().await, GenerationOutcome::Cancelled);
        assert_eq!(conversation.content(&reply), Some(text("thinking")));
        assert!(!conversation.has_error());
    }

    #[tokio::test]
    async fn provider_errors_become_content() {
        let provider = ScriptedProvider::default();
        provider
            .push(Script::Fail("overloaded".into()))
            .push(Script::Events(vec![delta("par"), StreamEvent::Error("reset".into())]));
        let (conversation, _) = conversation(&provider);
        let config = GenerationConfig::default();

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        assert!(generation.wait().await.is_error());
        assert_eq!(conversation.content(&reply), Some(text(&config.error_message("overloaded"))));
        assert!(conversation.has_error());

        let generation = conversation.regenerate(&reply).await.expect("regenerate");
        generation.wait().await;
        assert_eq!(conversation.content(&reply), Some(text(&config.error_message("reset"))));
        assert_eq!(conversation.version_position(&reply), Some((1, 2)));
    }

    #[tokio::test]
    async fn aborted_without_cancellation_is_a_provider_error() {
        struct Aborting;

        impl LanguageModelProviderBackend for Aborting {
            fn name(&self) -> &str {
                "aborting"
            }

            fn model(&self, _: &str) -> LanguageModel {
                LanguageModel::new(AbortingModel)
            }
        }

        struct AbortingModel;

        impl LanguageModelBackend for AbortingModel {
            fn model_id(&self) -> &str {
                "aborting"
            }

            fn provider(&self) -> &str {
                "aborting"
            }

            fn generate(&self, _: GenerateRequest, _: CancellationToken) -> Response {
                Response::error(twig_llm::Error::Aborted)
            }
        }

        let conversation = Conversation::new(
            ConversationRecord::new("aborting"),
            Arc::new(LanguageModelProvider::new(Aborting)),
            Arc::new(InMemoryGateway::new()),
            GenerationConfig::default(),
        );
        let generation = conversation.send_message(text("hi")).await.expect("send");
        let outcome = generation.wait().await;
        assert!(matches!(outcome, GenerationOutcome::Failed { .. }));
        assert!(conversation.has_error());
    }

    #[tokio::test]
    async fn regenerating_a_user_branch_fails_without_mutation() {
        let provider = ScriptedProvider::default();
        let (conversation, _) = conversation(&provider);
        let user = conversation
            .add_branch(Role::User, text("hi"))
            .await
            .expect("user");

        let err = conversation.regenerate(&user).await.expect_err("user branch");
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(conversation.version_position(&user), Some((0, 1)));
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);
        assert!(provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn editing_a_user_message_hides_and_restores_the_old_reply() {
        let provider = ScriptedProvider::default();
        provider
            .push(Script::Events(vec![delta("old reply")]))
            .push(Script::Events(vec![delta("new reply")]));
        let (conversation, _) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let old_reply = generation.branch_id().clone();
        generation.wait().await;
        let user = conversation.current_path()[0].clone();

        let unchanged = conversation
            .edit_user_message(&user, text("hi"))
            .await
            .expect("edit");
        assert!(unchanged.is_none());

        let generation = conversation
            .edit_user_message(&user, text("hi there"))
            .await
            .expect("edit")
            .expect("reply");
        let new_reply = generation.branch_id().clone();
        generation.wait().await;
        assert_eq!(conversation.current_path(), vec![user.clone(), new_reply.clone()]);
        assert_eq!(conversation.content(&new_reply), Some(text("new reply")));

        conversation.switch_version(&user, -1).await.expect("switch");
        assert_eq!(conversation.current_path(), vec![user, old_reply.clone()]);
        assert_eq!(conversation.content(&old_reply), Some(text("old reply")));
    }

    #[tokio::test]
    async fn path_is_locked_while_streaming() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Stall(Vec::new()));
        let (conversation, _) = conversation(&provider);
        let generation = conversation.send_message(text("hi")).await.expect("send");
        let user = conversation.current_path()[0].clone();

        assert!(conversation.delete_branch(&user).await.is_err());
        assert!(conversation.add_version(&user, text("x"), false).await.is_err());
        assert_eq!(conversation.current_path().len(), 2);

        conversation.cancel_generation().await;
        generation.wait().await;
        assert_eq!(conversation.delete_branch(&user).await.expect("delete"), 2);
        assert!(conversation.current_path().is_empty());
    }

    #[tokio::test]
    async fn events_follow_the_generation_protocol() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Events(vec![delta("a"), delta("b")]));
        let (conversation, _) = conversation(&provider);
        let mut events = conversation.subscribe();

        conversation.send_message(text("hi")).await.expect("send").wait().await;

        let mut protocol = Vec::new();
        let mut tree_changed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConversationEvent::TreeChanged => tree_changed = true,
                ConversationEvent::StatusChanged { status } => protocol.push(format!("{status:?}")),
                ConversationEvent::ContentAppended { .. } => protocol.push("content".into()),
                ConversationEvent::GenerationFinished { outcome, .. } => {
                    assert_eq!(outcome, GenerationOutcome::Completed);
                    protocol.push("finished".into());
                }
                ConversationEvent::PersistenceFailed { error } => panic!("save failed: {error}"),
            }
        }

        assert!(tree_changed);
        assert_eq!(
            protocol,
            ["Sending", "Receiving", "content", "content", "finished", "Idle"]
        );
    }

    #[tokio::test]
    async fn persistence_failures_do_not_roll_back() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Events(vec![delta("hello")]));
        let conversation = Conversation::new(
            ConversationRecord::new("scripted-1"),
            Arc::new(LanguageModelProvider::new(provider.clone())),
            Arc::new(FailingGateway),
            GenerationConfig::default(),
        );
        let mut events = conversation.subscribe();

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        generation.wait().await;

        assert_eq!(conversation.content(&reply), Some(text("hello")));
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, ConversationEvent::PersistenceFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn a_panicking_backend_still_settles_the_record() {
        let provider = ScriptedProvider::default();
        provider
            .push(Script::Panic("backend exploded".into()))
            .push(Script::Events(vec![delta("recovered")]));
        let (conversation, gateway) = conversation(&provider);
        let config = GenerationConfig::default();

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        assert_eq!(
            generation.wait().await,
            GenerationOutcome::Failed {
                message: "backend exploded".into()
            }
        );
        assert_eq!(conversation.generation_status(), GenerationStatus::Idle);
        assert!(conversation.has_error());
        assert_eq!(
            conversation.content(&reply),
            Some(text(&config.error_message("backend exploded")))
        );
        let stored = gateway
            .load_conversation(&conversation.id())
            .await
            .expect("load")
            .expect("stored");
        assert!(stored.has_error);

        let generation = conversation.send_message(text("again")).await.expect("send");
        assert_eq!(generation.wait().await, GenerationOutcome::Completed);
        assert!(!conversation.has_error());
    }

    #[tokio::test]
    async fn an_empty_reply_is_replaced_by_a_marker() {
        let provider = ScriptedProvider::default();
        provider.push(Script::Events(vec![finish()]));
        let (conversation, _) = conversation(&provider);

        let generation = conversation.send_message(text("hi")).await.expect("send");
        let reply = generation.branch_id().clone();
        assert_eq!(generation.wait().await, GenerationOutcome::Completed);

        let marker = GenerationConfig::default().empty_reply_marker;
        assert_eq!(conversation.content(&reply), Some(text(&marker)));
        assert!(!conversation.has_error());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_saves_land_in_mutation_order() {
        let provider = ScriptedProvider::default();
        let gateway = Arc::new(SlowFirstSave::default());
        let conversation = Conversation::new(
            ConversationRecord::new("scripted-1"),
            Arc::new(LanguageModelProvider::new(provider)),
            gateway.clone(),
            GenerationConfig::default(),
        );

        let (first, second) = tokio::join!(
            conversation.add_branch(Role::User, text("question")),
            conversation.add_branch(Role::Model, text("answer")),
        );
        first.expect("user");
        second.expect("model");

        let stored = gateway
            .load_conversation(&conversation.id())
            .await
            .expect("load")
            .expect("stored");
        assert_eq!(stored.tree.branch_count(), 2);
        assert_eq!(stored, conversation.snapshot());
    }
}
