//! One open chat: its ordered messages, the draft being typed, and the
//! send-turn state machine.
//!
//! A turn goes `Idle -> Sending -> Idle | Failed`. The user's message is
//! committed before the remote call and is kept whatever happens after, so a
//! failed turn leaves half a conversation on disk rather than none. Only one
//! turn per chat may be in flight; this is enforced across every session of
//! the same chat through [`InFlightTurns`].

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::CompletionService;
use crate::error::LotusError;
use crate::models::{now_millis, Chat, Message, ModelConfig, Sender};
use crate::secrets::{SecretError, SecretStore};
use crate::state::AppState;
use crate::storage::StorageManager;

const EVENT_CAPACITY: usize = 64;

// --- Single-flight registry ---

/// Chats that currently have a turn waiting on the remote service.
#[derive(Clone, Default)]
pub struct InFlightTurns {
    chats: Arc<DashMap<Uuid, ()>>,
}

impl InFlightTurns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the chat, or returns `None` if another turn holds it.
    pub fn try_begin(&self, chat_id: Uuid) -> Option<TurnGuard> {
        match self.chats.entry(chat_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(TurnGuard {
                    chats: self.chats.clone(),
                    chat_id,
                })
            }
        }
    }

    pub fn is_in_flight(&self, chat_id: Uuid) -> bool {
        self.chats.contains_key(&chat_id)
    }
}

/// Releases the chat when dropped.
pub struct TurnGuard {
    chats: Arc<DashMap<Uuid, ()>>,
    chat_id: Uuid,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.chats.remove(&self.chat_id);
    }
}

// --- Session state ---

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Sending,
    Failed,
}

/// What the UI needs to redraw a chat screen.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub chat_id: Uuid,
    pub state: TurnState,
    pub loading: bool,
    pub last_error: Option<String>,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
    pub draft: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageAppended { message: Message },
    MessageDeleted { chat_id: Uuid, message_id: Uuid },
    StateChanged { snapshot: SessionSnapshot },
}

pub struct ChatSession {
    chat: Chat,
    // Sorted by timestamp; equal timestamps keep insertion order.
    messages: Vec<Message>,
    draft: String,
    state: TurnState,
    last_error: Option<String>,
    config: ModelConfig,
    storage: Arc<StorageManager>,
    secrets: Arc<dyn SecretStore>,
    completion: Arc<dyn CompletionService>,
    in_flight: InFlightTurns,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    /// Loads a chat and its messages. `config` is the model used for turns.
    pub async fn open(state: &AppState, chat_id: Uuid, config: ModelConfig) -> Result<Self, LotusError> {
        let chat = state
            .storage
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| LotusError::not_found("chat", chat_id))?;
        let messages = state.storage.list_messages(chat_id).await?;

        log::info!("Opened chat {} with {} messages", chat_id, messages.len());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            chat,
            messages,
            draft: String::new(),
            state: TurnState::Idle,
            last_error: None,
            config,
            storage: state.storage.clone(),
            secrets: state.secrets.clone(),
            completion: state.completion.clone(),
            in_flight: state.in_flight.clone(),
            events,
        })
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    /// The messages oldest first. Call again for a fresh pass.
    pub fn messages(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == TurnState::Sending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    /// Takes effect from the next turn.
    pub fn set_model_config(&mut self, config: ModelConfig) {
        log::debug!("Chat {} now uses model config {}", self.chat.id, config.name);
        self.config = config;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            chat_id: self.chat.id,
            state: self.state,
            loading: self.is_loading(),
            last_error: self.last_error.clone(),
            message_count: self.messages.len(),
            updated_at: self.chat.updated_at,
            draft: self.draft.clone(),
        }
    }

    /// Replaces the draft with `input` and sends it.
    pub async fn send_turn(&mut self, input: &str) -> Result<SessionSnapshot, LotusError> {
        self.set_draft(input);
        self.submit().await
    }

    /// Sends the draft as one turn.
    ///
    /// A blank draft is a no-op. The only error returned is
    /// [`LotusError::TurnInFlight`]; every other failure ends the turn in
    /// [`TurnState::Failed`] with `last_error` set.
    pub async fn submit(&mut self) -> Result<SessionSnapshot, LotusError> {
        if self.draft.trim().is_empty() {
            return Ok(self.snapshot());
        }
        let Some(_turn) = self.in_flight.try_begin(self.chat.id) else {
            log::warn!("Rejected send in chat {}: a turn is already in flight", self.chat.id);
            return Err(LotusError::TurnInFlight(self.chat.id));
        };

        // The raw text is stored; trimming only decides emptiness.
        let text = std::mem::take(&mut self.draft);
        let user_message = Message::new(self.chat.id, Sender::User, text);
        if let Err(error) = self.append(user_message.clone()).await {
            self.draft = user_message.text;
            self.fail(error);
            return Ok(self.snapshot());
        }

        self.transition(TurnState::Sending, None);
        let credential = self.credential().await;
        log::info!(
            "Sending turn in chat {} via {} ({})",
            self.chat.id,
            self.config.provider,
            self.config.model
        );

        match self
            .completion
            .complete(&user_message.text, &credential, &self.config)
            .await
        {
            Ok(reply) => {
                let assistant_message = Message::new(self.chat.id, Sender::Assistant, reply);
                match self.append(assistant_message).await {
                    Ok(()) => self.transition(TurnState::Idle, None),
                    Err(error) => self.fail(error),
                }
            }
            Err(error) => self.fail(error.into()),
        }

        Ok(self.snapshot())
    }

    /// Removes one message. Storage failures land in `last_error` and
    /// leave the session otherwise untouched.
    pub async fn delete_message(&mut self, message_id: Uuid) -> SessionSnapshot {
        let touched_at = now_millis();
        match self
            .storage
            .delete_message(self.chat.id, message_id, touched_at)
            .await
        {
            Ok(true) => {
                self.messages.retain(|m| m.id != message_id);
                self.chat.updated_at = touched_at;
                self.emit(SessionEvent::MessageDeleted {
                    chat_id: self.chat.id,
                    message_id,
                });
            }
            Ok(false) => {
                log::debug!("Message {} not in chat {}, nothing to delete", message_id, self.chat.id);
            }
            Err(error) => {
                log::error!("Failed to delete message {}: {:?}", message_id, error);
                self.last_error = Some(LotusError::from(error).to_string());
                self.emit_state();
            }
        }
        self.snapshot()
    }

    /// Returns a failed session to idle.
    pub fn clear_error(&mut self) -> SessionSnapshot {
        if self.state == TurnState::Failed {
            self.transition(TurnState::Idle, None);
        } else if self.last_error.take().is_some() {
            self.emit_state();
        }
        self.snapshot()
    }

    /// Re-reads the chat and its messages from the store, dropping any
    /// in-memory state that was never committed.
    pub async fn reload(&mut self) -> Result<SessionSnapshot, LotusError> {
        let chat = self
            .storage
            .get_chat(self.chat.id)
            .await?
            .ok_or_else(|| LotusError::not_found("chat", self.chat.id))?;
        let messages = self.storage.list_messages(self.chat.id).await?;

        self.chat = chat;
        self.messages = messages;
        Ok(self.snapshot())
    }

    // A missing key is not an error here; the completion service decides.
    // Keychain lookups block, so they run off the async workers.
    async fn credential(&self) -> String {
        let provider = self.config.provider.as_str();
        let secrets = self.secrets.clone();
        let lookup = tokio::task::spawn_blocking(move || secrets.get(provider)).await;
        match lookup {
            Ok(Ok(key)) => key,
            Ok(Err(SecretError::NotFound(_))) => {
                log::debug!("No API key stored for {}", provider);
                String::new()
            }
            Ok(Err(error)) => {
                log::warn!("Could not read API key for {}: {}", provider, error);
                String::new()
            }
            Err(error) => {
                log::error!("API key lookup for {} did not complete: {}", provider, error);
                String::new()
            }
        }
    }

    async fn append(&mut self, message: Message) -> Result<(), LotusError> {
        let touched_at = now_millis();
        self.storage.append_message(&message, touched_at).await?;

        self.chat.updated_at = touched_at;
        let index = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(index, message.clone());
        self.emit(SessionEvent::MessageAppended { message });
        Ok(())
    }

    fn fail(&mut self, error: LotusError) {
        log::error!("Turn failed in chat {}: {}", self.chat.id, error);
        self.transition(TurnState::Failed, Some(error.to_string()));
    }

    fn transition(&mut self, state: TurnState, error: Option<String>) {
        self.state = state;
        self.last_error = error;
        self.emit_state();
    }

    fn emit_state(&self) {
        self.emit(SessionEvent::StateChanged {
            snapshot: self.snapshot(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompletionError;
    use crate::models::{AiModel, Provider};
    use crate::secrets::InMemorySecretStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct ScriptedCompletion {
        reply: Result<String, CompletionError>,
        prompts: Mutex<Vec<(String, String)>>,
        hold: Option<Arc<Notify>>,
    }

    impl ScriptedCompletion {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
                hold: None,
            }
        }

        fn failing(error: CompletionError) -> Self {
            Self {
                reply: Err(error),
                prompts: Mutex::new(Vec::new()),
                hold: None,
            }
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(
            &self,
            text: &str,
            credential: &str,
            _config: &ModelConfig,
        ) -> Result<String, CompletionError> {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push((text.to_string(), credential.to_string()));
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if credential.is_empty() {
                return Err(CompletionError::MissingCredential);
            }
            self.reply.clone()
        }

        async fn validate_api_key(
            &self,
            api_key: &str,
            _provider: Provider,
        ) -> Result<bool, CompletionError> {
            Ok(!api_key.is_empty())
        }
    }

    struct Fixture {
        state: AppState,
        secrets: Arc<InMemorySecretStore>,
        completion: Arc<ScriptedCompletion>,
        chat: Chat,
    }

    async fn fixture(completion: ScriptedCompletion) -> Fixture {
        let storage = Arc::new(StorageManager::in_memory().await.expect("storage"));
        let secrets = Arc::new(InMemorySecretStore::new());
        let completion = Arc::new(completion);
        let state = AppState::new(storage.clone(), secrets.clone(), completion.clone());

        let mut chat = Chat::new("test");
        chat.updated_at = now_millis() - Duration::hours(1);
        storage.insert_chat(&chat).await.expect("insert chat");

        Fixture {
            state,
            secrets,
            completion,
            chat,
        }
    }

    fn gpt35() -> ModelConfig {
        ModelConfig::new("GPT-3.5 Turbo", Provider::OpenAI, AiModel::Gpt35Turbo)
    }

    async fn open(fixture: &Fixture) -> ChatSession {
        ChatSession::open(&fixture.state, fixture.chat.id, gpt35())
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn successful_turn_appends_both_messages_and_returns_to_idle() {
        let fx = fixture(ScriptedCompletion::replying("Hello back")).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;

        let snapshot = session.send_turn("Hi").await.expect("turn");
        assert_eq!(snapshot.state, TurnState::Idle);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.draft, "");
        assert!(snapshot.updated_at > fx.chat.updated_at);

        let texts: Vec<(Sender, &str)> = session.messages().map(|m| (m.sender, m.text.as_str())).collect();
        assert_eq!(texts, vec![(Sender::User, "Hi"), (Sender::Assistant, "Hello back")]);

        let stored = fx.state.storage.list_messages(fx.chat.id).await.expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].text, "Hi");
        assert_eq!(stored[1].sender, Sender::Assistant);

        let prompts = fx.completion.prompts.lock().expect("prompts lock");
        assert_eq!(prompts.as_slice(), &[("Hi".to_string(), "sk-test".to_string())]);
    }

    #[tokio::test]
    async fn missing_credential_fails_but_keeps_the_user_message() {
        let fx = fixture(ScriptedCompletion::replying("unused")).await;
        let mut session = open(&fx).await;

        let snapshot = session.send_turn("Hello").await.expect("turn");
        assert_eq!(snapshot.state, TurnState::Failed);
        assert!(!snapshot.loading);
        let error = snapshot.last_error.expect("error message");
        assert!(error.contains("API key"), "{error}");
        assert!(snapshot.updated_at > fx.chat.updated_at);

        let stored = fx.state.storage.list_messages(fx.chat.id).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender, Sender::User);
        assert_eq!(stored[0].text, "Hello");

        let chat = fx.state.storage.get_chat(fx.chat.id).await.expect("get").expect("chat");
        assert_eq!(chat.updated_at, snapshot.updated_at);
    }

    #[tokio::test]
    async fn remote_errors_end_in_failed_and_clear_error_recovers() {
        let fx = fixture(ScriptedCompletion::failing(CompletionError::Network(
            "connection reset".into(),
        )))
        .await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;

        let snapshot = session.send_turn("ping").await.expect("turn");
        assert_eq!(snapshot.state, TurnState::Failed);
        assert!(snapshot.last_error.as_deref().is_some_and(|e| e.contains("connection reset")));
        assert_eq!(snapshot.message_count, 1);

        let snapshot = session.clear_error();
        assert_eq!(snapshot.state, TurnState::Idle);
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test]
    async fn blank_input_changes_nothing() {
        let fx = fixture(ScriptedCompletion::replying("unused")).await;
        let mut session = open(&fx).await;
        let before = session.snapshot();

        for input in ["", "   ", "\n\t "] {
            let snapshot = session.send_turn(input).await.expect("no-op");
            assert_eq!(snapshot.message_count, 0);
            assert_eq!(snapshot.updated_at, before.updated_at);
            assert_eq!(snapshot.state, TurnState::Idle);
        }
        assert!(fx.completion.prompts.lock().expect("prompts lock").is_empty());
        let chat = fx.state.storage.get_chat(fx.chat.id).await.expect("get").expect("chat");
        assert_eq!(chat.updated_at, fx.chat.updated_at);
    }

    #[tokio::test]
    async fn raw_untrimmed_text_is_persisted() {
        let fx = fixture(ScriptedCompletion::replying("ok")).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;

        session.send_turn("  spaced out \n").await.expect("turn");
        let stored = fx.state.storage.list_messages(fx.chat.id).await.expect("list");
        assert_eq!(stored[0].text, "  spaced out \n");
    }

    #[tokio::test]
    async fn second_turn_on_the_same_chat_is_rejected_while_one_is_in_flight() {
        let hold = Arc::new(Notify::new());
        let mut completion = ScriptedCompletion::replying("slow reply");
        completion.hold = Some(hold.clone());
        let fx = fixture(completion).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");

        let mut first = open(&fx).await;
        let mut second = open(&fx).await;
        let in_flight = fx.state.in_flight.clone();
        let chat_id = fx.chat.id;

        let running = tokio::spawn(async move { first.send_turn("first").await });
        while !in_flight.is_in_flight(chat_id) {
            tokio::task::yield_now().await;
        }

        let error = second.send_turn("second").await.expect_err("busy");
        assert!(matches!(error, LotusError::TurnInFlight(id) if id == chat_id));
        assert_eq!(second.draft(), "second");

        hold.notify_one();
        let snapshot = running.await.expect("join").expect("turn");
        assert_eq!(snapshot.state, TurnState::Idle);
        assert!(!in_flight.is_in_flight(chat_id));

        let stored = fx.state.storage.list_messages(chat_id).await.expect("list");
        let texts: Vec<&str> = stored.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "slow reply"]);
    }

    #[tokio::test]
    async fn events_follow_the_turn() {
        let fx = fixture(ScriptedCompletion::replying("pong")).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;
        let mut events = session.subscribe();

        session.send_turn("ping").await.expect("turn");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert!(matches!(&seen[0], SessionEvent::MessageAppended { message } if message.text == "ping"));
        assert!(matches!(&seen[1], SessionEvent::StateChanged { snapshot } if snapshot.loading));
        assert!(matches!(&seen[2], SessionEvent::MessageAppended { message } if message.sender == Sender::Assistant));
        assert!(matches!(&seen[3], SessionEvent::StateChanged { snapshot } if snapshot.state == TurnState::Idle));

        let json = serde_json::to_value(&seen[1]).expect("serialize");
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["snapshot"]["state"], "sending");
    }

    #[tokio::test]
    async fn delete_message_touches_the_chat() {
        let fx = fixture(ScriptedCompletion::replying("reply")).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;
        session.send_turn("question").await.expect("turn");

        let reply_id = session.messages().last().expect("reply").id;
        let before = session.snapshot();
        let snapshot = session.delete_message(reply_id).await;
        assert_eq!(snapshot.message_count, 1);
        assert!(snapshot.updated_at >= before.updated_at);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(fx.state.storage.list_messages(fx.chat.id).await.expect("list").len(), 1);

        let unchanged = session.delete_message(Uuid::new_v4()).await;
        assert_eq!(unchanged.message_count, 1);
    }

    #[tokio::test]
    async fn storage_failure_on_delete_is_reported_not_fatal() {
        let fx = fixture(ScriptedCompletion::replying("reply")).await;
        fx.secrets.save("OpenAI", "sk-test").expect("save key");
        let mut session = open(&fx).await;
        session.send_turn("question").await.expect("turn");
        let first_id = session.messages().next().expect("message").id;

        fx.state.storage.close().await;
        let snapshot = session.delete_message(first_id).await;
        assert_eq!(snapshot.state, TurnState::Idle);
        assert_eq!(snapshot.message_count, 2);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn messages_are_ordered_and_restartable() {
        let fx = fixture(ScriptedCompletion::replying("unused")).await;
        let t1 = now_millis() - Duration::minutes(5);
        let t2 = t1 + Duration::minutes(1);
        for (text, ts) in [("C", t2), ("A", t1), ("B", t1)] {
            let mut message = Message::new(fx.chat.id, Sender::User, text);
            message.timestamp = ts;
            fx.state
                .storage
                .append_message(&message, now_millis())
                .await
                .expect("append");
        }

        let session = open(&fx).await;
        let first: Vec<&str> = session.messages().map(|m| m.text.as_str()).collect();
        let second: Vec<&str> = session.messages().map(|m| m.text.as_str()).collect();
        assert_eq!(first, vec!["A", "B", "C"]);
        assert_eq!(first, second);
    }

    /// Records which thread served each lookup.
    struct ThreadRecordingSecrets {
        key: String,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl SecretStore for ThreadRecordingSecrets {
        fn save(&self, _key: &str, _secret: &str) -> Result<(), SecretError> {
            Ok(())
        }

        fn get(&self, _key: &str) -> Result<String, SecretError> {
            self.threads
                .lock()
                .expect("threads lock")
                .push(std::thread::current().id());
            Ok(self.key.clone())
        }

        fn delete(&self, _key: &str) -> Result<(), SecretError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn api_key_lookup_runs_on_a_blocking_thread() {
        let storage = Arc::new(StorageManager::in_memory().await.expect("storage"));
        let secrets = Arc::new(ThreadRecordingSecrets {
            key: "sk-test".to_string(),
            threads: Mutex::new(Vec::new()),
        });
        let completion = Arc::new(ScriptedCompletion::replying("pong"));
        let state = AppState::new(storage.clone(), secrets.clone(), completion.clone());
        let chat = Chat::new("keychain");
        storage.insert_chat(&chat).await.expect("insert chat");

        let mut session = ChatSession::open(&state, chat.id, gpt35()).await.expect("open");
        let snapshot = session.send_turn("ping").await.expect("turn");
        assert_eq!(snapshot.state, TurnState::Idle);

        let threads = secrets.threads.lock().expect("threads lock");
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
        let prompts = completion.prompts.lock().expect("prompts lock");
        assert_eq!(prompts[0].1, "sk-test");
    }

    #[tokio::test]
    async fn opening_an_unknown_chat_is_not_found() {
        let fx = fixture(ScriptedCompletion::replying("unused")).await;
        let result = ChatSession::open(&fx.state, Uuid::new_v4(), gpt35()).await;
        assert!(matches!(result, Err(LotusError::NotFound { kind: "chat", .. })));
    }
}
