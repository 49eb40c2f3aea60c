//! Conversation session manager.
//!
//! Owns the transcript for the lifetime of a chat session, mirrors it into
//! the local store after every append and drives the send lifecycle:
//!
//! ```text
//! Idle --begin_send--> Sending --finish_send--> Idle
//! ```
//!
//! Every send appends exactly one user message on entry and exactly one bot
//! message on exit (the reply or the connection failure notice). A reset while
//! a send is in flight bumps the log generation; the late reply is then
//! dropped instead of being appended to the fresh conversation.

use std::sync::Arc;

use tracing::{debug, warn};

use super::conversation_state::{ConversationLog, Message};
use super::store::{KeyValueStore, CHAT_HISTORY_KEY, TOKEN_KEY, USER_KEY};
use crate::api_client::{ChatBackend, ChatReply, FailureKind};

/// Ticket for a send that has left `Idle`. Must be handed back to
/// [`ChatSession::finish_send`].
#[derive(Debug)]
#[must_use = "a pending send must be finished or the session stays pending"]
pub struct PendingSend {
    generation: u64,
    message: String,
}

impl PendingSend {
    /// The trimmed text to send to the backend.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply (or failure notice) was appended to the log.
    Appended(Message),
    /// The conversation was reset while the request was in flight.
    Discarded,
}

pub struct ChatSession {
    store: Arc<dyn KeyValueStore>,
    log: ConversationLog,
    generation: u64,
    pending: bool,
}

impl ChatSession {
    /// Load the persisted transcript, or start from the welcome message when
    /// there is none or it cannot be read.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Self {
        let log = match store.get(CHAT_HISTORY_KEY) {
            Ok(Some(raw)) => match ConversationLog::from_json(&raw) {
                Ok(log) => {
                    debug!("Restored {} messages from chat history", log.messages().len());
                    log
                }
                Err(e) => {
                    warn!("Failed to parse chat history, starting fresh: {}", e);
                    ConversationLog::seeded()
                }
            },
            Ok(None) => ConversationLog::seeded(),
            Err(e) => {
                warn!("Failed to read chat history, starting fresh: {}", e);
                ConversationLog::seeded()
            }
        };

        Self {
            store,
            log,
            generation: 0,
            pending: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether a submit with `input` would be accepted right now.
    pub fn can_submit(&self, input: &str) -> bool {
        !input.trim().is_empty() && !self.pending
    }

    /// `Idle -> Sending`. Appends the user message and marks the session
    /// pending. Returns `None` without touching the log when the input is
    /// blank or another send is still in flight.
    pub fn begin_send(&mut self, input: &str) -> Option<PendingSend> {
        if !self.can_submit(input) {
            debug!("Ignoring submit (pending: {})", self.pending);
            return None;
        }

        let message = input.trim().to_string();
        self.append(Message::user(message.clone()));
        self.pending = true;

        Some(PendingSend {
            generation: self.generation,
            message,
        })
    }

    /// `Sending -> Idle`. Always releases the pending flag.
    pub fn finish_send(&mut self, pending: PendingSend, reply: ChatReply) -> SendOutcome {
        self.pending = false;

        if pending.generation != self.generation {
            debug!(
                "Dropping reply for generation {} (current {})",
                pending.generation, self.generation
            );
            return SendOutcome::Discarded;
        }

        let message = match reply {
            ChatReply::Success(text) => Message::bot(text),
            ChatReply::Failure(kind) => {
                debug!("Send failed: {}", kind);
                Message::connection_failure()
            }
        };

        self.append(message.clone());
        SendOutcome::Appended(message)
    }

    /// `Sending -> Idle` for a send whose reply will never arrive. Treated
    /// like a connection failure.
    pub fn abandon_send(&mut self, pending: PendingSend) -> SendOutcome {
        debug!("Send abandoned before a reply arrived");
        self.finish_send(
            pending,
            ChatReply::Failure(FailureKind::Transport("request cancelled".to_string())),
        )
    }

    /// Run a whole send against `backend`. `None` when the submit was not
    /// accepted.
    ///
    /// Dropping the returned future mid-request (a timeout, a lost `select!`
    /// branch) still leaves the session idle with a failure notice appended.
    pub async fn send(&mut self, backend: &dyn ChatBackend, input: &str) -> Option<SendOutcome> {
        let pending = self.begin_send(input)?;
        let message = pending.message().to_string();
        let guard = InFlight {
            session: self,
            pending: Some(pending),
        };

        let reply = backend.send_message(&message).await;
        Some(guard.finish(reply))
    }

    /// Start a new conversation: fresh welcome log in memory, persisted
    /// history erased. Any in-flight reply becomes stale.
    pub fn new_conversation(&mut self) {
        self.generation += 1;
        self.log = ConversationLog::seeded();

        if let Err(e) = self.store.remove(CHAT_HISTORY_KEY) {
            warn!("Failed to erase chat history: {}", e);
        }
    }

    /// Clear stored credentials. The transcript is kept.
    pub fn log_out(&self) {
        clear_credentials(self.store.as_ref());
    }

    fn append(&mut self, message: Message) {
        self.log.push(message);
        self.sync();
    }

    fn sync(&self) {
        let json = match self.log.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize chat history: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.set(CHAT_HISTORY_KEY, &json) {
            warn!("Failed to save chat history, continuing without it: {}", e);
        }
    }
}

/// Holds a send open across the backend await and abandons it on drop.
struct InFlight<'a> {
    session: &'a mut ChatSession,
    pending: Option<PendingSend>,
}

impl InFlight<'_> {
    fn finish(mut self, reply: ChatReply) -> SendOutcome {
        match self.pending.take() {
            Some(pending) => self.session.finish_send(pending, reply),
            None => SendOutcome::Discarded,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.session.abandon_send(pending);
        }
    }
}

/// Remove the auth token and user record from `store`.
pub fn clear_credentials(store: &dyn KeyValueStore) {
    for key in [TOKEN_KEY, USER_KEY] {
        if let Err(e) = store.remove(key) {
            warn!("Failed to remove {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::chat::conversation_state::{Role, CONNECTION_FAILURE_MESSAGE, WELCOME_MESSAGE};
    use crate::cli::chat::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend that answers from a script and records what it was asked.
    struct ScriptedBackend {
        replies: Mutex<VecDeque<ChatReply>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<ChatReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send_message(&self, message: &str) -> ChatReply {
            self.seen.lock().unwrap().push(message.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ChatReply::Failure(FailureKind::Transport("no script".into())))
        }
    }

    /// Backend whose request never completes.
    struct HangingBackend;

    #[async_trait]
    impl ChatBackend for HangingBackend {
        async fn send_message(&self, _message: &str) -> ChatReply {
            std::future::pending().await
        }
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    fn persisted(store: &MemoryStore) -> Option<ConversationLog> {
        store
            .get(CHAT_HISTORY_KEY)
            .unwrap()
            .map(|raw| ConversationLog::from_json(&raw).unwrap())
    }

    fn success(text: &str) -> ChatReply {
        ChatReply::Success(text.to_string())
    }

    /// Every user message is answered by exactly one bot message right after it.
    fn assert_paired(messages: &[Message]) {
        for (i, m) in messages.iter().enumerate() {
            if m.role == Role::User {
                assert_eq!(
                    messages.get(i + 1).map(|m| m.role),
                    Some(Role::Bot),
                    "user message at {i} has no reply"
                );
            }
        }
    }

    #[test]
    fn empty_store_opens_with_welcome() {
        let store = memory_store();
        let session = ChatSession::open(store.clone());

        assert_eq!(session.messages(), &[Message::bot(WELCOME_MESSAGE)]);
        assert!(!session.is_pending());
        // The seed alone is never written
        assert!(persisted(&store).is_none());
    }

    #[test]
    fn restores_persisted_history() {
        let store = memory_store();
        store
            .set(
                CHAT_HISTORY_KEY,
                r#"[{"role":"bot","content":"hi"},{"role":"user","content":"fever"},{"role":"bot","content":"rest"}]"#,
            )
            .unwrap();

        let session = ChatSession::open(store);
        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.messages()[2], Message::bot("rest"));
    }

    #[test]
    fn corrupt_history_falls_back_to_welcome_and_is_shadowed() {
        let store = memory_store();
        store.set(CHAT_HISTORY_KEY, "not json at all").unwrap();

        let session = ChatSession::open(store.clone());
        assert_eq!(session.messages(), &[Message::welcome()]);
        assert_eq!(
            store.get(CHAT_HISTORY_KEY).unwrap().as_deref(),
            Some("not json at all")
        );
    }

    #[test]
    fn empty_array_history_falls_back_to_welcome() {
        let store = memory_store();
        store.set(CHAT_HISTORY_KEY, "[]").unwrap();

        let session = ChatSession::open(store);
        assert_eq!(session.messages(), &[Message::welcome()]);
    }

    #[tokio::test]
    async fn successful_send_appends_user_then_reply() {
        let store = memory_store();
        let backend = ScriptedBackend::new(vec![success("Hi there")]);
        let mut session = ChatSession::open(store.clone());

        let outcome = session.send(&backend, "hello").await;

        assert_eq!(outcome, Some(SendOutcome::Appended(Message::bot("Hi there"))));
        let expected = [
            Message::welcome(),
            Message::user("hello"),
            Message::bot("Hi there"),
        ];
        assert_eq!(session.messages(), &expected);
        assert_eq!(persisted(&store).unwrap().messages(), &expected);
        assert!(!session.is_pending());
    }

    #[tokio::test]
    async fn failed_send_appends_connection_notice() {
        let store = memory_store();
        let backend = ScriptedBackend::new(vec![ChatReply::Failure(FailureKind::Status(503))]);
        let mut session = ChatSession::open(store.clone());

        session.send(&backend, "hello").await;

        assert_eq!(
            session.messages(),
            &[
                Message::welcome(),
                Message::user("hello"),
                Message::bot(CONNECTION_FAILURE_MESSAGE),
            ]
        );
        assert_eq!(persisted(&store).unwrap().messages().len(), 3);
        assert!(!session.is_pending());
    }

    #[tokio::test]
    async fn input_is_trimmed_before_sending() {
        let backend = ScriptedBackend::new(vec![success("ok")]);
        let mut session = ChatSession::open(memory_store());

        session.send(&backend, "  I have a headache \n").await;

        assert_eq!(session.messages()[1], Message::user("I have a headache"));
        assert_eq!(backend.seen.lock().unwrap().as_slice(), ["I have a headache"]);
    }

    #[tokio::test]
    async fn blank_input_is_never_sent() {
        let backend = ScriptedBackend::new(vec![success("ok")]);
        let mut session = ChatSession::open(memory_store());

        assert!(!session.can_submit("   "));
        assert_eq!(session.send(&backend, " \t ").await, None);
        assert_eq!(session.messages().len(), 1);
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn submit_is_ignored_while_pending() {
        let mut session = ChatSession::open(memory_store());

        let first = session.begin_send("hello").unwrap();
        assert!(session.is_pending());
        assert!(!session.can_submit("again"));
        assert!(session.begin_send("again").is_none());
        assert_eq!(session.messages().len(), 2);

        session.finish_send(first, success("hi"));
        assert!(!session.is_pending());
        assert!(session.can_submit("again"));
    }

    #[test]
    fn user_message_is_persisted_before_the_reply_arrives() {
        let store = memory_store();
        let mut session = ChatSession::open(store.clone());

        let pending = session.begin_send("hello").unwrap();
        assert_eq!(
            persisted(&store).unwrap().messages().last(),
            Some(&Message::user("hello"))
        );

        session.finish_send(pending, success("hi"));
    }

    #[test]
    fn reset_clears_log_and_erases_history() {
        let store = memory_store();
        let mut session = ChatSession::open(store.clone());
        for i in 0..2 {
            let pending = session.begin_send(&format!("q{i}")).unwrap();
            session.finish_send(pending, success("a"));
        }
        assert_eq!(session.messages().len(), 5);

        session.new_conversation();

        assert_eq!(session.messages(), &[Message::welcome()]);
        assert_eq!(store.get(CHAT_HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn reply_after_reset_is_discarded() {
        let store = memory_store();
        let mut session = ChatSession::open(store.clone());

        let pending = session.begin_send("hello").unwrap();
        session.new_conversation();
        let outcome = session.finish_send(pending, success("late reply"));

        assert_eq!(outcome, SendOutcome::Discarded);
        assert!(!session.is_pending());
        assert_eq!(session.messages(), &[Message::welcome()]);
        assert_eq!(store.get(CHAT_HISTORY_KEY).unwrap(), None);

        // The fresh conversation keeps working
        let pending = session.begin_send("again").unwrap();
        session.finish_send(pending, success("hi"));
        assert_eq!(session.messages().len(), 3);
    }

    #[tokio::test]
    async fn timed_out_send_releases_pending() {
        let store = memory_store();
        let mut session = ChatSession::open(store.clone());

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            session.send(&HangingBackend, "hello"),
        )
        .await;

        assert!(result.is_err());
        assert!(!session.is_pending());
        assert!(session.can_submit("again"));
        let expected = [
            Message::welcome(),
            Message::user("hello"),
            Message::connection_failure(),
        ];
        assert_eq!(session.messages(), &expected);
        assert_eq!(persisted(&store).unwrap().messages(), &expected);
    }

    #[test]
    fn abandoned_send_after_reset_leaves_fresh_log_alone() {
        let store = memory_store();
        let mut session = ChatSession::open(store.clone());

        let pending = session.begin_send("hello").unwrap();
        session.new_conversation();

        assert_eq!(session.abandon_send(pending), SendOutcome::Discarded);
        assert!(!session.is_pending());
        assert_eq!(session.messages(), &[Message::welcome()]);
        assert_eq!(store.get(CHAT_HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn log_out_keeps_history() {
        let store = memory_store();
        store.set(TOKEN_KEY, "mock_token_123").unwrap();
        store.set(USER_KEY, r#"{"name":"Ann"}"#).unwrap();

        let mut session = ChatSession::open(store.clone());
        let pending = session.begin_send("hello").unwrap();
        session.finish_send(pending, success("hi"));
        let before = store.get(CHAT_HISTORY_KEY).unwrap();

        session.log_out();

        assert_eq!(store.get(TOKEN_KEY).unwrap(), None);
        assert_eq!(store.get(USER_KEY).unwrap(), None);
        assert_eq!(store.get(CHAT_HISTORY_KEY).unwrap(), before);
    }

    #[tokio::test]
    async fn broken_store_degrades_to_memory_only() {
        let backend = ScriptedBackend::new(vec![success("one"), ChatReply::Failure(FailureKind::Malformed("x".into()))]);
        let mut session = ChatSession::open(Arc::new(BrokenStore));

        session.send(&backend, "a").await;
        session.send(&backend, "b").await;
        session.new_conversation();
        session.send(&backend, "c").await;

        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.messages()[2], Message::connection_failure());
    }

    #[tokio::test]
    async fn every_send_gets_exactly_one_reply() {
        let store = memory_store();
        let backend = ScriptedBackend::new(vec![
            success("r1"),
            ChatReply::Failure(FailureKind::Transport("refused".into())),
            success("r3"),
        ]);
        let mut session = ChatSession::open(store.clone());

        for input in ["one", "", "two", "   ", "three"] {
            session.send(&backend, input).await;
            assert!(!session.messages().is_empty());
        }

        let messages = session.messages();
        assert_eq!(messages.len(), 7);
        assert_eq!(
            messages.iter().filter(|m| m.role == Role::User).count(),
            3
        );
        assert_eq!(messages.iter().filter(|m| m.role == Role::Bot).count(), 4);
        assert_paired(messages);

        // A reopened session sees the same transcript
        let reopened = ChatSession::open(store);
        assert_eq!(reopened.messages(), messages);
    }
}
