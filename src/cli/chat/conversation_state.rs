use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seed message installed when there is no usable history.
pub const WELCOME_MESSAGE: &str = "Hello! I am Dr. Chatbot. How can I help you today?";

/// Synthetic bot reply appended when a send fails for any reason.
pub const CONNECTION_FAILURE_MESSAGE: &str =
    "Sorry, I'm having trouble connecting to the server. Is it running?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

/// One turn of the conversation. Never mutated once it is in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self {
            role: Role::Bot,
            content: content.into(),
        }
    }

    pub fn welcome() -> Self {
        Self::bot(WELCOME_MESSAGE)
    }

    pub fn connection_failure() -> Self {
        Self::bot(CONNECTION_FAILURE_MESSAGE)
    }
}

#[derive(Debug, Error)]
pub enum LogParseError {
    #[error("chat history is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chat history is empty")]
    Empty,
}

/// Ordered transcript. Insertion order is display order.
///
/// The only way to grow the log is [`ConversationLog::push`], and the only
/// constructors produce a non-empty log, so a `ConversationLog` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConversationLog {
    messages: Vec<Message>,
}

impl ConversationLog {
    /// A fresh log holding only the welcome message.
    pub fn seeded() -> Self {
        Self {
            messages: vec![Message::welcome()],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a persisted transcript. An empty array is rejected because it
    /// cannot be displayed as a conversation.
    pub fn from_json(raw: &str) -> Result<Self, LogParseError> {
        let messages: Vec<Message> = serde_json::from_str(raw)?;
        if messages.is_empty() {
            return Err(LogParseError::Empty);
        }
        Ok(Self { messages })
    }
}
