use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable conversation identifier.
pub type ConversationId = String;

/// Opaque message identifier, unique across conversations.
pub type MessageId = String;

/// Generate a fresh identifier for messages and conversations.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single renderable piece of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    /// Model "thinking" trace, rendered separately from the answer.
    Reasoning {
        text: String,
    },
    ImageUrl {
        url: String,
    },
    File {
        url: String,
        #[serde(rename = "mediaType")]
        media_type: String,
        filename: String,
    },
}

/// A file the user attached to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub media_type: String,
    pub filename: String,
}

impl Attachment {
    pub fn new(
        url: impl Into<String>,
        media_type: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            media_type: media_type.into(),
            filename: filename.into(),
        }
    }

    /// Images render inline; everything else is shown as a file chip.
    fn into_part(self) -> MessagePart {
        if self.media_type.starts_with("image/") {
            MessagePart::ImageUrl { url: self.url }
        } else {
            MessagePart::File {
                url: self.url,
                media_type: self.media_type,
                filename: self.filename,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a user message. Its parts are fixed from here on.
    pub fn user(text: &str, attachments: Vec<Attachment>) -> Self {
        let mut parts = Vec::with_capacity(attachments.len() + 1);
        if !text.is_empty() {
            parts.push(MessagePart::Text {
                text: text.to_string(),
            });
        }
        parts.extend(attachments.into_iter().map(Attachment::into_part));

        Self {
            id: new_id(),
            role: Role::User,
            parts,
            created_at: Utc::now(),
        }
    }

    /// Empty assistant reply shown before any response text arrives.
    pub fn assistant_placeholder() -> Self {
        Self::assistant(String::new())
    }

    pub fn assistant(text: String) -> Self {
        Self {
            id: new_id(),
            role: Role::Assistant,
            parts: vec![MessagePart::Text { text }],
            created_at: Utc::now(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Concatenated text parts, ignoring reasoning and attachments.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::Reasoning { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Replace the text (and optional reasoning) of an assistant message in place.
    ///
    /// Keeps a single text part; a non-empty reasoning trace is placed ahead of it.
    pub(crate) fn set_streamed_content(&mut self, text: &str, reasoning: &str) {
        debug_assert_eq!(self.role, Role::Assistant);

        self.parts
            .retain(|part| !matches!(part, MessagePart::Text { .. } | MessagePart::Reasoning { .. }));
        if !reasoning.is_empty() {
            self.parts.insert(
                0,
                MessagePart::Reasoning {
                    text: reasoning.to_string(),
                },
            );
        }
        self.parts.push(MessagePart::Text {
            text: text.to_string(),
        });
    }
}
