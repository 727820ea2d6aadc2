//! The assistant chat transcript.

use chrono::{DateTime, Utc};
use forge_core::ChatEntry;
use uuid::Uuid;

pub const GREETING: &str = "Hello! I'm your AI coding assistant. How can I help you today?";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error processing your request.";
/// Prefix of the note listing documentation found for a prompt.
pub const REFERENCES_PREFIX: &str = "Relevant docs: ";

/// Assistant note naming the documents a prompt was answered with.
pub fn references_note<'a>(titles: impl IntoIterator<Item = &'a str>) -> String {
    format!("{REFERENCES_PREFIX}{}", titles.into_iter().collect::<Vec<_>>().join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl Default for ChatTranscript {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatTranscript {
    /// A transcript holding only the assistant's greeting.
    pub fn new() -> Self {
        let mut transcript = Self { messages: Vec::new() };
        transcript.push(Speaker::Assistant, GREETING);
        transcript
    }

    pub fn push(&mut self, speaker: Speaker, content: impl Into<String>) -> &ChatMessage {
        self.messages.push(ChatMessage {
            id: Uuid::new_v4(),
            speaker,
            content: content.into(),
            timestamp: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Session-record form. Assistant lines are filed under the nil id.
    pub fn to_entries(&self, user_id: Uuid) -> Vec<ChatEntry> {
        self.messages
            .iter()
            .map(|m| ChatEntry {
                id: m.id,
                user_id: match m.speaker {
                    Speaker::User => user_id,
                    Speaker::Assistant => Uuid::nil(),
                },
                content: m.content.clone(),
                timestamp: m.timestamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_greeting() {
        let transcript = ChatTranscript::new();
        assert_eq!(transcript.len(), 1);
        let first = transcript.last().unwrap();
        assert_eq!(first.speaker, Speaker::Assistant);
        assert_eq!(first.content, GREETING);
    }

    #[test]
    fn test_entries_attribute_speakers() {
        let mut transcript = ChatTranscript::new();
        let user = Uuid::new_v4();
        transcript.push(Speaker::User, "write a sort");
        let entries = transcript.to_entries(user);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_id, Uuid::nil());
        assert_eq!(entries[1].user_id, user);
        assert_eq!(entries[1].content, "write a sort");
    }
}
