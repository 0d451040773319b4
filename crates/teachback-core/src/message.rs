use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tutor,
    Student,
}

impl Role {
    /// The other side of the conversation.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Tutor => Self::Student,
            Self::Student => Self::Tutor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tutor => write!(f, "tutor"),
            Self::Student => write!(f, "student"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(
        rename = "timestamp",
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            sent_at: None,
        }
    }

    pub fn stamped(role: Role, content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            sent_at: Some(sent_at),
        }
    }
}

/// Append-only message history for one conversational stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transcript_keeps_insertion_order() {
        let mut t = Transcript::new();
        t.push(Message::new(Role::Tutor, "first"));
        t.push(Message::new(Role::Student, "second"));
        t.push(Message::new(Role::Tutor, "third"));

        let contents: Vec<_> = t.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(t.last().unwrap().role, Role::Tutor);
    }

    #[test]
    fn test_message_json_shape() {
        let plain = serde_json::to_value(Message::new(Role::Tutor, "hi")).unwrap();
        assert_eq!(plain, serde_json::json!({"role": "tutor", "content": "hi"}));

        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let stamped = serde_json::to_value(Message::stamped(Role::Tutor, "x", at)).unwrap();
        assert_eq!(stamped["timestamp"], 1_700_000_000_123i64);
    }

    #[test]
    fn test_transcript_serializes_as_array() {
        let mut t = Transcript::new();
        t.push(Message::new(Role::Student, "a"));
        let v = serde_json::to_value(&t).unwrap();
        assert!(v.is_array());
        let back: Transcript = serde_json::from_value(v).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_counterpart() {
        assert_eq!(Role::Tutor.counterpart(), Role::Student);
        assert_eq!(Role::Student.counterpart(), Role::Tutor);
    }
}
