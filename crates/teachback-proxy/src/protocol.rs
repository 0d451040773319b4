use serde::{Deserialize, Serialize};

pub const PROFESSOR_PROMPT: &str = "You are an expert Physics Professor. Your goal is to teach \
the user about the Doppler Effect. Keep your explanations clear, accurate, and concise (under \
100 words per response). Start by introducing the concept. Cover frequency change, sound waves, \
and light waves (red shift/blue shift).";

const CHAT_PREAMBLE: &str = "You are a helpful AI tutor teaching about the Doppler Effect. ";

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TeachRequest {
    #[serde(default)]
    pub message: Option<String>,
}

impl TeachRequest {
    /// The caller's prompt, or the default lesson opener when absent or blank.
    pub fn prompt(&self) -> &str {
        match self.message.as_deref() {
            Some(m) if !m.trim().is_empty() => m,
            _ => PROFESSOR_PROMPT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    fn speaker(&self) -> &'static str {
        match self.role.as_str() {
            "user" | "student" => "Student",
            _ => "Tutor",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(rename = "conversationHistory", default)]
    pub conversation_history: Vec<HistoryEntry>,
}

impl ChatRequest {
    pub fn prompt(&self) -> String {
        let mut prompt = String::from(CHAT_PREAMBLE);
        if !self.conversation_history.is_empty() {
            prompt.push_str("Here's our conversation so far:\n\n");
            for entry in &self.conversation_history {
                prompt.push_str(&format!("{}: {}\n\n", entry.speaker(), entry.content));
            }
        }
        prompt.push_str(&format!("Student: {}\n\nTutor:", self.message));
        prompt
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub response: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
