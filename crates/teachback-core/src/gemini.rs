use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::TextCompletion;
use crate::error::{TbResult, TeachbackError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";

/// `generateContent` client for the Gemini API.
pub struct GeminiClient {
    agent: ureq::Agent,
    base_url: String,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    /// Read the key from `var`. A missing or blank variable is a configuration error.
    pub fn from_env(var: &str, model: impl Into<String>) -> TbResult<Self> {
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key, model)),
            _ => Err(TeachbackError::Configuration(format!(
                "{var} environment variable not set"
            ))),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::AgentBuilder::new().timeout(timeout).build();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
            .filter(|t| !t.is_empty())
    }
}

impl TextCompletion for GeminiClient {
    fn generate_text(&self, prompt: &str) -> TbResult<String> {
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        debug!(model = %self.model, prompt_len = prompt.len(), "gemini generateContent");

        let response = self
            .agent
            .post(&self.endpoint())
            .query("key", &self.api_key)
            .set("Content-Type", "application/json")
            .send_json(&body);

        match response {
            Ok(resp) => {
                let parsed: GenerateResponse = resp
                    .into_json()
                    .map_err(|e| TeachbackError::Provider(format!("malformed response: {e}")))?;
                parsed.into_text().ok_or(TeachbackError::EmptyReply)
            }
            Err(ureq::Error::Status(code, resp)) => {
                let message = resp
                    .into_json::<ErrorEnvelope>()
                    .ok()
                    .and_then(|e| e.error)
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "Failed to get response".into());
                warn!(status = code, "gemini request rejected: {message}");
                Err(TeachbackError::Provider(message))
            }
            Err(ureq::Error::Transport(t)) => Err(TeachbackError::Provider(t.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const PATH: &str = "/v1beta/models/test-model:generateContent";

    fn client(server: &mockito::Server) -> GeminiClient {
        GeminiClient::new("secret", "test-model").with_base_url(server.url())
    }

    #[test]
    fn test_generate_text_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", PATH)
            .match_query(Matcher::UrlEncoded("key".into(), "secret".into()))
            .match_body(Matcher::Json(serde_json::json!({
                "contents": [{"parts": [{"text": "hello"}]}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"Hi there"}]}}]}"#)
            .create();

        let text = client(&server).generate_text("hello").unwrap();
        assert_eq!(text, "Hi there");
        mock.assert();
    }

    #[test]
    fn test_error_message_is_surfaced() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", PATH)
            .match_query(Matcher::Any)
            .with_status(429)
            .with_body(r#"{"error":{"code":429,"message":"Resource exhausted"}}"#)
            .create();

        let err = client(&server).generate_text("hello").unwrap_err();
        match err {
            TeachbackError::Provider(msg) => assert_eq!(msg, "Resource exhausted"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_without_body_uses_generic_message() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", PATH)
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("oops")
            .create();

        let err = client(&server).generate_text("hello").unwrap_err();
        assert!(matches!(err, TeachbackError::Provider(ref m) if m == "Failed to get response"));
    }

    #[test]
    fn test_missing_text_is_empty_reply() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"candidates":[]}"#)
            .create();

        let err = client(&server).generate_text("hello").unwrap_err();
        assert!(matches!(err, TeachbackError::EmptyReply));
    }

    #[test]
    fn test_malformed_body_is_provider_error() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create();

        let err = client(&server).generate_text("hello").unwrap_err();
        assert!(matches!(err, TeachbackError::Provider(_)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let c = GeminiClient::new("super-secret", "m");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("REDACTED"));
    }
}
