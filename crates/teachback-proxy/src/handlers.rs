use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use tracing::{debug, error};

use teachback_core::{TeachbackError, TextCompletion};

use crate::error::ProxyError;
use crate::protocol::{ChatRequest, CompletionResponse, TeachRequest};
use crate::ProxyState;

pub async fn teach(
    State(state): State<Arc<ProxyState>>,
    Json(request): Json<TeachRequest>,
) -> Result<Json<CompletionResponse>, ProxyError> {
    let client = state.client()?;
    let prompt = request.prompt().to_string();
    debug!(prompt_len = prompt.len(), "teach request");
    let response = complete(client, prompt).await.map_err(|details| {
        error!("teach request failed: {details}");
        ProxyError::Teach(details)
    })?;
    Ok(Json(CompletionResponse { response }))
}

pub async fn chat(
    State(state): State<Arc<ProxyState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<CompletionResponse>, ProxyError> {
    let client = state.client()?;
    let prompt = request.prompt();
    debug!(
        history = request.conversation_history.len(),
        prompt_len = prompt.len(),
        "chat request"
    );
    let response = complete(client, prompt).await.map_err(|details| {
        error!("chat request failed: {details}");
        ProxyError::Chat(details)
    })?;
    Ok(Json(CompletionResponse { response }))
}

/// Run one blocking provider call off the async runtime.
async fn complete(client: Arc<dyn TextCompletion>, prompt: String) -> Result<String, String> {
    let outcome = tokio::task::spawn_blocking(move || client.generate_text(&prompt))
        .await
        .map_err(|e| e.to_string())?;
    match outcome {
        Ok(text) => Ok(text),
        // The provider answered but produced no text.
        Err(TeachbackError::EmptyReply) => Ok(String::new()),
        Err(TeachbackError::Provider(details)) => Err(details),
        Err(other) => Err(other.to_string()),
    }
}
