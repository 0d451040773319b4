//! Conversational turns: render the running history into a prompt, ask the
//! completion service for the next line, and never let a failure end the
//! conversation.

use rand::Rng;
use tracing::{debug, warn};

use crate::completion::TextCompletion;
use crate::error::{TbResult, TeachbackError};
use crate::message::Message;
use crate::persona::Persona;

pub struct TurnEngine<C> {
    client: C,
}

impl<C: TextCompletion> TurnEngine<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Build the full prompt: instructions, every prior message in order,
    /// the new participant message, then the cue for the AI's line.
    ///
    /// `history` must not contain `new_message`.
    pub fn build_prompt(persona: Persona, history: &[Message], new_message: &str) -> String {
        let mut turns: Vec<String> = history
            .iter()
            .map(|m| format!("{}: {}", persona.label(m.role), m.content))
            .collect();
        turns.push(format!(
            "{}: {}",
            persona.label(persona.participant_role()),
            new_message
        ));

        format!(
            "{}\n\n{}\n\n{}:",
            persona.instructions(),
            turns.join("\n\n"),
            persona.label(persona.ai_role())
        )
    }

    /// One raw provider round-trip. Errors are returned as-is.
    pub fn try_reply(
        &self,
        persona: Persona,
        history: &[Message],
        new_message: &str,
    ) -> TbResult<String> {
        let prompt = Self::build_prompt(persona, history, new_message);
        debug!(%persona, turns = history.len() + 1, prompt_len = prompt.len(), "requesting reply");
        let text = self.client.generate_text(&prompt)?;
        if text.trim().is_empty() {
            return Err(TeachbackError::EmptyReply);
        }
        Ok(text)
    }

    /// Like [`try_reply`](Self::try_reply) but always yields a non-empty
    /// utterance, substituting the persona's fallback on failure.
    pub fn produce_reply<R: Rng + ?Sized>(
        &self,
        persona: Persona,
        history: &[Message],
        new_message: &str,
        rng: &mut R,
    ) -> String {
        match self.try_reply(persona, history, new_message) {
            Ok(text) => text,
            Err(e) => fallback_for(persona, &e, rng),
        }
    }
}

/// The persona's stand-in line for a failed turn.
pub fn fallback_for<R: Rng + ?Sized>(persona: Persona, error: &TeachbackError, rng: &mut R) -> String {
    match error {
        TeachbackError::EmptyReply => {
            debug!(%persona, "provider returned no text, using default reply");
            persona.empty_reply().to_string()
        }
        TeachbackError::Provider(detail) => {
            warn!(%persona, "provider call failed: {detail}");
            persona.error_fallback(detail, rng)
        }
        other => {
            warn!(%persona, "reply failed: {other}");
            persona.error_fallback(&other.to_string(), rng)
        }
    }
}
