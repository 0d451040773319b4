//! Terminal front end for one participant session.
//!
//! Reads participant input line by line and renders each stage as plain
//! text. Generic over reader and writer so a whole session can be scripted.

use std::io::{BufRead, Write};

use anyhow::{bail, Result};
use chrono::Utc;

use teachback_core::persona::Persona;
use teachback_core::quiz::CHOICE_QUESTIONS;
use teachback_core::survey::{MENTAL_EFFORT_QUESTION, RATING_STATEMENTS, SCALE};
use teachback_core::{
    FreeResponseView, Message, QuickAction, QuizVariant, Session, StageKind, StateStore,
    TbResult, TeachbackError, TextCompletion, Transcript, Treatment,
};

pub const DEBRIEF: &str = "\
Experiment Debrief

Thank you for participating in this study on learning by teaching.
This experiment investigates how the expectation of teaching affects learning outcomes.

You will now proceed through several stages:
  - An AI chatbot will teach you about the Doppler Effect
  - You will have the opportunity to teach the material back
  - You will complete a comprehension quiz

Please pay attention to the material and do your best. The entire experiment
should take approximately 15-20 minutes.";

const CONTINUE: &str = "/continue";

pub struct Console<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn say(&mut self, text: impl AsRef<str>) -> Result<()> {
        writeln!(self.output, "{}", text.as_ref())?;
        Ok(())
    }

    /// Next input line without its newline. Closed input ends the session.
    fn line(&mut self, prompt: &str) -> Result<String> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut buf = String::new();
        if self.input.read_line(&mut buf)? == 0 {
            bail!("input closed before the session finished");
        }
        Ok(buf.trim_end_matches(['\n', '\r']).to_string())
    }

    fn warn(&mut self, error: &TeachbackError) -> Result<()> {
        self.say(format!("! {error}"))
    }

    /// Show validation problems and return `None`; anything else aborts.
    fn attempt<T>(&mut self, result: TbResult<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e @ (TeachbackError::Validation(_) | TeachbackError::StageClosed(_))) => {
                self.warn(&e)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn run<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
        treatment: Treatment,
    ) -> Result<()> {
        self.say(DEBRIEF)?;
        self.line("\nPress Enter to begin the experiment. ")?;
        session.start(treatment)?;

        while let Some(stage) = session.current_stage() {
            self.say(format!("\n=== {} ===", stage.name()))?;
            self.show_clock(session)?;
            match stage {
                StageKind::Teaching => self.teaching(session)?,
                StageKind::TeachBack => self.teach_back(session)?,
                StageKind::Quiz => self.quiz(session)?,
                StageKind::ExitSurvey => self.survey(session)?,
            }
        }

        self.say(format!(
            "\nThank you for participating. Your participant ID is {}.",
            session.participant()
        ))
    }

    fn show_clock<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &Session<'_, S, C>,
    ) -> Result<()> {
        let remaining = session.clock().and_then(|c| c.remaining(Utc::now()));
        if let Some(left) = remaining {
            let secs = left.num_seconds();
            if secs == 0 {
                self.say("[time is up, please finish when ready]")?;
            } else {
                self.say(format!("[time left {}:{:02}]", secs / 60, secs % 60))?;
            }
        }
        Ok(())
    }

    fn show_message(&mut self, persona: Persona, message: &Message) -> Result<()> {
        let speaker = if message.role == persona.ai_role() {
            persona.label(message.role)
        } else {
            "You"
        };
        self.say(format!("{speaker}: {}", message.content))
    }

    fn show_transcript(&mut self, persona: Persona, transcript: &Transcript) -> Result<()> {
        for message in transcript {
            self.show_message(persona, message)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chat stages
    // -----------------------------------------------------------------------

    fn teaching<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        let persona = Persona::Tutor;
        if let Some(state) = session.teaching() {
            let transcript = state.transcript.clone();
            self.show_transcript(persona, &transcript)?;
        }
        self.say(format!("(type {CONTINUE} when you are done learning)"))?;

        loop {
            if session.quick_actions_available() {
                self.say("Quick actions: /ready  /what  /example")?;
            }
            let line = self.line("> ")?;
            let trimmed = line.trim();
            if trimmed == CONTINUE {
                session.teaching_continue()?;
                return Ok(());
            }
            if let Some(action) = trimmed
                .strip_prefix('/')
                .and_then(|a| a.parse::<QuickAction>().ok())
            {
                let reply = session.teaching_quick_action(action).cloned();
                if let Some(reply) = self.attempt(reply)? {
                    self.show_message(persona, &reply)?;
                }
                continue;
            }
            if let Some(reply) = session.teaching_send(&line)?.cloned() {
                self.show_message(persona, &reply)?;
                self.show_clock(session)?;
            }
        }
    }

    fn teach_back<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        let persona = Persona::ConfusedStudent;
        if let Some(state) = session.teach_back() {
            let transcript = state.transcript.clone();
            self.show_transcript(persona, &transcript)?;
        }
        self.say(format!(
            "(explain the Doppler Effect in your own words; type {CONTINUE} when finished)"
        ))?;

        loop {
            let line = self.line("> ")?;
            if line.trim() == CONTINUE {
                session.teach_back_continue()?;
                return Ok(());
            }
            if let Some(reply) = session.teach_back_send(&line)?.cloned() {
                self.show_message(persona, &reply)?;
                self.show_clock(session)?;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Quiz
    // -----------------------------------------------------------------------

    fn quiz<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        match session.config().quiz_variant {
            QuizVariant::MultipleChoice => self.choice_quiz(session),
            QuizVariant::FreeResponse => self.open_quiz(session),
        }
    }

    fn choice_quiz<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        for question in CHOICE_QUESTIONS {
            self.say(format!("\n{}. {}", question.id, question.question))?;
            for (i, option) in question.options.iter().enumerate() {
                self.say(format!("   {}) {option}", i + 1))?;
            }
            loop {
                let line = self.line("answer> ")?;
                let Ok(choice) = line.trim().parse::<usize>() else {
                    self.say("! enter the number of an option")?;
                    continue;
                };
                let selected = session.quiz_select(question.id, choice.wrapping_sub(1));
                if self.attempt(selected)?.is_some() {
                    break;
                }
            }
        }

        let score = session.quiz_submit()?;
        self.say(format!(
            "\nQuiz submitted: {} of {} correct ({}%).",
            score.correct, score.total, score.percentage
        ))
    }

    fn open_quiz<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        loop {
            match session.free_response_view()? {
                FreeResponseView::Question {
                    index,
                    total,
                    question,
                    ..
                } => {
                    self.say(format!("\nQuestion {} of {total}", index + 1))?;
                    self.say(question.prompt)?;
                    let line = self.line("answer> ")?;
                    session.free_response_answer(&line)?;
                    let advanced = session.free_response_advance();
                    self.attempt(advanced)?;
                }
                FreeResponseView::Transition => {
                    self.say("\nYou have answered every question.")?;
                    self.line("Press Enter to continue. ")?;
                    session.free_response_finish()?;
                    return Ok(());
                }
                FreeResponseView::Finished => return Ok(()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Exit survey
    // -----------------------------------------------------------------------

    fn scale_answer(&mut self) -> Result<u8> {
        loop {
            let line = self.line(&format!("rating ({}-{})> ", SCALE.start(), SCALE.end()))?;
            match line.trim().parse::<u8>() {
                Ok(v) if SCALE.contains(&v) => return Ok(v),
                _ => self.say(format!(
                    "! enter a whole number from {} to {}",
                    SCALE.start(),
                    SCALE.end()
                ))?,
            }
        }
    }

    fn survey<S: StateStore + ?Sized, C: TextCompletion>(
        &mut self,
        session: &mut Session<'_, S, C>,
    ) -> Result<()> {
        self.say("Part 1: rate each statement (1 = strongly disagree, 7 = strongly agree).")?;
        for (i, statement) in RATING_STATEMENTS.iter().enumerate() {
            self.say(format!("\n{}. {statement}", i + 1))?;
            let value = self.scale_answer()?;
            session.survey_rate(i, value)?;
        }

        self.say(format!("\nPart 2: {MENTAL_EFFORT_QUESTION}"))?;
        let effort = self.scale_answer()?;
        session.survey_effort(effort)?;

        self.say("\nPart 3: any other comments? (optional)")?;
        let comments = self.line("> ")?;
        session.survey_comments(&comments)?;

        session.survey_submit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use teachback_core::state::keys;
    use teachback_core::{Scope, SessionConfig};
    use teachback_store::SqliteStore;

    struct Offline;

    impl TextCompletion for Offline {
        fn generate_text(&self, _prompt: &str) -> TbResult<String> {
            Err(TeachbackError::Provider("offline".into()))
        }
    }

    struct Parrot;

    impl TextCompletion for Parrot {
        fn generate_text(&self, _prompt: &str) -> TbResult<String> {
            Ok("Interesting, tell me more.".into())
        }
    }

    fn drive<C: TextCompletion>(
        store: &SqliteStore,
        client: C,
        variant: QuizVariant,
        treatment: Treatment,
        script: &str,
    ) -> (Result<()>, String) {
        let mut session = Session::new(
            store,
            client,
            "cli-1",
            SessionConfig {
                quiz_variant: variant,
                ..Default::default()
            },
        )
        .with_rng(StdRng::seed_from_u64(1));
        let mut out = Vec::new();
        let result = Console::new(script.as_bytes(), &mut out).run(&mut session, treatment);
        (result, String::from_utf8(out).unwrap())
    }

    const SURVEY: &str = "4\n4\n4\n4\n4\n4\n9\n4\n5\n\n";

    #[test]
    fn test_full_multiple_choice_session() {
        let store = SqliteStore::in_memory().unwrap();
        let script = format!(
            "\n/what\nhow fast?\n/continue\n\
             Waves compress ahead of the source.\n/continue\n\
             1\n1\n2\nx\n1\n3\n2\n{SURVEY}"
        );
        let (result, out) = drive(
            &store,
            Parrot,
            QuizVariant::MultipleChoice,
            Treatment::default(),
            &script,
        );
        result.unwrap();

        assert!(out.starts_with("Experiment Debrief"));
        assert!(out.contains("=== AI Teaching ==="));
        assert!(out.contains("=== Participant Teaching ==="));
        assert!(out.contains("Student: Interesting, tell me more."));
        assert!(out.contains("6 of 6 correct (100%)"));
        assert!(out.contains("! enter the number of an option"));
        assert!(out.contains("! enter a whole number from 1 to 7"));
        assert!(out.contains("participant ID is cli-1"));

        assert_eq!(
            store
                .get("cli-1", Scope::Player, keys::QUIZ_SCORE_PERCENTAGE)
                .unwrap(),
            Some(json!(100))
        );
        assert_eq!(
            store
                .get("cli-1", Scope::Player, keys::EXIT_SURVEY_COMMENTS)
                .unwrap(),
            Some(json!("None"))
        );
    }

    #[test]
    fn test_free_response_without_teach_back() {
        let store = SqliteStore::in_memory().unwrap();
        let script = format!(
            "\nhello\n/continue\n\
             a shift in pitch\n\nhigher then lower\n\
             motion changes spacing\nred and blue shift\ntrain horn\n\n{SURVEY}"
        );
        let (result, out) = drive(
            &store,
            Offline,
            QuizVariant::FreeResponse,
            Treatment::with_teach_back(false),
            &script,
        );
        result.unwrap();

        assert!(!out.contains("=== Participant Teaching ==="));
        assert!(out.contains("I apologize, but I'm having trouble responding: offline."));
        assert!(out.contains("! Please enter an answer before continuing."));
        assert!(out.contains("Question 5 of 5"));
        assert_eq!(
            store
                .get("cli-1", Scope::Stage(StageKind::Quiz), "quizQ2Answer")
                .unwrap(),
            Some(json!("higher then lower"))
        );
    }

    #[test]
    fn test_closed_input_is_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        let (result, _) = drive(
            &store,
            Offline,
            QuizVariant::MultipleChoice,
            Treatment::default(),
            "\nhi\n",
        );
        assert!(result.is_err());
    }
}
