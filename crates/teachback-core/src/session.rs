//! One participant's pass through the experiment.
//!
//! `Session` owns the typed state of each stage, drives the [`Progression`]
//! and writes every persisted field through the injected [`StateStore`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::completion::TextCompletion;
use crate::error::{TbResult, TeachbackError};
use crate::message::{Message, Transcript};
use crate::persona::{Persona, QuickAction};
use crate::quiz::{
    FreeResponseAnswer, FreeResponseQuiz, FreeResponseView, MultipleChoiceQuiz, QuizScore,
    QuizVariant,
};
use crate::stage::{
    Command, Event, FlowState, Progression, StageClock, StageDurations, StageKind, StageRecord,
    Transition, Treatment,
};
use crate::state::{keys, Scope, Scoped, StateStore};
use crate::survey::{SurveyForm, SurveyRecord};
use crate::turn::{fallback_for, TurnEngine};

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub durations: StageDurations,
    pub quiz_variant: QuizVariant,
}

// ---------------------------------------------------------------------------
// Typed stage state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TeachingState {
    pub record: StageRecord,
    pub transcript: Transcript,
}

#[derive(Debug, Clone)]
pub struct TeachBackState {
    pub record: StageRecord,
    pub transcript: Transcript,
    /// Every participant explanation so far, separated by blank lines.
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub enum QuizForm {
    MultipleChoice(MultipleChoiceQuiz),
    FreeResponse(FreeResponseQuiz),
}

#[derive(Debug, Clone)]
pub struct QuizState {
    pub record: StageRecord,
    pub form: QuizForm,
}

#[derive(Debug, Clone)]
pub struct SurveyState {
    pub record: StageRecord,
    pub form: SurveyForm,
}

type NowFn = Box<dyn Fn() -> DateTime<Utc>>;

pub struct Session<'s, S: ?Sized, C> {
    store: &'s S,
    engine: TurnEngine<C>,
    participant: String,
    config: SessionConfig,
    progression: Progression,
    clock: Option<StageClock>,
    rng: StdRng,
    now: NowFn,
    teaching: Option<TeachingState>,
    teach_back: Option<TeachBackState>,
    quiz: Option<QuizState>,
    survey: Option<SurveyState>,
}

impl<'s, S: StateStore + ?Sized, C: TextCompletion> Session<'s, S, C> {
    pub fn new(store: &'s S, client: C, participant: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            store,
            engine: TurnEngine::new(client),
            participant: participant.into(),
            config,
            progression: Progression::new(config.durations),
            clock: None,
            rng: StdRng::from_entropy(),
            now: Box::new(Utc::now),
            teaching: None,
            teach_back: None,
            quiz: None,
            survey: None,
        }
    }

    /// Fix the source used to pick fallback lines.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_clock(mut self, now: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> FlowState {
        self.progression.state()
    }

    pub fn plan(&self) -> &[StageKind] {
        self.progression.plan()
    }

    pub fn current_stage(&self) -> Option<StageKind> {
        self.progression.current()
    }

    pub fn is_done(&self) -> bool {
        self.progression.is_done()
    }

    pub fn clock(&self) -> Option<&StageClock> {
        self.clock.as_ref()
    }

    pub fn teaching(&self) -> Option<&TeachingState> {
        self.teaching.as_ref()
    }

    pub fn teach_back(&self) -> Option<&TeachBackState> {
        self.teach_back.as_ref()
    }

    pub fn quiz(&self) -> Option<&QuizState> {
        self.quiz.as_ref()
    }

    pub fn survey(&self) -> Option<&SurveyState> {
        self.survey.as_ref()
    }

    fn scoped(&self, scope: Scope) -> Scoped<'_, S> {
        Scoped::new(self.store, &self.participant, scope)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Read the treatment, lay out the stage plan and open the first stage.
    pub fn start(&mut self, treatment: Treatment) -> TbResult<Transition> {
        let transition = self.progression.handle(Event::GameStarted {
            treatment: treatment.clone(),
        })?;
        self.scoped(Scope::Game)
            .batch()
            .put(keys::TREATMENT, &treatment)?
            .put(keys::STAGES, self.progression.plan())?
            .put(keys::FLOW_STATE, &transition.state)?
            .commit()?;
        info!(participant = %self.participant, plan = ?self.progression.plan(), "game started");
        self.apply(&transition.commands)?;
        Ok(transition)
    }

    fn apply(&mut self, commands: &[Command]) -> TbResult<()> {
        for command in commands {
            match *command {
                Command::CreateStage {
                    kind,
                    duration_secs,
                    ..
                } => debug!(stage = %kind, ?duration_secs, "stage created"),
                Command::EnterStage(kind) => self.enter(kind)?,
                Command::Finish => {
                    self.clock = None;
                    info!(participant = %self.participant, "experiment finished");
                }
            }
        }
        Ok(())
    }

    fn enter(&mut self, kind: StageKind) -> TbResult<()> {
        let now = (self.now)();
        self.clock = Some(StageClock::start(now, self.config.durations.for_stage(kind)));
        info!(participant = %self.participant, stage = %kind, "entering stage");

        let mut record = StageRecord::new(kind);
        record.mark_started();

        match kind {
            StageKind::Teaching => {
                let mut transcript = Transcript::new();
                let stage = self.scoped(Scope::Stage(kind));
                if !stage.flag(keys::TEACHING_STARTED)? {
                    transcript.push(Message::new(
                        Persona::Tutor.ai_role(),
                        Persona::Tutor.opening_message(),
                    ));
                    stage.set(keys::TEACHING_STARTED, &true)?;
                }
                self.teaching = Some(TeachingState { record, transcript });
            }
            StageKind::TeachBack => {
                let mut transcript = Transcript::new();
                let stage = self.scoped(Scope::Stage(kind));
                if !stage.flag(keys::TEACH_BACK_STARTED)? {
                    transcript.push(Message::new(
                        Persona::ConfusedStudent.ai_role(),
                        Persona::ConfusedStudent.opening_message(),
                    ));
                    stage.set(keys::TEACH_BACK_STARTED, &true)?;
                }
                let explanation = stage
                    .get::<String>(keys::TEACHING_EXPLANATION)?
                    .unwrap_or_default();
                self.teach_back = Some(TeachBackState {
                    record,
                    transcript,
                    explanation,
                });
            }
            StageKind::Quiz => {
                let form = match self.config.quiz_variant {
                    QuizVariant::MultipleChoice => {
                        QuizForm::MultipleChoice(MultipleChoiceQuiz::default())
                    }
                    QuizVariant::FreeResponse => QuizForm::FreeResponse(FreeResponseQuiz::default()),
                };
                self.quiz = Some(QuizState { record, form });
            }
            StageKind::ExitSurvey => {
                self.survey = Some(SurveyState {
                    record,
                    form: SurveyForm::new(),
                });
            }
        }
        Ok(())
    }

    fn stage_record(&mut self, kind: StageKind) -> TbResult<&mut StageRecord> {
        match kind {
            StageKind::Teaching => self.teaching.as_mut().map(|s| &mut s.record),
            StageKind::TeachBack => self.teach_back.as_mut().map(|s| &mut s.record),
            StageKind::Quiz => self.quiz.as_mut().map(|s| &mut s.record),
            StageKind::ExitSurvey => self.survey.as_mut().map(|s| &mut s.record),
        }
        .ok_or_else(|| TeachbackError::InvalidTransition(format!("{kind} was never entered")))
    }

    /// Set the stage's submit flag and hand control to the next stage.
    /// Nothing in memory changes until both writes have landed, so a failed
    /// write leaves the stage open.
    fn complete(&mut self, kind: StageKind) -> TbResult<Transition> {
        self.stage_record(kind)?.ensure_open()?;

        let mut next = self.progression.clone();
        let transition = next.handle(Event::StageSubmitted(kind))?;
        self.scoped(Scope::Stage(kind)).set(keys::SUBMIT, &true)?;
        self.scoped(Scope::Game)
            .set(keys::FLOW_STATE, &transition.state)?;

        self.progression = next;
        self.stage_record(kind)?.submit()?;
        info!(participant = %self.participant, stage = %kind, "stage submitted");
        self.apply(&transition.commands)?;
        Ok(transition)
    }

    fn require_active(&self, kind: StageKind, submitted: Option<bool>) -> TbResult<()> {
        if submitted == Some(true) {
            return Err(TeachbackError::StageClosed(kind.name().into()));
        }
        if self.progression.current() != Some(kind) {
            return Err(TeachbackError::InvalidTransition(format!(
                "{} is not the active stage",
                kind.name()
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teaching
    // -----------------------------------------------------------------------

    /// Quick actions are offered until the participant has said anything.
    pub fn quick_actions_available(&self) -> bool {
        self.teaching
            .as_ref()
            .is_some_and(|t| !t.record.is_submitted() && t.transcript.len() <= 1)
    }

    /// Send a participant message to the tutor. Blank input is ignored.
    pub fn teaching_send(&mut self, text: &str) -> TbResult<Option<&Message>> {
        let submitted = self.teaching.as_ref().map(|t| t.record.is_submitted());
        self.require_active(StageKind::Teaching, submitted)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        self.tutor_turn(text, None).map(Some)
    }

    pub fn teaching_quick_action(&mut self, action: QuickAction) -> TbResult<&Message> {
        let submitted = self.teaching.as_ref().map(|t| t.record.is_submitted());
        self.require_active(StageKind::Teaching, submitted)?;
        if !self.quick_actions_available() {
            return Err(TeachbackError::Validation(
                "quick actions are only offered at the start of the lesson".into(),
            ));
        }
        self.tutor_turn(action.prompt(), Some(action))
    }

    fn tutor_turn(&mut self, text: &str, action: Option<QuickAction>) -> TbResult<&Message> {
        let persona = Persona::Tutor;
        let Some(state) = self.teaching.as_mut() else {
            return Err(TeachbackError::InvalidTransition("teaching was never entered".into()));
        };

        state
            .transcript
            .push(Message::new(persona.participant_role(), text));
        let history = &state.transcript.messages()[..state.transcript.len() - 1];
        let reply = match self.engine.try_reply(persona, history, text) {
            Ok(reply) => reply,
            Err(TeachbackError::EmptyReply) => persona.empty_reply().to_string(),
            Err(e) => match action {
                Some(action) => {
                    warn!("quick action reply failed: {e}");
                    action.fallback().to_string()
                }
                None => fallback_for(persona, &e, &mut self.rng),
            },
        };
        state.transcript.push(Message::new(persona.ai_role(), reply));
        state.transcript.last().ok_or(TeachbackError::EmptyReply)
    }

    /// Persist the lesson transcript and move on.
    pub fn teaching_continue(&mut self) -> TbResult<Transition> {
        let state = self
            .teaching
            .as_ref()
            .ok_or_else(|| TeachbackError::InvalidTransition("teaching was never entered".into()))?;
        self.require_active(StageKind::Teaching, Some(state.record.is_submitted()))?;

        let transcript = state.transcript.clone();
        self.scoped(Scope::Stage(StageKind::Teaching))
            .set(keys::TEACHING_CONVERSATION, &transcript)?;
        self.scoped(Scope::Player)
            .set(keys::TEACHING_CONVERSATION, &transcript)?;
        self.complete(StageKind::Teaching)
    }

    // -----------------------------------------------------------------------
    // Teach-back
    // -----------------------------------------------------------------------

    /// Send one participant explanation to the confused student. Blank input
    /// is ignored.
    pub fn teach_back_send(&mut self, text: &str) -> TbResult<Option<&Message>> {
        let submitted = self.teach_back.as_ref().map(|t| t.record.is_submitted());
        self.require_active(StageKind::TeachBack, submitted)?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let persona = Persona::ConfusedStudent;
        let now = (self.now)();
        let store = self.store;
        let participant = self.participant.as_str();
        let Some(state) = self.teach_back.as_mut() else {
            return Err(TeachbackError::InvalidTransition("teach-back was never entered".into()));
        };

        state
            .transcript
            .push(Message::stamped(persona.participant_role(), text, now));
        if !state.explanation.is_empty() {
            state.explanation.push_str("\n\n");
        }
        state.explanation.push_str(text);
        Scoped::new(store, participant, Scope::Stage(StageKind::TeachBack))
            .set(keys::TEACHING_EXPLANATION, &state.explanation)?;

        let history = &state.transcript.messages()[..state.transcript.len() - 1];
        let reply = self
            .engine
            .produce_reply(persona, history, text, &mut self.rng);
        state.transcript.push(Message::new(persona.ai_role(), reply));
        Ok(state.transcript.last())
    }

    pub fn teach_back_continue(&mut self) -> TbResult<Transition> {
        let state = self.teach_back.as_ref().ok_or_else(|| {
            TeachbackError::InvalidTransition("teach-back was never entered".into())
        })?;
        self.require_active(StageKind::TeachBack, Some(state.record.is_submitted()))?;

        let transcript = state.transcript.clone();
        let explanation = state.explanation.clone();
        self.scoped(Scope::Stage(StageKind::TeachBack))
            .batch()
            .put(keys::TEACH_BACK_CONVERSATION, &transcript)?
            .put(keys::FINAL_TEACHING_EXPLANATION, &explanation)?
            .commit()?;
        self.scoped(Scope::Player)
            .batch()
            .put(keys::TEACH_BACK_CONVERSATION, &transcript)?
            .put(keys::FINAL_TEACHING_EXPLANATION, &explanation)?
            .commit()?;
        self.complete(StageKind::TeachBack)
    }

    // -----------------------------------------------------------------------
    // Quiz
    // -----------------------------------------------------------------------

    fn quiz_mut(&mut self) -> TbResult<&mut QuizState> {
        let submitted = self.quiz.as_ref().map(|q| q.record.is_submitted());
        self.require_active(StageKind::Quiz, submitted)?;
        self.quiz
            .as_mut()
            .ok_or_else(|| TeachbackError::InvalidTransition("quiz was never entered".into()))
    }

    fn choice_quiz_mut(&mut self) -> TbResult<&mut MultipleChoiceQuiz> {
        match &mut self.quiz_mut()?.form {
            QuizForm::MultipleChoice(quiz) => Ok(quiz),
            QuizForm::FreeResponse(_) => Err(TeachbackError::Validation(
                "this quiz is free response".into(),
            )),
        }
    }

    fn open_quiz_mut(&mut self) -> TbResult<&mut FreeResponseQuiz> {
        match &mut self.quiz_mut()?.form {
            QuizForm::FreeResponse(quiz) => Ok(quiz),
            QuizForm::MultipleChoice(_) => Err(TeachbackError::Validation(
                "this quiz is multiple choice".into(),
            )),
        }
    }

    pub fn quiz_select(&mut self, question_id: u32, option: usize) -> TbResult<()> {
        self.choice_quiz_mut()?.select(question_id, option)
    }

    /// Grade and persist the multiple-choice quiz. Every question must be answered.
    pub fn quiz_submit(&mut self) -> TbResult<QuizScore> {
        let quiz = self.choice_quiz_mut()?;
        let missing = quiz.unanswered();
        if !missing.is_empty() {
            let list = missing
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TeachbackError::Validation(format!(
                "Please answer every question (missing: {list})."
            )));
        }
        let graded = quiz.grade();
        let selections = quiz.selections().clone();
        let score = graded.score;

        self.scoped(Scope::Stage(StageKind::Quiz))
            .batch()
            .put(keys::QUIZ_ANSWERS, &selections)?
            .put(keys::QUIZ_SCORE, &score.correct)?
            .put(keys::QUIZ_TOTAL_QUESTIONS, &score.total)?
            .put(keys::QUIZ_SCORE_PERCENTAGE, &score.percentage)?
            .put(keys::QUIZ_ANSWER_DETAILS, &graded.details)?
            .put(keys::QUIZ_ANSWER_RECORDS, &graded.answers)?
            .put(keys::QUIZ_SUBMITTED, &true)?
            .commit()?;
        self.scoped(Scope::Player)
            .batch()
            .put(keys::QUIZ_SCORE, &score.correct)?
            .put(keys::QUIZ_TOTAL_QUESTIONS, &score.total)?
            .put(keys::QUIZ_SCORE_PERCENTAGE, &score.percentage)?
            .commit()?;

        info!(
            participant = %self.participant,
            correct = score.correct,
            total = score.total,
            "quiz graded"
        );
        self.complete(StageKind::Quiz)?;
        Ok(score)
    }

    /// Current free-response screen. Stamps and persists the start time the
    /// first time a question is shown.
    pub fn free_response_view(&mut self) -> TbResult<FreeResponseView> {
        let now = (self.now)();
        let view = self.open_quiz_mut()?.view(now);
        if let FreeResponseView::Question {
            question,
            started_at,
            first_render: true,
            ..
        } = view
        {
            self.scoped(Scope::Stage(StageKind::Quiz)).set(
                &keys::quiz_question(question.id, "StartTime"),
                &started_at.timestamp_millis(),
            )?;
        }
        Ok(view)
    }

    pub fn free_response_answer(&mut self, text: &str) -> TbResult<()> {
        self.open_quiz_mut()?.set_draft(text)
    }

    /// Record the current answer and move to the next question. Blank
    /// answers are rejected and nothing is written, as is a question that
    /// was never shown through [`Session::free_response_view`].
    pub fn free_response_advance(&mut self) -> TbResult<FreeResponseAnswer> {
        let now = (self.now)();
        let answer = self.open_quiz_mut()?.advance(now)?;
        let id = answer.question_id;
        self.scoped(Scope::Stage(StageKind::Quiz))
            .batch()
            .put(&keys::quiz_question(id, "Answer"), &answer.text)?
            .put(
                &keys::quiz_question(id, "EndTime"),
                &answer.end_time.timestamp_millis(),
            )?
            .put(&keys::quiz_question(id, "Duration"), &answer.duration_ms())?
            .commit()?;
        debug!(participant = %self.participant, question = id, "free response recorded");
        Ok(answer)
    }

    /// Leave the transition screen and close the quiz.
    pub fn free_response_finish(&mut self) -> TbResult<Transition> {
        let answers = self.open_quiz_mut()?.finish()?.to_vec();
        self.scoped(Scope::Stage(StageKind::Quiz))
            .set(keys::QUIZ_SUBMITTED, &true)?;
        self.scoped(Scope::Player)
            .set(keys::QUIZ_ANSWERS, &answers)?;
        self.complete(StageKind::Quiz)
    }

    // -----------------------------------------------------------------------
    // Exit survey
    // -----------------------------------------------------------------------

    fn survey_mut(&mut self) -> TbResult<&mut SurveyForm> {
        let submitted = self.survey.as_ref().map(|s| s.record.is_submitted());
        self.require_active(StageKind::ExitSurvey, submitted)?;
        self.survey
            .as_mut()
            .map(|s| &mut s.form)
            .ok_or_else(|| TeachbackError::InvalidTransition("survey was never entered".into()))
    }

    pub fn survey_rate(&mut self, index: usize, value: u8) -> TbResult<()> {
        self.survey_mut()?.rate(index, value)
    }

    pub fn survey_effort(&mut self, value: u8) -> TbResult<()> {
        self.survey_mut()?.set_mental_effort(value)
    }

    pub fn survey_comments(&mut self, text: &str) -> TbResult<()> {
        self.survey_mut()?.set_comments(text);
        Ok(())
    }

    /// Validate and persist the survey as one record, then finish.
    pub fn survey_submit(&mut self) -> TbResult<SurveyRecord> {
        let record = self.survey_mut()?.validate()?;
        self.scoped(Scope::Player)
            .batch()
            .put(keys::EXIT_SURVEY, &record)?
            .put(keys::EXIT_SURVEY_RATINGS, &record.ratings)?
            .put(keys::EXIT_SURVEY_EFFORT, &record.mental_effort)?
            .put(keys::EXIT_SURVEY_COMMENTS, &record.comments)?
            .put(keys::EXIT_SURVEY_COMPLETED, &true)?
            .commit()?;
        self.complete(StageKind::ExitSurvey)?;
        Ok(record)
    }

    pub fn record(&self) -> TbResult<ParticipantRecord> {
        ParticipantRecord::load(self.store, &self.participant)
    }
}

// ---------------------------------------------------------------------------
// ParticipantRecord
// ---------------------------------------------------------------------------

/// Everything persisted for one participant, grouped by scope.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantRecord {
    pub participant: String,
    pub game: BTreeMap<String, Value>,
    pub player: BTreeMap<String, Value>,
    pub stages: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ParticipantRecord {
    pub fn load<S: StateStore + ?Sized>(store: &S, participant: &str) -> TbResult<Self> {
        let game = store.entries(participant, Scope::Game)?.into_iter().collect();
        let player = store
            .entries(participant, Scope::Player)?
            .into_iter()
            .collect();
        let mut stages = BTreeMap::new();
        for kind in StageKind::ALL {
            let entries = store.entries(participant, Scope::Stage(kind))?;
            if !entries.is_empty() {
                stages.insert(kind.to_string(), entries.into_iter().collect());
            }
        }
        Ok(Self {
            participant: participant.to_string(),
            game,
            player,
            stages,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.game.is_empty() && self.player.is_empty() && self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::message::Role;
    use crate::persona::CONFUSED_FALLBACKS;
    use crate::quiz::CHOICE_QUESTIONS;
    use crate::state::InMemoryStateStore;
    use crate::survey::RATING_STATEMENTS;
    use crate::turn::test_helpers::ScriptedCompletion;

    fn replies(n: usize) -> ScriptedCompletion {
        ScriptedCompletion::new((0..n).map(|i| Ok(format!("reply {i}"))).collect())
    }

    fn session<'a>(
        store: &'a InMemoryStateStore,
        client: ScriptedCompletion,
        variant: QuizVariant,
    ) -> Session<'a, InMemoryStateStore, ScriptedCompletion> {
        Session::new(
            store,
            client,
            "p1",
            SessionConfig {
                quiz_variant: variant,
                ..Default::default()
            },
        )
        .with_rng(StdRng::seed_from_u64(3))
    }

    fn get(store: &InMemoryStateStore, scope: Scope, key: &str) -> Option<Value> {
        store.get("p1", scope, key).unwrap()
    }

    /// In-memory store that rejects the next write touching one key.
    struct FailingStore {
        inner: InMemoryStateStore,
        fail_on: Cell<Option<&'static str>>,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStateStore::new(),
                fail_on: Cell::new(None),
            }
        }

        fn fail_next(&self, key: &'static str) {
            self.fail_on.set(Some(key));
        }

        fn check<'k>(&self, mut keys: impl Iterator<Item = &'k str>) -> TbResult<()> {
            match self.fail_on.get() {
                Some(target) if keys.any(|k| k == target) => {
                    self.fail_on.set(None);
                    Err(TeachbackError::Storage("disk full".into()))
                }
                _ => Ok(()),
            }
        }
    }

    impl StateStore for FailingStore {
        fn get(&self, participant: &str, scope: Scope, key: &str) -> TbResult<Option<Value>> {
            self.inner.get(participant, scope, key)
        }

        fn set(&self, participant: &str, scope: Scope, key: &str, value: Value) -> TbResult<()> {
            self.check(std::iter::once(key))?;
            self.inner.set(participant, scope, key, value)
        }

        fn set_many(
            &self,
            participant: &str,
            scope: Scope,
            entries: Vec<(String, Value)>,
        ) -> TbResult<()> {
            self.check(entries.iter().map(|(k, _)| k.as_str()))?;
            self.inner.set_many(participant, scope, entries)
        }

        fn entries(&self, participant: &str, scope: Scope) -> TbResult<Vec<(String, Value)>> {
            self.inner.entries(participant, scope)
        }

        fn participants(&self) -> TbResult<Vec<String>> {
            self.inner.participants()
        }
    }

    fn finish_survey<S: StateStore + ?Sized, C: TextCompletion>(s: &mut Session<'_, S, C>) {
        for i in 0..RATING_STATEMENTS.len() {
            s.survey_rate(i, 4).unwrap();
        }
        s.survey_effort(6).unwrap();
        s.survey_submit().unwrap();
    }

    #[test]
    fn test_start_seeds_opening_message() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();

        assert_eq!(s.current_stage(), Some(StageKind::Teaching));
        let t = s.teaching().unwrap();
        assert_eq!(t.transcript.len(), 1);
        assert_eq!(t.transcript.messages()[0].role, Role::Tutor);
        assert!(s.quick_actions_available());
        assert_eq!(
            get(&store, Scope::Stage(StageKind::Teaching), keys::TEACHING_STARTED),
            Some(json!(true))
        );
        assert_eq!(
            get(&store, Scope::Game, keys::STAGES),
            Some(json!(["teaching", "teach_back", "quiz", "exit_survey"]))
        );
    }

    #[test]
    fn test_opening_not_reseeded_when_already_started() {
        let store = InMemoryStateStore::new();
        store
            .set(
                "p1",
                Scope::Stage(StageKind::Teaching),
                keys::TEACHING_STARTED,
                json!(true),
            )
            .unwrap();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();
        assert!(s.teaching().unwrap().transcript.is_empty());
    }

    #[test]
    fn test_teaching_turns_and_persistence() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(2), QuizVariant::MultipleChoice);
        s.start(Treatment::with_teach_back(false)).unwrap();

        assert!(s.teaching_send("   ").unwrap().is_none());
        let reply = s.teaching_send("What is it?").unwrap().unwrap().clone();
        assert_eq!(reply.content, "reply 0");
        assert!(!s.quick_actions_available());
        s.teaching_send("More please").unwrap();

        let roles: Vec<Role> = s
            .teaching()
            .unwrap()
            .transcript
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::Tutor, Role::Student, Role::Tutor, Role::Student, Role::Tutor]
        );

        let tr = s.teaching_continue().unwrap();
        assert_eq!(tr.state, FlowState::Active(StageKind::Quiz));
        let persisted = get(&store, Scope::Player, keys::TEACHING_CONVERSATION).unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 5);
        assert_eq!(
            get(&store, Scope::Stage(StageKind::Teaching), keys::TEACHING_CONVERSATION),
            Some(persisted)
        );
        assert_eq!(
            get(&store, Scope::Stage(StageKind::Teaching), keys::SUBMIT),
            Some(json!(true))
        );
    }

    #[test]
    fn test_teaching_closed_after_continue() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();
        s.teaching_continue().unwrap();

        assert!(matches!(
            s.teaching_send("hello"),
            Err(TeachbackError::StageClosed(_))
        ));
        assert!(matches!(
            s.teaching_continue(),
            Err(TeachbackError::StageClosed(_))
        ));
        assert_eq!(s.current_stage(), Some(StageKind::TeachBack));
    }

    #[test]
    fn test_quick_action_fallback() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, ScriptedCompletion::always_failing(), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();

        let reply = s.teaching_quick_action(QuickAction::Example).unwrap();
        assert_eq!(reply.content, QuickAction::Example.fallback());
        assert!(matches!(
            s.teaching_quick_action(QuickAction::Ready),
            Err(TeachbackError::Validation(_))
        ));
    }

    #[test]
    fn test_teaching_failure_reply_mentions_error() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, ScriptedCompletion::always_failing(), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();
        let reply = s.teaching_send("hi").unwrap().unwrap();
        assert!(reply.content.contains("connection refused"));
    }

    #[test]
    fn test_prompt_sees_prior_history_only() {
        let store = InMemoryStateStore::new();
        let client = Arc::new(replies(1));
        let mut s = Session::new(&store, client.clone(), "p1", SessionConfig::default());
        s.start(Treatment::default()).unwrap();
        s.teaching_send("first question").unwrap();

        let prompts = client.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].matches("first question").count(), 1);
        assert!(prompts[0].ends_with("Student: first question\n\nTutor:"));
    }

    #[test]
    fn test_teach_back_accumulates_explanation() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, ScriptedCompletion::always_failing(), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();
        s.teaching_continue().unwrap();

        assert_eq!(s.teach_back().unwrap().transcript.len(), 1);
        let reply = s.teach_back_send("Waves bunch up in front.").unwrap().unwrap();
        assert!(CONFUSED_FALLBACKS.contains(&reply.content.as_str()));
        s.teach_back_send("And stretch out behind.").unwrap();
        assert!(s.teach_back_send("").unwrap().is_none());

        let tb = s.teach_back().unwrap();
        assert_eq!(
            tb.explanation,
            "Waves bunch up in front.\n\nAnd stretch out behind."
        );
        assert!(tb.transcript.messages()[1].sent_at.is_some());
        assert_eq!(tb.transcript.messages()[1].role, Role::Tutor);
        assert_eq!(
            get(&store, Scope::Stage(StageKind::TeachBack), keys::TEACHING_EXPLANATION),
            Some(json!(tb.explanation))
        );

        s.teach_back_continue().unwrap();
        assert_eq!(
            get(&store, Scope::Player, keys::FINAL_TEACHING_EXPLANATION),
            Some(json!("Waves bunch up in front.\n\nAnd stretch out behind."))
        );
        assert_eq!(
            get(&store, Scope::Player, keys::TEACH_BACK_CONVERSATION)
                .unwrap()
                .as_array()
                .unwrap()
                .len(),
            5
        );
        assert_eq!(s.current_stage(), Some(StageKind::Quiz));
    }

    #[test]
    fn test_teach_back_skipped_when_disabled() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();
        assert_eq!(s.current_stage(), Some(StageKind::Quiz));
        assert!(matches!(
            s.teach_back_send("hi"),
            Err(TeachbackError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_multiple_choice_quiz_persists_score() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();

        s.quiz_select(1, 0).unwrap();
        let err = s.quiz_submit().unwrap_err();
        assert!(matches!(err, TeachbackError::Validation(_)));
        assert_eq!(get(&store, Scope::Player, keys::QUIZ_SCORE), None);

        for q in CHOICE_QUESTIONS {
            s.quiz_select(q.id, 0).unwrap();
        }
        let score = s.quiz_submit().unwrap();
        assert_eq!(score.correct, 3);
        assert_eq!(score.percentage, 50);

        let quiz_scope = Scope::Stage(StageKind::Quiz);
        assert_eq!(get(&store, quiz_scope, keys::QUIZ_SUBMITTED), Some(json!(true)));
        assert_eq!(get(&store, quiz_scope, keys::QUIZ_TOTAL_QUESTIONS), Some(json!(6)));
        assert_eq!(get(&store, Scope::Player, keys::QUIZ_SCORE_PERCENTAGE), Some(json!(50)));
        let details = get(&store, quiz_scope, keys::QUIZ_ANSWER_DETAILS).unwrap();
        assert_eq!(details["3"]["isCorrect"], json!(false));
        let answers = get(&store, quiz_scope, keys::QUIZ_ANSWER_RECORDS).unwrap();
        assert_eq!(answers.as_array().unwrap().len(), CHOICE_QUESTIONS.len());
        assert_eq!(
            answers[2],
            json!({
                "questionId": 3,
                "selectedOptionIndex": 0,
                "correctOptionIndex": 1,
                "isCorrect": false
            })
        );

        assert!(matches!(
            s.quiz_select(1, 1),
            Err(TeachbackError::StageClosed(_))
        ));
        assert_eq!(s.current_stage(), Some(StageKind::ExitSurvey));
    }

    #[test]
    fn test_free_response_blank_blocks_and_times_recorded() {
        let store = InMemoryStateStore::new();
        let now = Arc::new(Mutex::new(Utc::now()));
        let tick = now.clone();
        let mut s = session(&store, replies(0), QuizVariant::FreeResponse)
            .with_clock(move || *tick.lock().unwrap());
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();

        assert!(matches!(
            s.quiz_select(1, 0),
            Err(TeachbackError::Validation(_))
        ));

        let quiz_scope = Scope::Stage(StageKind::Quiz);
        let mut n = 0;
        loop {
            match s.free_response_view().unwrap() {
                FreeResponseView::Question { question, .. } => {
                    if question.id == 3 {
                        s.free_response_answer("   ").unwrap();
                        assert!(s.free_response_advance().is_err());
                        assert_eq!(get(&store, quiz_scope, "quizQ3Answer"), None);
                    }
                    *now.lock().unwrap() += Duration::seconds(20);
                    s.free_response_answer(&format!("answer {}", question.id))
                        .unwrap();
                    s.free_response_advance().unwrap();
                    n += 1;
                }
                FreeResponseView::Transition => break,
                FreeResponseView::Finished => panic!("finished before transition"),
            }
        }
        assert_eq!(n, crate::quiz::OPEN_QUESTIONS.len());
        assert_eq!(get(&store, quiz_scope, "quizQ3Answer"), Some(json!("answer 3")));
        assert_eq!(get(&store, quiz_scope, "quizQ1Duration"), Some(json!(20_000)));
        assert!(get(&store, quiz_scope, "quizQ1StartTime").is_some());
        assert_eq!(get(&store, quiz_scope, keys::SUBMIT), None);

        s.free_response_finish().unwrap();
        assert_eq!(get(&store, quiz_scope, keys::QUIZ_SUBMITTED), Some(json!(true)));
        assert_eq!(get(&store, quiz_scope, keys::SUBMIT), Some(json!(true)));
        assert!(s.free_response_view().is_err());
    }

    #[test]
    fn test_free_response_advance_requires_view() {
        let store = InMemoryStateStore::new();
        let now = Arc::new(Mutex::new(Utc::now()));
        let tick = now.clone();
        let mut s = session(&store, replies(0), QuizVariant::FreeResponse)
            .with_clock(move || *tick.lock().unwrap());
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();

        let quiz_scope = Scope::Stage(StageKind::Quiz);
        s.free_response_answer("the waves bunch up").unwrap();
        assert!(matches!(
            s.free_response_advance(),
            Err(TeachbackError::Validation(_))
        ));
        assert!(store.entries("p1", quiz_scope).unwrap().is_empty());

        let start = *now.lock().unwrap();
        s.free_response_view().unwrap();
        *now.lock().unwrap() += Duration::seconds(7);
        let answer = s.free_response_advance().unwrap();
        assert_eq!(answer.text, "the waves bunch up");
        let id = answer.question_id;
        assert_eq!(
            get(&store, quiz_scope, &keys::quiz_question(id, "StartTime")),
            Some(json!(start.timestamp_millis()))
        );
        assert_eq!(
            get(&store, quiz_scope, &keys::quiz_question(id, "Duration")),
            Some(json!(7_000))
        );
    }

    #[test]
    fn test_survey_rejects_incomplete_then_finishes() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();
        for q in CHOICE_QUESTIONS {
            s.quiz_select(q.id, q.correct).unwrap();
        }
        assert_eq!(s.quiz_submit().unwrap().percentage, 100);

        s.survey_rate(0, 3).unwrap();
        s.survey_effort(5).unwrap();
        assert!(s.survey_submit().is_err());
        assert_eq!(get(&store, Scope::Player, keys::EXIT_SURVEY), None);
        assert_eq!(get(&store, Scope::Player, keys::EXIT_SURVEY_COMPLETED), None);

        finish_survey(&mut s);
        assert!(s.is_done());
        assert_eq!(s.current_stage(), None);
        assert_eq!(
            get(&store, Scope::Player, keys::EXIT_SURVEY_COMMENTS),
            Some(json!("None"))
        );
        assert_eq!(
            get(&store, Scope::Player, keys::EXIT_SURVEY_COMPLETED),
            Some(json!(true))
        );
        assert_eq!(
            get(&store, Scope::Game, keys::FLOW_STATE),
            Some(json!({"state": "done"}))
        );
        assert!(s.survey_rate(0, 1).is_err());
    }

    #[test]
    fn test_record_snapshot() {
        let store = InMemoryStateStore::new();
        let mut s = session(&store, replies(0), QuizVariant::MultipleChoice);
        s.start(Treatment::default()).unwrap();
        s.teaching_continue().unwrap();

        let record = s.record().unwrap();
        assert_eq!(record.participant, "p1");
        assert!(record.player.contains_key(keys::TEACHING_CONVERSATION));
        assert!(record.stages.contains_key("teaching"));
        assert!(record.game.contains_key(keys::TREATMENT));
        assert_eq!(
            record.game[keys::FLOW_STATE],
            json!({"state": "active", "stage": "teach_back"})
        );
        assert_eq!(record.game[keys::STAGES].as_array().unwrap().len(), 4);

        let other = ParticipantRecord::load(&store, "nobody").unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_failed_submit_write_leaves_stage_open() {
        let store = FailingStore::new();
        let mut s = Session::new(&store, replies(1), "p1", SessionConfig::default());
        s.start(Treatment::default()).unwrap();
        let teaching = Scope::Stage(StageKind::Teaching);

        store.fail_next(keys::SUBMIT);
        assert!(matches!(
            s.teaching_continue(),
            Err(TeachbackError::Storage(_))
        ));
        assert_eq!(s.current_stage(), Some(StageKind::Teaching));
        assert!(!s.teaching().unwrap().record.is_submitted());
        assert_eq!(store.get("p1", teaching, keys::SUBMIT).unwrap(), None);
        assert!(s.teaching_send("Still there?").unwrap().is_some());

        // submit lands but the flow position does not
        store.fail_next(keys::FLOW_STATE);
        assert!(s.teaching_continue().is_err());
        assert_eq!(s.current_stage(), Some(StageKind::Teaching));
        assert_eq!(
            store.get("p1", Scope::Game, keys::FLOW_STATE).unwrap(),
            Some(json!({"state": "active", "stage": "teaching"}))
        );

        let tr = s.teaching_continue().unwrap();
        assert_eq!(tr.state, FlowState::Active(StageKind::TeachBack));
        assert_eq!(store.get("p1", teaching, keys::SUBMIT).unwrap(), Some(json!(true)));
        assert_eq!(
            store.get("p1", Scope::Game, keys::FLOW_STATE).unwrap(),
            Some(json!({"state": "active", "stage": "teach_back"}))
        );
        let persisted = store
            .get("p1", Scope::Player, keys::TEACHING_CONVERSATION)
            .unwrap()
            .unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_survey_batch_writes_nothing() {
        let store = FailingStore::new();
        let mut s = Session::new(&store, replies(0), "p1", SessionConfig::default());
        s.start(Treatment::with_teach_back(false)).unwrap();
        s.teaching_continue().unwrap();
        for q in CHOICE_QUESTIONS {
            s.quiz_select(q.id, q.correct).unwrap();
        }
        s.quiz_submit().unwrap();

        for i in 0..RATING_STATEMENTS.len() {
            s.survey_rate(i, 5).unwrap();
        }
        s.survey_effort(2).unwrap();
        s.survey_comments("Fun").unwrap();

        store.fail_next(keys::EXIT_SURVEY_COMPLETED);
        assert!(matches!(
            s.survey_submit(),
            Err(TeachbackError::Storage(_))
        ));
        let player = store.entries("p1", Scope::Player).unwrap();
        assert!(player.iter().all(|(k, _)| !k.starts_with("exitSurvey")));
        assert_eq!(
            store
                .get("p1", Scope::Stage(StageKind::ExitSurvey), keys::SUBMIT)
                .unwrap(),
            None
        );
        assert_eq!(s.current_stage(), Some(StageKind::ExitSurvey));

        let record = s.survey_submit().unwrap();
        assert_eq!(record.comments, "Fun");
        assert!(s.is_done());
        assert_eq!(
            store
                .get("p1", Scope::Player, keys::EXIT_SURVEY_COMPLETED)
                .unwrap(),
            Some(json!(true))
        );
    }
}
