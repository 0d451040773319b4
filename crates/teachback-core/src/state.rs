//! Scoped key-value persistence for participant state.
//!
//! Every value is addressed by participant, scope and key. Stage scope is the
//! working area of one stage; player scope holds the mirrored fields read by
//! downstream analysis; game scope holds the treatment and stage plan.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::TbResult;
use crate::stage::StageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Game,
    Player,
    Stage(StageKind),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Game => write!(f, "game"),
            Self::Player => write!(f, "player"),
            Self::Stage(kind) => write!(f, "stage:{kind}"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(Self::Game),
            "player" => Ok(Self::Player),
            other => match other.strip_prefix("stage:") {
                Some(kind) => kind.parse().map(Self::Stage),
                None => Err(format!("invalid scope: {s}")),
            },
        }
    }
}

pub trait StateStore {
    fn get(&self, participant: &str, scope: Scope, key: &str) -> TbResult<Option<Value>>;
    fn set(&self, participant: &str, scope: Scope, key: &str, value: Value) -> TbResult<()>;

    /// Write several keys as one unit.
    fn set_many(&self, participant: &str, scope: Scope, entries: Vec<(String, Value)>)
        -> TbResult<()>;

    /// All keys in a scope, sorted by key.
    fn entries(&self, participant: &str, scope: Scope) -> TbResult<Vec<(String, Value)>>;

    fn participants(&self) -> TbResult<Vec<String>>;
}

/// Typed view over one participant's scope.
pub struct Scoped<'a, S: ?Sized> {
    store: &'a S,
    participant: &'a str,
    scope: Scope,
}

impl<'a, S: StateStore + ?Sized> Scoped<'a, S> {
    pub fn new(store: &'a S, participant: &'a str, scope: Scope) -> Self {
        Self {
            store,
            participant,
            scope,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> TbResult<Option<T>> {
        match self.store.get(self.participant, self.scope, key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> TbResult<()> {
        let value = serde_json::to_value(value)?;
        self.store.set(self.participant, self.scope, key, value)
    }

    /// Missing flags read as false.
    pub fn flag(&self, key: &str) -> TbResult<bool> {
        Ok(self.get::<bool>(key)?.unwrap_or(false))
    }

    pub fn batch(&self) -> Batch<'_, 'a, S> {
        Batch {
            scoped: self,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> TbResult<Vec<(String, Value)>> {
        self.store.entries(self.participant, self.scope)
    }
}

/// Collects writes and commits them through [`StateStore::set_many`].
pub struct Batch<'s, 'a, S: ?Sized> {
    scoped: &'s Scoped<'a, S>,
    entries: Vec<(String, Value)>,
}

impl<S: StateStore + ?Sized> Batch<'_, '_, S> {
    pub fn put<T: Serialize + ?Sized>(mut self, key: &str, value: &T) -> TbResult<Self> {
        self.entries
            .push((key.to_string(), serde_json::to_value(value)?));
        Ok(self)
    }

    pub fn commit(self) -> TbResult<()> {
        let Scoped {
            store,
            participant,
            scope,
        } = self.scoped;
        store.set_many(participant, *scope, self.entries)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Volatile store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    values: RefCell<BTreeMap<(String, Scope, String), Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, participant: &str, scope: Scope, key: &str) -> TbResult<Option<Value>> {
        Ok(self
            .values
            .borrow()
            .get(&(participant.to_string(), scope, key.to_string()))
            .cloned())
    }

    fn set(&self, participant: &str, scope: Scope, key: &str, value: Value) -> TbResult<()> {
        self.values
            .borrow_mut()
            .insert((participant.to_string(), scope, key.to_string()), value);
        Ok(())
    }

    fn set_many(
        &self,
        participant: &str,
        scope: Scope,
        entries: Vec<(String, Value)>,
    ) -> TbResult<()> {
        let mut values = self.values.borrow_mut();
        for (key, value) in entries {
            values.insert((participant.to_string(), scope, key), value);
        }
        Ok(())
    }

    fn entries(&self, participant: &str, scope: Scope) -> TbResult<Vec<(String, Value)>> {
        Ok(self
            .values
            .borrow()
            .iter()
            .filter(|((p, s, _), _)| p == participant && *s == scope)
            .map(|((_, _, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn participants(&self) -> TbResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .values
            .borrow()
            .keys()
            .map(|(p, _, _)| p.clone())
            .collect();
        ids.dedup();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub mod keys {
    pub const SUBMIT: &str = "submit";

    pub const TREATMENT: &str = "treatment";
    pub const STAGES: &str = "stages";
    pub const FLOW_STATE: &str = "flowState";

    pub const TEACHING_STARTED: &str = "teachingStarted";
    pub const TEACHING_CONVERSATION: &str = "teachingConversation";

    pub const TEACH_BACK_STARTED: &str = "teachingBackStarted";
    pub const TEACHING_EXPLANATION: &str = "teachingExplanation";
    pub const TEACH_BACK_CONVERSATION: &str = "teachingBackConversation";
    pub const FINAL_TEACHING_EXPLANATION: &str = "finalTeachingExplanation";

    pub const QUIZ_ANSWERS: &str = "quizAnswers";
    pub const QUIZ_SCORE: &str = "quizScore";
    pub const QUIZ_TOTAL_QUESTIONS: &str = "quizTotalQuestions";
    pub const QUIZ_SCORE_PERCENTAGE: &str = "quizScorePercentage";
    pub const QUIZ_ANSWER_DETAILS: &str = "quizAnswerDetails";
    pub const QUIZ_ANSWER_RECORDS: &str = "quizAnswerRecords";
    pub const QUIZ_SUBMITTED: &str = "quizSubmitted";

    pub const EXIT_SURVEY: &str = "exitSurvey";
    pub const EXIT_SURVEY_RATINGS: &str = "exitSurveyPart1Ratings";
    pub const EXIT_SURVEY_EFFORT: &str = "exitSurveyPart2MentalEffort";
    pub const EXIT_SURVEY_COMMENTS: &str = "exitSurveyPart3Comments";
    pub const EXIT_SURVEY_COMPLETED: &str = "exitSurveyCompleted";

    pub fn quiz_question(n: u32, field: &str) -> String {
        format!("quizQ{n}{field}")
    }
}
