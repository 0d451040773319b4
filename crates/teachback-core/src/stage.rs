//! Stage progression: the ordered experiment plan and the driver that moves a
//! participant through it.
//!
//! The driver is a plain state machine. It takes lifecycle events and hands
//! back the next state plus the side effects the host should perform; it
//! never touches storage or timers itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TbResult, TeachbackError};

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Teaching,
    TeachBack,
    Quiz,
    ExitSurvey,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        Self::Teaching,
        Self::TeachBack,
        Self::Quiz,
        Self::ExitSurvey,
    ];

    /// Display name shown to participants and recorded with the stage.
    pub fn name(self) -> &'static str {
        match self {
            Self::Teaching => "AI Teaching",
            Self::TeachBack => "Participant Teaching",
            Self::Quiz => "Quiz",
            Self::ExitSurvey => "Exit Survey",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Teaching => write!(f, "teaching"),
            Self::TeachBack => write!(f, "teach_back"),
            Self::Quiz => write!(f, "quiz"),
            Self::ExitSurvey => write!(f, "exit_survey"),
        }
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "teaching" => Ok(Self::Teaching),
            "teach_back" | "teachback" => Ok(Self::TeachBack),
            "quiz" => Ok(Self::Quiz),
            "exit_survey" | "exitsurvey" => Ok(Self::ExitSurvey),
            _ => Err(format!("invalid stage: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Treatment & plan
// ---------------------------------------------------------------------------

/// Per-game experimental configuration, read once at game start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treatment {
    #[serde(rename = "teachBack", default, skip_serializing_if = "Option::is_none")]
    pub teach_back: Option<bool>,
}

impl Treatment {
    pub fn with_teach_back(teach_back: bool) -> Self {
        Self {
            teach_back: Some(teach_back),
        }
    }

    /// Unset counts as enabled; only an explicit `false` drops the stage.
    pub fn includes_teach_back(&self) -> bool {
        self.teach_back.unwrap_or(true)
    }
}

/// Advisory stage durations in seconds. The exit survey is untimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDurations {
    pub teaching: u32,
    pub teach_back: u32,
    pub quiz: u32,
}

impl Default for StageDurations {
    fn default() -> Self {
        Self {
            teaching: 300,
            teach_back: 300,
            quiz: 600,
        }
    }
}

impl StageDurations {
    pub fn for_stage(&self, kind: StageKind) -> Option<u32> {
        match kind {
            StageKind::Teaching => Some(self.teaching),
            StageKind::TeachBack => Some(self.teach_back),
            StageKind::Quiz => Some(self.quiz),
            StageKind::ExitSurvey => None,
        }
    }
}

pub fn plan_stages(treatment: &Treatment) -> Vec<StageKind> {
    let mut plan = vec![StageKind::Teaching];
    if treatment.includes_teach_back() {
        plan.push(StageKind::TeachBack);
    }
    plan.push(StageKind::Quiz);
    plan.push(StageKind::ExitSurvey);
    plan
}

// ---------------------------------------------------------------------------
// StageRecord
// ---------------------------------------------------------------------------

/// Per-visit gate flags for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub kind: StageKind,
    started: bool,
    submitted: bool,
}

impl StageRecord {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            started: false,
            submitted: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Returns `true` only for the call that flips the flag.
    pub fn mark_started(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    pub fn ensure_open(&self) -> TbResult<()> {
        if self.submitted {
            return Err(TeachbackError::StageClosed(self.kind.name().into()));
        }
        Ok(())
    }

    /// The submit flag only ever goes from false to true.
    pub fn submit(&mut self) -> TbResult<()> {
        self.ensure_open()?;
        self.submitted = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum FlowState {
    NotStarted,
    Active(StageKind),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    GameStarted { treatment: Treatment },
    StageSubmitted(StageKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateStage {
        kind: StageKind,
        name: &'static str,
        duration_secs: Option<u32>,
    },
    EnterStage(StageKind),
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: FlowState,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub struct Progression {
    plan: Vec<StageKind>,
    state: FlowState,
    durations: StageDurations,
}

impl Default for Progression {
    fn default() -> Self {
        Self::new(StageDurations::default())
    }
}

impl Progression {
    pub fn new(durations: StageDurations) -> Self {
        Self {
            plan: Vec::new(),
            state: FlowState::NotStarted,
            durations,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn plan(&self) -> &[StageKind] {
        &self.plan
    }

    pub fn durations(&self) -> &StageDurations {
        &self.durations
    }

    pub fn current(&self) -> Option<StageKind> {
        match self.state {
            FlowState::Active(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == FlowState::Done
    }

    /// Apply one lifecycle event. Rejected events leave the state untouched.
    pub fn handle(&mut self, event: Event) -> TbResult<Transition> {
        match (self.state, event) {
            (FlowState::NotStarted, Event::GameStarted { treatment }) => {
                self.plan = plan_stages(&treatment);
                let mut commands: Vec<Command> = self
                    .plan
                    .iter()
                    .map(|&kind| Command::CreateStage {
                        kind,
                        name: kind.name(),
                        duration_secs: self.durations.for_stage(kind),
                    })
                    .collect();
                let first = self.plan[0];
                commands.push(Command::EnterStage(first));
                self.state = FlowState::Active(first);
                Ok(Transition {
                    state: self.state,
                    commands,
                })
            }
            (FlowState::Active(active), Event::StageSubmitted(kind)) if active == kind => {
                let pos = self
                    .plan
                    .iter()
                    .position(|&k| k == active)
                    .ok_or_else(|| {
                        TeachbackError::InvalidTransition(format!("{active} is not in the plan"))
                    })?;
                let (state, command) = match self.plan.get(pos + 1) {
                    Some(&next) => (FlowState::Active(next), Command::EnterStage(next)),
                    None => (FlowState::Done, Command::Finish),
                };
                self.state = state;
                Ok(Transition {
                    state,
                    commands: vec![command],
                })
            }
            (state, event) => Err(TeachbackError::InvalidTransition(format!(
                "{event:?} while {state:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Advisory clock
// ---------------------------------------------------------------------------

/// Countdown shown alongside a stage. Display only: reaching zero never
/// submits anything.
#[derive(Debug, Clone, Copy)]
pub struct StageClock {
    started_at: DateTime<Utc>,
    duration: Option<Duration>,
}

impl StageClock {
    pub fn start(started_at: DateTime<Utc>, duration_secs: Option<u32>) -> Self {
        Self {
            started_at,
            duration: duration_secs.map(|s| Duration::seconds(i64::from(s))),
        }
    }

    /// `None` for untimed stages; otherwise saturates at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let duration = self.duration?;
        let left = duration - (now - self.started_at);
        Some(left.max(Duration::zero()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some_and(|d| d.is_zero())
    }
}
