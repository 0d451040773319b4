pub mod completion;
pub mod error;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod message;
pub mod persona;
pub mod quiz;
pub mod session;
pub mod stage;
pub mod state;
pub mod survey;
pub mod turn;

pub use completion::TextCompletion;
pub use error::{TbResult, TeachbackError};
#[cfg(feature = "gemini")]
pub use gemini::GeminiClient;
pub use message::{Message, Role, Transcript};
pub use persona::{Persona, QuickAction};
pub use quiz::{
    FreeResponseAnswer, FreeResponseQuiz, FreeResponseView, MultipleChoiceQuiz, QuizScore,
    QuizVariant,
};
pub use session::{ParticipantRecord, QuizForm, Session, SessionConfig};
pub use stage::{
    Command, Event, FlowState, Progression, StageClock, StageDurations, StageKind, StageRecord,
    Transition, Treatment,
};
pub use state::{InMemoryStateStore, Scope, Scoped, StateStore};
pub use survey::{SurveyForm, SurveyRecord};
pub use turn::TurnEngine;
