//! Comprehension assessment in two interchangeable configurations: a scored
//! multiple-choice form and a timed one-question-at-a-time free-response form.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TbResult, TeachbackError};

pub const NOT_ANSWERED: &str = "Not answered";

// ---------------------------------------------------------------------------
// Question banks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ChoiceQuestion {
    pub id: u32,
    pub question: &'static str,
    pub options: &'static [&'static str],
    pub correct: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenQuestion {
    pub id: u32,
    pub prompt: &'static str,
}

pub const CHOICE_QUESTIONS: &[ChoiceQuestion] = &[
    ChoiceQuestion {
        id: 1,
        question: "What is the Doppler Effect?",
        options: &[
            "The change in frequency of a wave when the source and observer are moving relative to each other",
            "The bending of light waves around obstacles",
            "The reflection of sound waves off surfaces",
            "The absorption of energy by matter",
        ],
        correct: 0,
    },
    ChoiceQuestion {
        id: 2,
        question: "When a sound source moves toward you, what happens to the frequency you hear?",
        options: &[
            "It increases (pitch gets higher)",
            "It decreases (pitch gets lower)",
            "It stays the same",
            "It becomes inaudible",
        ],
        correct: 0,
    },
    ChoiceQuestion {
        id: 3,
        question: "When a sound source moves away from you, what happens to the frequency you hear?",
        options: &[
            "It increases (pitch gets higher)",
            "It decreases (pitch gets lower)",
            "It stays the same",
            "It becomes louder",
        ],
        correct: 1,
    },
    ChoiceQuestion {
        id: 4,
        question: "Which of the following is a real-world example of the Doppler Effect?",
        options: &[
            "A siren on an ambulance sounds higher as it approaches and lower as it moves away",
            "Light bending when it passes through water",
            "Echoes in a canyon",
            "Sound getting louder when you're closer to the source",
        ],
        correct: 0,
    },
    ChoiceQuestion {
        id: 5,
        question: "The Doppler Effect applies to:",
        options: &[
            "Only sound waves",
            "Only light waves",
            "Both sound and light waves",
            "Only electromagnetic waves",
        ],
        correct: 2,
    },
    ChoiceQuestion {
        id: 6,
        question: "In astronomy, the Doppler Effect is used to:",
        options: &[
            "Measure the temperature of stars",
            "Determine if stars are moving toward or away from Earth",
            "Calculate the age of the universe",
            "Detect black holes",
        ],
        correct: 1,
    },
];

pub const OPEN_QUESTIONS: &[OpenQuestion] = &[
    OpenQuestion {
        id: 1,
        prompt: "In your own words, what is the Doppler Effect?",
    },
    OpenQuestion {
        id: 2,
        prompt: "An ambulance drives past you with its siren on. Describe how the pitch you hear changes and explain why.",
    },
    OpenQuestion {
        id: 3,
        prompt: "Why does the pitch of a sound depend on whether the source is moving toward or away from you?",
    },
    OpenQuestion {
        id: 4,
        prompt: "What do astronomers mean by red shift and blue shift, and what do they tell us about a star?",
    },
    OpenQuestion {
        id: 5,
        prompt: "Describe one situation from everyday life, other than a siren, where you could notice the Doppler Effect.",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuizVariant {
    #[default]
    MultipleChoice,
    FreeResponse,
}

impl fmt::Display for QuizVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultipleChoice => write!(f, "multiple-choice"),
            Self::FreeResponse => write!(f, "free-response"),
        }
    }
}

impl std::str::FromStr for QuizVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "multiple-choice" | "multiple_choice" | "mc" => Ok(Self::MultipleChoice),
            "free-response" | "free_response" | "open" => Ok(Self::FreeResponse),
            _ => Err(format!("invalid quiz variant: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// `round(100 * correct / total)`, with halves rounded up.
pub fn score_percentage(correct: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((200 * correct + total) / (2 * total)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizScore {
    pub correct: usize,
    pub total: usize,
    pub percentage: u32,
}

impl QuizScore {
    pub fn new(correct: usize, total: usize) -> Self {
        let correct = correct.min(total);
        Self {
            correct,
            total,
            percentage: score_percentage(correct, total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceAnswer {
    pub question_id: u32,
    pub selected_option_index: Option<usize>,
    pub correct_option_index: usize,
    pub is_correct: bool,
}

/// Human-readable per-question record kept for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerDetail {
    pub question: String,
    pub user_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone)]
pub struct GradedQuiz {
    pub answers: Vec<ChoiceAnswer>,
    pub details: BTreeMap<u32, AnswerDetail>,
    pub score: QuizScore,
}

// ---------------------------------------------------------------------------
// Multiple choice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MultipleChoiceQuiz {
    questions: &'static [ChoiceQuestion],
    selections: BTreeMap<u32, usize>,
}

impl Default for MultipleChoiceQuiz {
    fn default() -> Self {
        Self::new(CHOICE_QUESTIONS)
    }
}

impl MultipleChoiceQuiz {
    pub fn new(questions: &'static [ChoiceQuestion]) -> Self {
        Self {
            questions,
            selections: BTreeMap::new(),
        }
    }

    pub fn questions(&self) -> &'static [ChoiceQuestion] {
        self.questions
    }

    pub fn selections(&self) -> &BTreeMap<u32, usize> {
        &self.selections
    }

    pub fn select(&mut self, question_id: u32, option: usize) -> TbResult<()> {
        let q = self
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| TeachbackError::Validation(format!("no question {question_id}")))?;
        if option >= q.options.len() {
            return Err(TeachbackError::Validation(format!(
                "question {question_id} has no option {option}"
            )));
        }
        self.selections.insert(question_id, option);
        Ok(())
    }

    /// Ids of questions still without a selection, in quiz order.
    pub fn unanswered(&self) -> Vec<u32> {
        self.questions
            .iter()
            .filter(|q| !self.selections.contains_key(&q.id))
            .map(|q| q.id)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.unanswered().is_empty()
    }

    /// Compare every selection to the key. Missing selections count as wrong.
    pub fn grade(&self) -> GradedQuiz {
        let mut answers = Vec::with_capacity(self.questions.len());
        let mut details = BTreeMap::new();
        let mut correct = 0;

        for q in self.questions {
            let selected = self.selections.get(&q.id).copied();
            let is_correct = selected == Some(q.correct);
            if is_correct {
                correct += 1;
            }
            answers.push(ChoiceAnswer {
                question_id: q.id,
                selected_option_index: selected,
                correct_option_index: q.correct,
                is_correct,
            });
            details.insert(
                q.id,
                AnswerDetail {
                    question: q.question.to_string(),
                    user_answer: selected
                        .and_then(|i| q.options.get(i))
                        .map_or_else(|| NOT_ANSWERED.to_string(), |s| s.to_string()),
                    correct_answer: q.options[q.correct].to_string(),
                    is_correct,
                },
            );
        }

        GradedQuiz {
            answers,
            details,
            score: QuizScore::new(correct, self.questions.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Free response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeResponseAnswer {
    pub question_id: u32,
    pub text: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl FreeResponseAnswer {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Answering,
    Transition,
    Finished,
}

/// What the participant should currently see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeResponseView {
    Question {
        index: usize,
        total: usize,
        question: OpenQuestion,
        started_at: DateTime<Utc>,
        first_render: bool,
    },
    Transition,
    Finished,
}

#[derive(Debug, Clone)]
pub struct FreeResponseQuiz {
    questions: &'static [OpenQuestion],
    current: usize,
    draft: String,
    started_at: Option<DateTime<Utc>>,
    answers: Vec<FreeResponseAnswer>,
    phase: Phase,
}

impl Default for FreeResponseQuiz {
    fn default() -> Self {
        Self::new(OPEN_QUESTIONS)
    }
}

impl FreeResponseQuiz {
    pub fn new(questions: &'static [OpenQuestion]) -> Self {
        Self {
            questions,
            current: 0,
            draft: String::new(),
            started_at: None,
            answers: Vec::new(),
            phase: if questions.is_empty() {
                Phase::Transition
            } else {
                Phase::Answering
            },
        }
    }

    pub fn questions(&self) -> &'static [OpenQuestion] {
        self.questions
    }

    pub fn answers(&self) -> &[FreeResponseAnswer] {
        &self.answers
    }

    /// Render the current screen. The first render of a question stamps its
    /// start time; later renders keep it.
    pub fn view(&mut self, now: DateTime<Utc>) -> FreeResponseView {
        match self.phase {
            Phase::Transition => FreeResponseView::Transition,
            Phase::Finished => FreeResponseView::Finished,
            Phase::Answering => {
                let first_render = self.started_at.is_none();
                let started_at = *self.started_at.get_or_insert(now);
                FreeResponseView::Question {
                    index: self.current,
                    total: self.questions.len(),
                    question: self.questions[self.current],
                    started_at,
                    first_render,
                }
            }
        }
    }

    pub fn set_draft(&mut self, text: impl Into<String>) -> TbResult<()> {
        if self.phase != Phase::Answering {
            return Err(TeachbackError::Validation(
                "no question is awaiting an answer".into(),
            ));
        }
        self.draft = text.into();
        Ok(())
    }

    /// Record the current answer and move on. Blank answers block, and a
    /// question must have been rendered so its start time is known.
    pub fn advance(&mut self, now: DateTime<Utc>) -> TbResult<FreeResponseAnswer> {
        if self.phase != Phase::Answering {
            return Err(TeachbackError::Validation(
                "no question is awaiting an answer".into(),
            ));
        }
        let start_time = self.started_at.ok_or_else(|| {
            TeachbackError::Validation("the current question has not been shown yet".into())
        })?;
        let text = self.draft.trim();
        if text.is_empty() {
            return Err(TeachbackError::Validation(
                "Please enter an answer before continuing.".into(),
            ));
        }

        let question = self.questions[self.current];
        let answer = FreeResponseAnswer {
            question_id: question.id,
            text: text.to_string(),
            start_time,
            end_time: now,
        };
        self.answers.push(answer.clone());
        self.draft.clear();
        self.started_at = None;
        self.current += 1;
        if self.current >= self.questions.len() {
            self.phase = Phase::Transition;
        }
        Ok(answer)
    }

    /// Leave the one-time transition screen shown after the last question.
    pub fn finish(&mut self) -> TbResult<&[FreeResponseAnswer]> {
        if self.phase != Phase::Transition {
            return Err(TeachbackError::Validation(
                "questions remain unanswered".into(),
            ));
        }
        self.phase = Phase::Finished;
        Ok(&self.answers)
    }
}
