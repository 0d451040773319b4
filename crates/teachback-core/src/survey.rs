use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{TbResult, TeachbackError};

pub const RATING_STATEMENTS: [&str; 7] = [
    "I felt the subject matter was difficult.",
    "I enjoyed learning about the Doppler Effect.",
    "I would like to learn this way in the future.",
    "I feel like I have a good understanding of how the Doppler Effect works.",
    "After this lesson, I would be interested in learning more about the Doppler Effect.",
    "I found the lesson about the Doppler Effect to be useful to me.",
    "I felt stressed while I was learning about the Doppler Effect.",
];

pub const MENTAL_EFFORT_QUESTION: &str =
    "How much mental effort did you invest while learning about the Doppler Effect?";

pub const SCALE: std::ops::RangeInclusive<u8> = 1..=7;

const NO_COMMENTS: &str = "None";

/// A completed exit survey. Only built through [`SurveyForm::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRecord {
    #[serde(rename = "part1_ratings")]
    pub ratings: BTreeMap<usize, u8>,
    #[serde(rename = "part2_mentalEffort")]
    pub mental_effort: u8,
    #[serde(rename = "part3_comments")]
    pub comments: String,
}

/// In-progress answers. Nothing here is persisted until validation passes.
#[derive(Debug, Clone, Default)]
pub struct SurveyForm {
    ratings: BTreeMap<usize, u8>,
    mental_effort: Option<u8>,
    comments: String,
}

impl SurveyForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate(&mut self, index: usize, value: u8) -> TbResult<()> {
        if index >= RATING_STATEMENTS.len() {
            return Err(TeachbackError::Validation(format!(
                "no rating statement {}",
                index + 1
            )));
        }
        check_scale(value)?;
        self.ratings.insert(index, value);
        Ok(())
    }

    pub fn set_mental_effort(&mut self, value: u8) -> TbResult<()> {
        check_scale(value)?;
        self.mental_effort = Some(value);
        Ok(())
    }

    pub fn set_comments(&mut self, comments: impl Into<String>) {
        self.comments = comments.into();
    }

    pub fn mental_effort(&self) -> Option<u8> {
        self.mental_effort
    }

    /// Check completeness and produce the record to persist.
    pub fn validate(&self) -> TbResult<SurveyRecord> {
        let all_rated = (0..RATING_STATEMENTS.len()).all(|i| self.ratings.contains_key(&i));
        if !all_rated {
            return Err(TeachbackError::Validation(
                "Please provide a rating for all statements in Part 1.".into(),
            ));
        }
        let mental_effort = self.mental_effort.ok_or_else(|| {
            TeachbackError::Validation("Please provide a mental effort rating in Part 2.".into())
        })?;

        let comments = if self.comments.is_empty() {
            NO_COMMENTS.to_string()
        } else {
            self.comments.clone()
        };

        Ok(SurveyRecord {
            ratings: self.ratings.clone(),
            mental_effort,
            comments,
        })
    }
}

fn check_scale(value: u8) -> TbResult<()> {
    if !SCALE.contains(&value) {
        return Err(TeachbackError::Validation(format!(
            "rating must be between {} and {}, got {value}",
            SCALE.start(),
            SCALE.end()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rated_form() -> SurveyForm {
        let mut form = SurveyForm::new();
        for i in 0..RATING_STATEMENTS.len() {
            form.rate(i, (i % 7 + 1) as u8).unwrap();
        }
        form
    }

    #[test]
    fn test_complete_form() {
        let mut form = rated_form();
        form.set_mental_effort(5).unwrap();
        form.set_comments("Great study");
        let record = form.validate().unwrap();
        assert_eq!(record.ratings.len(), 7);
        assert_eq!(record.mental_effort, 5);
        assert_eq!(record.comments, "Great study");
    }

    #[test]
    fn test_empty_comments_become_none() {
        let mut form = rated_form();
        form.set_mental_effort(3).unwrap();
        assert_eq!(form.validate().unwrap().comments, "None");
        // only the empty string is replaced; whitespace is kept as typed
        form.set_comments("   ");
        assert_eq!(form.validate().unwrap().comments, "   ");
    }

    #[test]
    fn test_each_missing_rating_blocks() {
        for missing in 0..RATING_STATEMENTS.len() {
            let mut form = SurveyForm::new();
            for i in (0..RATING_STATEMENTS.len()).filter(|&i| i != missing) {
                form.rate(i, 4).unwrap();
            }
            form.set_mental_effort(4).unwrap();
            let err = form.validate().unwrap_err();
            assert!(err.to_string().contains("Part 1"), "missing {missing}");
        }
    }

    #[test]
    fn test_missing_effort_blocks() {
        let form = rated_form();
        let err = form.validate().unwrap_err();
        assert!(err.to_string().contains("Part 2"));
    }

    #[test]
    fn test_scale_bounds() {
        let mut form = SurveyForm::new();
        assert!(form.rate(0, 0).is_err());
        assert!(form.rate(0, 8).is_err());
        assert!(form.rate(7, 3).is_err());
        assert!(form.set_mental_effort(0).is_err());
        assert!(form.rate(0, 1).is_ok());
        assert!(form.rate(6, 7).is_ok());
        assert_eq!(form.mental_effort(), None);
    }

    #[test]
    fn test_record_json_shape() {
        let mut form = rated_form();
        form.set_mental_effort(2).unwrap();
        let v = serde_json::to_value(form.validate().unwrap()).unwrap();
        assert_eq!(v["part2_mentalEffort"], 2);
        assert_eq!(v["part3_comments"], "None");
        assert_eq!(v["part1_ratings"]["0"], 1);
    }
}
