//! Quiz grading: raw scores, the module passing threshold and the per-option
//! display states shown once an attempt is graded.

use crate::error::AttemptError;
use crate::models::{OptionKey, Question};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Learner selections keyed by question index.
pub type Answers = BTreeMap<usize, OptionKey>;

/// Share of a module's questions needed to pass it, in tenths.
const PASSING_TENTHS: usize = 7;

/// Number of questions answered with the keyed option. Missing answers count
/// as wrong.
pub fn score(quiz: &[Question], answers: &Answers) -> usize {
    quiz.iter()
        .enumerate()
        .filter(|(i, q)| answers.get(i) == Some(&q.correct))
        .count()
}

/// `ceil(total * 0.7)`, computed exactly.
pub fn passing_score(total: usize) -> usize {
    (total * PASSING_TENTHS).div_ceil(10)
}

pub fn is_complete(quiz: &[Question], answers: &Answers) -> bool {
    (0..quiz.len()).all(|i| answers.contains_key(&i))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionState {
    Unselected,
    Selected,
    Correct,
    IncorrectlySelected,
    Neutral,
}

pub fn option_state(question: &Question, selected: Option<OptionKey>, key: OptionKey, submitted: bool) -> OptionState {
    let is_selected = selected == Some(key);
    if !submitted {
        return if is_selected {
            OptionState::Selected
        } else {
            OptionState::Unselected
        };
    }
    if key == question.correct {
        OptionState::Correct
    } else if is_selected {
        OptionState::IncorrectlySelected
    } else {
        OptionState::Neutral
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionView {
    pub key: OptionKey,
    pub text: String,
    pub state: OptionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub index: usize,
    pub prompt: String,
    pub options: Vec<OptionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<OptionKey>,
    /// Revealed only after grading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

pub fn question_views(quiz: &[Question], answers: &Answers, submitted: bool) -> Vec<QuestionView> {
    quiz.iter()
        .enumerate()
        .map(|(index, q)| {
            let selected = answers.get(&index).copied();
            QuestionView {
                index,
                prompt: q.prompt.clone(),
                options: q
                    .options
                    .iter()
                    .map(|(key, text)| OptionView {
                        key: *key,
                        text: text.clone(),
                        state: option_state(q, selected, *key, submitted),
                    })
                    .collect(),
                selected,
                justification: submitted.then(|| q.justification.clone()),
            }
        })
        .collect()
}

/// Answer buffer for one attempt at one quiz. A retry gets a fresh buffer.
#[derive(Debug, Clone, Default)]
pub struct QuizAttempt {
    question_count: usize,
    answers: Answers,
    submitted: bool,
    disabled: bool,
}

impl QuizAttempt {
    pub fn new(question_count: usize) -> Self {
        Self {
            question_count,
            ..Self::default()
        }
    }

    /// Returns false when the selection was ignored: out of range, already
    /// graded or disabled by the enclosing module.
    pub fn select(&mut self, question_index: usize, key: OptionKey) -> bool {
        if self.submitted || self.disabled || question_index >= self.question_count {
            return false;
        }
        self.answers.insert(question_index, key);
        true
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn answered(&self) -> usize {
        self.answers.len()
    }

    pub fn can_submit(&self) -> bool {
        !self.submitted && !self.disabled && self.answers.len() == self.question_count
    }

    /// Grades the attempt. Only a complete answer set may be graded.
    pub fn submit(&mut self, quiz: &[Question]) -> Result<usize, AttemptError> {
        if self.submitted {
            return Err(AttemptError::AlreadySubmitted);
        }
        if self.disabled {
            return Err(AttemptError::Disabled);
        }
        if !is_complete(quiz, &self.answers) {
            return Err(AttemptError::Incomplete {
                answered: self.answers.len(),
                total: quiz.len(),
            });
        }
        self.submitted = true;
        Ok(score(quiz, &self.answers))
    }

    /// Marks the buffer as graded without a completeness check.
    pub(crate) fn seal(&mut self, answers: Answers) {
        self.answers = answers;
        self.submitted = true;
    }

    pub fn views(&self, quiz: &[Question]) -> Vec<QuestionView> {
        question_views(quiz, &self.answers, self.submitted)
    }
}
