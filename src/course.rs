//! Interactive course progression.
//!
//! A [`CourseEngine`] owns the attempt state of one learner working through
//! one course: which module is current, how many attempts each entered
//! module has taken, and the running score. Every action either applies a
//! transition or returns a [`TransitionError`]; nothing is silently ignored.

use crate::error::TransitionError;
use crate::models::{Course, CourseModule};
use crate::scoring::{self, Answers, QuizAttempt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    AwaitingFirstAttempt,
    ModulePending,
    ModulePassed,
    ModuleFailed,
    CourseCompleted,
}

/// Identifies one attempt at one module. A new key means a fresh answer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub module_index: usize,
    pub attempt: u32,
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.module_index, self.attempt)
    }
}

/// Aggregate handed to the submission recorder when a course completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseResult {
    pub score: usize,
    pub total_questions: usize,
    pub module_attempts: BTreeMap<usize, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleOutcome {
    pub module_index: usize,
    pub raw_score: usize,
    pub total: usize,
    pub passing_score: usize,
    pub status: ModuleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    NextModule(usize),
    /// Emitted once, on the transition into the completed state.
    Completed(CourseResult),
}

#[derive(Debug, Clone)]
pub struct CourseEngine {
    course: Course,
    current: usize,
    status: ModuleStatus,
    attempts: BTreeMap<usize, u32>,
    total_score: usize,
    completed: bool,
    attempt: QuizAttempt,
}

impl CourseEngine {
    /// A course without modules starts out completed.
    pub fn new(course: Course) -> Self {
        let mut engine = Self {
            course,
            current: 0,
            status: ModuleStatus::Pending,
            attempts: BTreeMap::new(),
            total_score: 0,
            completed: false,
            attempt: QuizAttempt::default(),
        };
        engine.reset();
        engine
    }

    fn reset(&mut self) {
        self.current = 0;
        self.status = ModuleStatus::Pending;
        self.attempts.clear();
        self.total_score = 0;
        self.completed = self.course.modules.is_empty();
        if !self.completed {
            self.enter_module(0);
        }
    }

    fn enter_module(&mut self, index: usize) {
        self.current = index;
        self.status = ModuleStatus::Pending;
        self.attempts.entry(index).or_insert(1);
        self.attempt = QuizAttempt::new(self.course.modules[index].quiz.len());
    }

    pub fn course(&self) -> &Course {
        &self.course
    }

    pub fn module_count(&self) -> usize {
        self.course.modules.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_module(&self) -> Option<&CourseModule> {
        if self.completed {
            None
        } else {
            self.course.modules.get(self.current)
        }
    }

    pub fn status(&self) -> ModuleStatus {
        self.status
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn total_score(&self) -> usize {
        self.total_score
    }

    pub fn total_questions(&self) -> usize {
        self.course.total_questions()
    }

    pub fn module_attempts(&self) -> &BTreeMap<usize, u32> {
        &self.attempts
    }

    pub fn attempt_count(&self, module_index: usize) -> Option<u32> {
        self.attempts.get(&module_index).copied()
    }

    pub fn attempt(&self) -> &QuizAttempt {
        &self.attempt
    }

    pub fn attempt_key(&self) -> AttemptKey {
        AttemptKey {
            module_index: self.current,
            attempt: self.attempt_count(self.current).unwrap_or(1),
        }
    }

    pub fn state(&self) -> EngineState {
        if self.completed {
            return EngineState::CourseCompleted;
        }
        match self.status {
            ModuleStatus::Passed => EngineState::ModulePassed,
            ModuleStatus::Failed => EngineState::ModuleFailed,
            ModuleStatus::Pending if self.current == 0 && self.attempt_count(0) == Some(1) => {
                EngineState::AwaitingFirstAttempt
            }
            ModuleStatus::Pending => EngineState::ModulePending,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.completed {
            100.0
        } else {
            self.current as f64 / self.module_count() as f64 * 100.0
        }
    }

    /// Final aggregate; reading it has no side effects.
    pub fn result(&self) -> Option<CourseResult> {
        self.completed.then(|| CourseResult {
            score: self.total_score,
            total_questions: self.total_questions(),
            module_attempts: self.attempts.clone(),
        })
    }

    /// Grades the current module. The caller guarantees a complete answer set;
    /// unanswered questions count as wrong.
    pub fn submit(&mut self, answers: Answers) -> Result<ModuleOutcome, TransitionError> {
        if self.completed {
            return Err(TransitionError::CourseCompleted);
        }
        if self.status != ModuleStatus::Pending {
            return Err(TransitionError::NotPending {
                module_index: self.current,
                status: self.status,
            });
        }
        let quiz = &self.course.modules[self.current].quiz;
        let total = quiz.len();
        let raw_score = scoring::score(quiz, &answers);
        self.attempt.seal(answers);

        let passing_score = scoring::passing_score(total);
        self.status = if total == 0 || raw_score >= passing_score {
            ModuleStatus::Passed
        } else {
            ModuleStatus::Failed
        };
        if self.status == ModuleStatus::Passed {
            self.total_score += raw_score;
        }
        Ok(ModuleOutcome {
            module_index: self.current,
            raw_score,
            total,
            passing_score,
            status: self.status,
        })
    }

    pub fn retry(&mut self) -> Result<AttemptKey, TransitionError> {
        if self.completed {
            return Err(TransitionError::CourseCompleted);
        }
        if self.status != ModuleStatus::Failed {
            return Err(TransitionError::NotFailed { status: self.status });
        }
        *self.attempts.entry(self.current).or_insert(1) += 1;
        self.status = ModuleStatus::Pending;
        self.attempt = QuizAttempt::new(self.course.modules[self.current].quiz.len());
        Ok(self.attempt_key())
    }

    pub fn advance(&mut self) -> Result<Advance, TransitionError> {
        if self.completed {
            return Err(TransitionError::CourseCompleted);
        }
        if self.status != ModuleStatus::Passed {
            return Err(TransitionError::NotPassed { status: self.status });
        }
        let next = self.current + 1;
        if next < self.module_count() {
            self.enter_module(next);
            return Ok(Advance::NextModule(next));
        }
        self.completed = true;
        self.attempt.set_disabled(true);
        self.result()
            .map(Advance::Completed)
            .ok_or(TransitionError::CourseCompleted)
    }

    /// Starts a brand new attempt at the whole course.
    pub fn restart(&mut self) {
        self.reset();
    }
}

/// Per-module line of the analytics breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub index: usize,
    pub title: String,
    /// Attempts it took to pass; `None` when the module was never reached.
    pub passed_in: Option<u32>,
}

impl fmt::Display for ModuleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.passed_in {
            Some(n) => write!(f, "M{}: {} - passed in {} attempt(s)", self.index + 1, self.title, n),
            None => write!(f, "M{}: {} - not completed", self.index + 1, self.title),
        }
    }
}

pub fn module_breakdown(course: &Course, module_attempts: &BTreeMap<usize, u32>) -> Vec<ModuleReport> {
    course
        .modules
        .iter()
        .enumerate()
        .map(|(index, module)| ModuleReport {
            index,
            title: module.title.clone(),
            passed_in: module_attempts.get(&index).copied().filter(|n| *n > 0),
        })
        .collect()
}
