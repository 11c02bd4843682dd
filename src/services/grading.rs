//! Pure grading: answer key plus detected bubbles in, correctness and score out.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::db::models::AnswerKeyRow;
use crate::db::types::PrintUploadStatus;
use crate::schemas::print::DetectedAnswer;

const UNKNOWN_SUBJECT: &str = "Unknown";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GradedItem {
    pub(crate) q: u32,
    pub(crate) question_id: i64,
    pub(crate) selected_index: i32,
    pub(crate) correct: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct SubjectTally {
    pub(crate) attempted: u32,
    pub(crate) correct: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GradingReport {
    pub(crate) items: Vec<GradedItem>,
    pub(crate) total_questions: usize,
    pub(crate) correct: u32,
    pub(crate) score: f64,
    pub(crate) accuracy: f64,
    pub(crate) subject_breakdown: BTreeMap<String, SubjectTally>,
    /// Detected rows with no question at that position.
    pub(crate) skipped: Vec<u32>,
}

impl GradingReport {
    pub(crate) fn attempted(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn incorrect(&self) -> usize {
        self.attempted() - self.correct as usize
    }

    pub(crate) fn summary(&self) -> serde_json::Value {
        json!({
            "total_questions": self.total_questions,
            "attempted": self.attempted(),
            "correct": self.correct,
            "incorrect": self.incorrect(),
            "accuracy": self.accuracy,
            "score": self.score,
            "subject_breakdown": self.subject_breakdown,
            "skipped_questions": self.skipped,
        })
    }
}

/// `key[n - 1]` answers sheet row `n`. Scores are relative to the whole key, so blank rows count
/// against the student.
pub(crate) fn grade(key: &[AnswerKeyRow], answers: &[DetectedAnswer]) -> GradingReport {
    let total_questions = key.len();
    let mut items = Vec::with_capacity(answers.len());
    let mut skipped = Vec::new();
    let mut subject_breakdown: BTreeMap<String, SubjectTally> = BTreeMap::new();
    let mut correct = 0_u32;

    for answer in answers {
        let question = (answer.q as usize).checked_sub(1).and_then(|index| key.get(index));
        let Some(question) = question else {
            skipped.push(answer.q);
            continue;
        };

        let selected_index = i32::from(answer.sel);
        let is_correct = question.correct_index == Some(selected_index);
        if is_correct {
            correct += 1;
        }

        let subject = if question.subject.trim().is_empty() {
            UNKNOWN_SUBJECT.to_string()
        } else {
            question.subject.clone()
        };
        let tally = subject_breakdown.entry(subject).or_default();
        tally.attempted += 1;
        if is_correct {
            tally.correct += 1;
        }

        items.push(GradedItem {
            q: answer.q,
            question_id: question.id,
            selected_index,
            correct: is_correct,
        });
    }

    let (score, accuracy) = if total_questions == 0 {
        (0.0, 0.0)
    } else {
        let accuracy = f64::from(correct) / total_questions as f64;
        (accuracy * 100.0, accuracy)
    };

    GradingReport { items, total_questions, correct, score, accuracy, subject_breakdown, skipped }
}

/// Routes low-confidence readings to a human instead of publishing them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConfidencePolicy {
    threshold: f64,
}

impl ConfidencePolicy {
    pub(crate) fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub(crate) fn terminal_status(&self, answers: &[DetectedAnswer]) -> PrintUploadStatus {
        if answers.iter().any(|answer| answer.conf < self.threshold) {
            PrintUploadStatus::NeedsReview
        } else {
            PrintUploadStatus::Graded
        }
    }

    pub(crate) fn is_low(&self, answer: &DetectedAnswer) -> bool {
        answer.conf < self.threshold
    }
}
