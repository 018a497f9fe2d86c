//! Scoring engine: a pure function from a test and its answers to a grade.

use serde::{Deserialize, Serialize};

use crate::exam::{AnswerValue, Answers, Question, QuestionKind, QuestionOutcome, Test};

/// Minimum percentage needed to pass. Fixed, not configurable.
pub const PASS_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
  pub total_score:  u32,
  pub max_score:    u32,
  pub percentage:   f64,
  pub passed:       bool,
  pub per_question: Vec<QuestionOutcome>,
}

/// Grade `answers` against `test`.
///
/// Every question counts towards `max_score`, answered or not. Free-text
/// questions are never marked correct here; they need a human reviewer.
pub fn score(test: &Test, answers: &Answers) -> Score {
  let mut total_score = 0u32;
  let mut max_score = 0u32;
  let mut per_question = Vec::with_capacity(test.questions.len());

  for question in &test.questions {
    max_score = max_score.saturating_add(question.points);

    let correct = answers
      .get(&question.id)
      .is_some_and(|given| is_correct(question, given));
    let awarded = if correct { question.points } else { 0 };
    total_score = total_score.saturating_add(awarded);

    per_question.push(QuestionOutcome {
      question_id: question.id.clone(),
      correct,
      awarded,
      points: question.points,
    });
  }

  let percentage = if max_score == 0 {
    0.0
  } else {
    f64::from(total_score) * 100.0 / f64::from(max_score)
  };

  Score {
    total_score,
    max_score,
    percentage,
    passed: percentage >= PASS_THRESHOLD,
    per_question,
  }
}

fn is_correct(question: &Question, given: &AnswerValue) -> bool {
  let Some(expected) = &question.correct_answer else {
    return false;
  };

  match question.kind {
    // Exact, case-sensitive.
    QuestionKind::Single => match (given, expected) {
      (AnswerValue::One(given), AnswerValue::One(expected)) => given == expected,
      _ => false,
    },
    // Same size and every expected option present; order is irrelevant and
    // a subset earns nothing.
    QuestionKind::Multiple => {
      let given = given.as_slice();
      let expected = expected.as_slice();
      given.len() == expected.len() && expected.iter().all(|e| given.contains(e))
    }
    QuestionKind::Text => false,
  }
}
