//! Knowledge tests, timed sessions and their results.
//!
//! Tests are immutable once created. A session is a single timed attempt and
//! leaves `in_progress` exactly once. A result is written together with the
//! completion of its session and never changes afterwards.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  Error, Result,
  application::ApplicationType,
  id::{ApplicationId, DepartmentId, ResultId, SessionId, TestId, UserId},
};

// ─── Answers ─────────────────────────────────────────────────────────────────

/// A submitted or expected answer: one option, or a set of options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
  One(String),
  Many(Vec<String>),
}

impl AnswerValue {
  pub fn as_slice(&self) -> &[String] {
    match self {
      Self::One(value) => std::slice::from_ref(value),
      Self::Many(values) => values,
    }
  }
}

/// Answers keyed by question id.
pub type Answers = BTreeMap<String, AnswerValue>;

// ─── Test definition ─────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QuestionKind {
  Single,
  Multiple,
  Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
  pub id:             String,
  pub prompt:         String,
  #[serde(rename = "type")]
  pub kind:           QuestionKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options:        Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub correct_answer: Option<AnswerValue>,
  pub points:         u32,
}

/// Loose pointer to what a test is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedTo {
  #[serde(default)]
  pub application_id: Option<ApplicationId>,
  #[serde(default)]
  pub department_id:  Option<DepartmentId>,
  #[serde(rename = "type")]
  pub kind:           ApplicationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
  pub id:               TestId,
  pub title:            String,
  pub related_to:       RelatedTo,
  pub duration_minutes: u32,
  pub questions:        Vec<Question>,
  pub created_at:       DateTime<Utc>,
}

impl Test {
  pub fn duration(&self) -> Duration { Duration::minutes(i64::from(self.duration_minutes)) }

  /// The test as shown to the person taking it: no correct answers.
  pub fn redacted(&self) -> PublicTest {
    PublicTest {
      id:               self.id,
      title:            self.title.clone(),
      related_to:       self.related_to.clone(),
      duration_minutes: self.duration_minutes,
      questions:        self
        .questions
        .iter()
        .map(|q| PublicQuestion {
          id:      q.id.clone(),
          prompt:  q.prompt.clone(),
          kind:    q.kind,
          options: q.options.clone(),
          points:  q.points,
        })
        .collect(),
    }
  }
}

/// A question without its correct answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicQuestion {
  pub id:      String,
  pub prompt:  String,
  #[serde(rename = "type")]
  pub kind:    QuestionKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options: Option<Vec<String>>,
  pub points:  u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTest {
  pub id:               TestId,
  pub title:            String,
  pub related_to:       RelatedTo,
  pub duration_minutes: u32,
  pub questions:        Vec<PublicQuestion>,
}

/// Input for creating a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTest {
  pub title:            String,
  pub related_to:       RelatedTo,
  pub duration_minutes: u32,
  pub questions:        Vec<Question>,
}

impl NewTest {
  /// Reject definitions the scoring engine could not grade sensibly.
  pub fn validate(&self) -> Result<()> {
    if self.title.trim().is_empty() {
      return Err(Error::Validation("test title must not be empty".into()));
    }
    if self.duration_minutes == 0 {
      return Err(Error::Validation("test duration must be positive".into()));
    }
    if self.questions.is_empty() {
      return Err(Error::Validation("test must have at least one question".into()));
    }

    let mut seen = BTreeSet::new();
    let mut total_points = 0u32;
    for q in &self.questions {
      if !seen.insert(q.id.as_str()) {
        return Err(Error::Validation(format!("duplicate question id {:?}", q.id)));
      }
      if q.points == 0 {
        return Err(Error::Validation(format!(
          "question {:?} must be worth at least one point",
          q.id
        )));
      }
      total_points = total_points
        .checked_add(q.points)
        .ok_or_else(|| Error::Validation("total points of the test are too large".into()))?;
      validate_choice(q)?;
    }
    Ok(())
  }
}

fn validate_choice(q: &Question) -> Result<()> {
  let (options, correct) = match (q.kind, &q.options, &q.correct_answer) {
    (QuestionKind::Text, ..) => return Ok(()),
    (_, Some(options), Some(correct)) if !options.is_empty() => (options, correct),
    _ => {
      return Err(Error::Validation(format!(
        "{} question {:?} needs options and a correct answer",
        q.kind, q.id
      )));
    }
  };

  let shape_ok = match (q.kind, correct) {
    (QuestionKind::Single, AnswerValue::One(_)) => true,
    (QuestionKind::Multiple, AnswerValue::Many(values)) => !values.is_empty(),
    _ => false,
  };
  if !shape_ok {
    return Err(Error::Validation(format!(
      "correct answer of question {:?} does not fit a {} question",
      q.id, q.kind
    )));
  }

  if let Some(stray) = correct.as_slice().iter().find(|v| !options.contains(*v)) {
    return Err(Error::Validation(format!(
      "correct answer {stray:?} of question {:?} is not among its options",
      q.id
    )));
  }
  Ok(())
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
  InProgress,
  Completed,
  Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSession {
  pub id:             SessionId,
  pub user_id:        UserId,
  pub test_id:        TestId,
  pub application_id: Option<ApplicationId>,
  pub start_time:     DateTime<Utc>,
  pub end_time:       Option<DateTime<Utc>>,
  pub status:         SessionStatus,
}

impl TestSession {
  pub fn is_active(&self) -> bool { self.status == SessionStatus::InProgress }

  /// Whether more time than `limit` has passed since the session started.
  pub fn is_overdue(&self, limit: Duration, now: DateTime<Utc>) -> bool {
    now - self.start_time > limit
  }
}

#[derive(Debug, Clone)]
pub struct NewSession {
  pub user_id:        UserId,
  pub test_id:        TestId,
  pub application_id: Option<ApplicationId>,
  pub start_time:     DateTime<Utc>,
}

/// Outcome of a conditional session insert.
#[derive(Debug, Clone)]
pub enum SessionInsert {
  Created(TestSession),
  /// A live session already held the `(user, test)` slot; nothing was written.
  Existing(TestSession),
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Grading of a single question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOutcome {
  pub question_id: String,
  pub correct:     bool,
  pub awarded:     u32,
  pub points:      u32,
}

/// What the test-taking client sends on submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerSheet {
  #[serde(default)]
  pub answers:          Answers,
  /// Client-reported seconds spent; stored for audit only.
  #[serde(default)]
  pub time_spent:       u32,
  #[serde(default)]
  pub focus_lost_count: u32,
  #[serde(default)]
  pub warnings_count:   u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
  pub id:               ResultId,
  pub user_id:          UserId,
  pub test_id:          TestId,
  pub session_id:       SessionId,
  pub application_id:   Option<ApplicationId>,
  pub score:            u32,
  pub max_score:        u32,
  pub percentage:       f64,
  pub passed:           bool,
  pub time_spent:       u32,
  pub focus_lost_count: u32,
  pub warnings_count:   u32,
  pub answers:          Answers,
  pub results:          Vec<QuestionOutcome>,
  pub created_at:       DateTime<Utc>,
}

/// A result about to be written alongside its session's completion.
#[derive(Debug, Clone)]
pub struct NewTestResult {
  pub user_id:          UserId,
  pub test_id:          TestId,
  pub session_id:       SessionId,
  pub application_id:   Option<ApplicationId>,
  pub score:            u32,
  pub max_score:        u32,
  pub percentage:       f64,
  pub passed:           bool,
  pub time_spent:       u32,
  pub focus_lost_count: u32,
  pub warnings_count:   u32,
  pub answers:          Answers,
  pub results:          Vec<QuestionOutcome>,
  pub created_at:       DateTime<Utc>,
}

impl NewTestResult {
  pub fn into_result(self, id: ResultId) -> TestResult {
    TestResult {
      id,
      user_id: self.user_id,
      test_id: self.test_id,
      session_id: self.session_id,
      application_id: self.application_id,
      score: self.score,
      max_score: self.max_score,
      percentage: self.percentage,
      passed: self.passed,
      time_spent: self.time_spent,
      focus_lost_count: self.focus_lost_count,
      warnings_count: self.warnings_count,
      answers: self.answers,
      results: self.results,
      created_at: self.created_at,
    }
  }
}
