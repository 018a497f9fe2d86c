//! Encoding and decoding helpers between Muster domain types and the plain
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with a fixed microsecond
//! precision and a `Z` suffix, so text comparison orders them correctly.
//! Enums are stored as their snake_case names. Structured fields (payloads,
//! questions, answers) are stored as compact JSON.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use muster_core::{
  application::{Application, ApplicationStatus, ApplicationType, StatusEntry},
  exam::{SessionStatus, Test, TestResult, TestSession},
  id::{ApplicationId, CharacterId, ResultId, SessionId, TestId, UserId},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> { s.map(decode_dt).transpose() }

// ─── Enums ───────────────────────────────────────────────────────────────────

fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| Error::UnknownValue {
    column,
    value: s.to_owned(),
  })
}

pub fn decode_status(s: &str) -> Result<ApplicationStatus> { decode_enum("status", s) }

pub fn decode_kind(s: &str) -> Result<ApplicationType> { decode_enum("kind", s) }

pub fn decode_session_status(s: &str) -> Result<SessionStatus> { decode_enum("session status", s) }

// ─── JSON ────────────────────────────────────────────────────────────────────

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  Ok(serde_json::to_string(value)?)
}

pub fn decode_json<T: DeserializeOwned>(s: &str) -> Result<T> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values of an `application_history` row.
pub struct RawStatusEntry {
  pub status:      String,
  pub at:          String,
  pub comment:     Option<String>,
  pub reviewer_id: Option<i64>,
}

impl RawStatusEntry {
  fn into_entry(self) -> Result<StatusEntry> {
    Ok(StatusEntry {
      status:      decode_status(&self.status)?,
      at:          decode_dt(&self.at)?,
      comment:     self.comment,
      reviewer_id: self.reviewer_id.map(UserId),
    })
  }
}

/// Raw values of an `applications` row plus its history, oldest first.
pub struct RawApplication {
  pub application_id: i64,
  pub author_id:      i64,
  pub character_id:   Option<i64>,
  pub kind:           String,
  pub status:         String,
  pub data_json:      String,
  pub reviewer_id:    Option<i64>,
  pub review_comment: Option<String>,
  pub created_at:     String,
  pub updated_at:     String,
  pub history:        Vec<RawStatusEntry>,
}

impl RawApplication {
  pub fn into_application(self) -> Result<Application> {
    Ok(Application {
      id:             ApplicationId(self.application_id),
      author_id:      UserId(self.author_id),
      character_id:   self.character_id.map(CharacterId),
      kind:           decode_kind(&self.kind)?,
      status:         decode_status(&self.status)?,
      status_history: self
        .history
        .into_iter()
        .map(RawStatusEntry::into_entry)
        .collect::<Result<_>>()?,
      data:           decode_json(&self.data_json)?,
      reviewer_id:    self.reviewer_id.map(UserId),
      review_comment: self.review_comment,
      created_at:     decode_dt(&self.created_at)?,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values of a `tests` row.
pub struct RawTest {
  pub test_id:          i64,
  pub title:            String,
  pub related_json:     String,
  pub duration_minutes: u32,
  pub questions_json:   String,
  pub created_at:       String,
}

impl RawTest {
  pub fn into_test(self) -> Result<Test> {
    Ok(Test {
      id:               TestId(self.test_id),
      title:            self.title,
      related_to:       decode_json(&self.related_json)?,
      duration_minutes: self.duration_minutes,
      questions:        decode_json(&self.questions_json)?,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values of a `test_sessions` row.
pub struct RawSession {
  pub session_id:     i64,
  pub user_id:        i64,
  pub test_id:        i64,
  pub application_id: Option<i64>,
  pub start_time:     String,
  pub end_time:       Option<String>,
  pub status:         String,
}

impl RawSession {
  pub fn into_session(self) -> Result<TestSession> {
    Ok(TestSession {
      id:             SessionId(self.session_id),
      user_id:        UserId(self.user_id),
      test_id:        TestId(self.test_id),
      application_id: self.application_id.map(ApplicationId),
      start_time:     decode_dt(&self.start_time)?,
      end_time:       decode_opt_dt(self.end_time.as_deref())?,
      status:         decode_session_status(&self.status)?,
    })
  }
}

/// Raw values of a `test_results` row.
pub struct RawResult {
  pub result_id:        i64,
  pub user_id:          i64,
  pub test_id:          i64,
  pub session_id:       i64,
  pub application_id:   Option<i64>,
  pub score:            u32,
  pub max_score:        u32,
  pub percentage:       f64,
  pub passed:           bool,
  pub time_spent:       u32,
  pub focus_lost_count: u32,
  pub warnings_count:   u32,
  pub answers_json:     String,
  pub results_json:     String,
  pub created_at:       String,
}

impl RawResult {
  pub fn into_result(self) -> Result<TestResult> {
    Ok(TestResult {
      id:               ResultId(self.result_id),
      user_id:          UserId(self.user_id),
      test_id:          TestId(self.test_id),
      session_id:       SessionId(self.session_id),
      application_id:   self.application_id.map(ApplicationId),
      score:            self.score,
      max_score:        self.max_score,
      percentage:       self.percentage,
      passed:           self.passed,
      time_spent:       self.time_spent,
      focus_lost_count: self.focus_lost_count,
      warnings_count:   self.warnings_count,
      answers:          decode_json(&self.answers_json)?,
      results:          decode_json(&self.results_json)?,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}
