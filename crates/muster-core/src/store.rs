//! The `RecordStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `muster-store-sqlite`).
//! The workflow components depend on this abstraction, not on any concrete
//! backend.
//!
//! Three operations carry the concurrency guarantees of the engine and must
//! be atomic in every implementation:
//!
//! - [`RecordStore::transition_application`] is a compare-and-swap on status;
//! - [`RecordStore::create_session_exclusive`] is a conditional insert keyed on
//!   `(user, test)` among `in_progress` sessions;
//! - [`RecordStore::complete_session`] only succeeds for an `in_progress`
//!   session and writes the result in the same step.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
  application::{Application, ApplicationStatus, ApplicationType, NewApplication, StatusChange},
  exam::{NewSession, NewTest, NewTestResult, SessionInsert, SessionStatus, Test, TestResult, TestSession},
  id::{ApplicationId, SessionId, TestId, UserId},
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`RecordStore::list_applications`].
#[derive(Debug, Clone, Default)]
pub struct ApplicationQuery {
  pub author_id: Option<UserId>,
  /// Restrict to these types; empty means any type.
  pub kinds:     Vec<ApplicationType>,
  pub status:    Option<ApplicationStatus>,
}

impl ApplicationQuery {
  pub fn by_author(author_id: UserId) -> Self {
    Self {
      author_id: Some(author_id),
      ..Default::default()
    }
  }

  pub fn of_kinds(mut self, kinds: &[ApplicationType]) -> Self {
    self.kinds = kinds.to_vec();
    self
  }

  pub fn matches(&self, app: &Application) -> bool {
    self.author_id.is_none_or(|id| id == app.author_id)
      && (self.kinds.is_empty() || self.kinds.contains(&app.kind))
      && self.status.is_none_or(|s| s == app.status)
  }
}

/// Parameters for [`RecordStore::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
  pub user_id: Option<UserId>,
  pub test_id: Option<TestId>,
  pub status:  Option<SessionStatus>,
}

impl SessionQuery {
  pub fn matches(&self, session: &TestSession) -> bool {
    self.user_id.is_none_or(|id| id == session.user_id)
      && self.test_id.is_none_or(|id| id == session.test_id)
      && self.status.is_none_or(|s| s == session.status)
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a Muster record store backend.
///
/// Ids are assigned by the store. Status history and results are
/// append-only; nothing is ever deleted.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait RecordStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Applications ──────────────────────────────────────────────────────

  /// Persist a new application in `pending` with a single history entry
  /// stamped `input.submitted_at`.
  fn create_application(
    &self,
    input: NewApplication,
  ) -> impl Future<Output = Result<Application, Self::Error>> + Send + '_;

  fn get_application(
    &self,
    id: ApplicationId,
  ) -> impl Future<Output = Result<Option<Application>, Self::Error>> + Send + '_;

  fn list_applications<'a>(
    &'a self,
    query: &'a ApplicationQuery,
  ) -> impl Future<Output = Result<Vec<Application>, Self::Error>> + Send + 'a;

  /// Apply `change` only if the application is still in `expected`, appending
  /// the history entry in the same transaction.
  ///
  /// Returns the updated application, or `None` when the id is unknown or the
  /// status no longer matches.
  fn transition_application(
    &self,
    id: ApplicationId,
    expected: ApplicationStatus,
    change: StatusChange,
  ) -> impl Future<Output = Result<Option<Application>, Self::Error>> + Send + '_;

  // ── Tests ─────────────────────────────────────────────────────────────

  fn create_test(
    &self,
    input: NewTest,
    created_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Test, Self::Error>> + Send + '_;

  fn get_test(
    &self,
    id: TestId,
  ) -> impl Future<Output = Result<Option<Test>, Self::Error>> + Send + '_;

  // ── Sessions ──────────────────────────────────────────────────────────

  /// Insert a session unless an `in_progress` one already exists for the
  /// same `(user, test)`, in which case that one is returned untouched.
  fn create_session_exclusive(
    &self,
    input: NewSession,
  ) -> impl Future<Output = Result<SessionInsert, Self::Error>> + Send + '_;

  fn get_session(
    &self,
    id: SessionId,
  ) -> impl Future<Output = Result<Option<TestSession>, Self::Error>> + Send + '_;

  fn list_sessions<'a>(
    &'a self,
    query: &'a SessionQuery,
  ) -> impl Future<Output = Result<Vec<TestSession>, Self::Error>> + Send + 'a;

  /// Move an `in_progress` session to `abandoned`. Returns `false` if the
  /// session was not in progress.
  fn abandon_session(
    &self,
    id: SessionId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Move an `in_progress` session to `completed` (ending at
  /// `result.created_at`) and persist its result, atomically.
  ///
  /// Returns `None`, writing nothing, if the session was not in progress.
  fn complete_session(
    &self,
    id: SessionId,
    result: NewTestResult,
  ) -> impl Future<Output = Result<Option<TestResult>, Self::Error>> + Send + '_;

  // ── Results ───────────────────────────────────────────────────────────

  /// The most recent result of `user` on `test`, by `created_at`.
  fn latest_result(
    &self,
    user: UserId,
    test: TestId,
  ) -> impl Future<Output = Result<Option<TestResult>, Self::Error>> + Send + '_;
}
