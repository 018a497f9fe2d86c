//! Test session manager.
//!
//! A member has at most one live session per test. Time limits and the
//! 24-hour retake lock are checked lazily against the clock when the member
//! next acts; nothing runs in the background. Sessions a member walks away
//! from stay `in_progress` until [`TestSessionManager::reap_stale`] is run
//! by an outside scheduler, or until the member starts the same test again
//! after its time limit.

use std::{collections::HashMap, sync::Arc};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  application::{Actor, Application, ApplicationStatus},
  exam::{
    AnswerSheet, NewSession, NewTest, NewTestResult, PublicTest, SessionInsert, SessionStatus, Test,
    TestResult, TestSession,
  },
  id::{ApplicationId, SessionId, TestId, UserId},
  lifecycle::LifecycleController,
  notify::{MemberDirectory, NotificationEmitter},
  scoring,
  store::{RecordStore, SessionQuery},
};

/// Minimum wait between a scored attempt and the next start of the same test.
pub fn retake_cooldown() -> Duration { Duration::hours(24) }

/// What a member receives when a test starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedTest {
  pub session: TestSession,
  pub test:    PublicTest,
  /// `true` if an already running session was handed back.
  pub resumed: bool,
}

/// What a submit produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
  pub result:      TestResult,
  /// The linked application after its automatic advance, if there is one
  /// and the advance went through.
  pub application: Option<Application>,
}

pub struct TestSessionManager<S, N, D> {
  store:     Arc<S>,
  lifecycle: Arc<LifecycleController<S, N, D>>,
}

impl<S, N, D> TestSessionManager<S, N, D>
where
  S: RecordStore,
  N: NotificationEmitter,
  D: MemberDirectory,
{
  pub fn new(lifecycle: Arc<LifecycleController<S, N, D>>) -> Self {
    Self {
      store: Arc::clone(lifecycle.store()),
      lifecycle,
    }
  }

  fn now(&self) -> chrono::DateTime<chrono::Utc> { self.lifecycle.clock().now() }

  // ── Tests ─────────────────────────────────────────────────────────────

  pub async fn create_test(&self, input: NewTest) -> Result<Test> {
    input.validate()?;
    let test = self
      .store
      .create_test(input, self.now())
      .await
      .map_err(Error::store)?;
    tracing::info!(id = %test.id, questions = test.questions.len(), "test created");
    Ok(test)
  }

  // ── Start ─────────────────────────────────────────────────────────────

  /// Start (or resume) `user`'s attempt at `test_id`.
  pub async fn start(
    &self,
    user: UserId,
    test_id: TestId,
    application_id: Option<ApplicationId>,
  ) -> Result<StartedTest> {
    let test = self.load_test(test_id).await?;

    if let Some(app_id) = application_id {
      let application = self.lifecycle.get(app_id).await?;
      if application.author_id != user {
        return Err(Error::Validation(format!(
          "application {app_id} does not belong to user {user}"
        )));
      }
    }

    // The lock hangs off the last result, not the last session, so walking
    // away from a session never locks anyone out.
    let now = self.now();
    if let Some(last) = self
      .store
      .latest_result(user, test_id)
      .await
      .map_err(Error::store)?
    {
      let until = last.created_at + retake_cooldown();
      if now < until {
        return Err(Error::CooldownActive { until });
      }
    }

    let input = NewSession {
      user_id: user,
      test_id,
      application_id,
      start_time: now,
    };

    // A second round only happens after an overdue session was cleared out.
    for _ in 0..2 {
      match self
        .store
        .create_session_exclusive(input.clone())
        .await
        .map_err(Error::store)?
      {
        SessionInsert::Created(session) => {
          tracing::info!(id = %session.id, %user, test = %test_id, "test session started");
          return Ok(StartedTest {
            session,
            test: test.redacted(),
            resumed: false,
          });
        }
        SessionInsert::Existing(session) if session.is_overdue(test.duration(), now) => {
          tracing::info!(id = %session.id, %user, "abandoning overdue session before restart");
          self
            .store
            .abandon_session(session.id, now)
            .await
            .map_err(Error::store)?;
        }
        SessionInsert::Existing(session)
          if application_id.is_some_and(|id| session.application_id != Some(id)) =>
        {
          return Err(Error::Validation(format!(
            "session {} is already open for a different application",
            session.id
          )));
        }
        SessionInsert::Existing(session) => {
          tracing::debug!(id = %session.id, %user, "resuming live test session");
          return Ok(StartedTest {
            session,
            test: test.redacted(),
            resumed: true,
          });
        }
      }
    }

    Err(Error::Validation(format!(
      "test {test_id} could not be started for user {user}, retry"
    )))
  }

  // ── Submit ────────────────────────────────────────────────────────────

  /// Score and close `user`'s session.
  ///
  /// Elapsed time is measured by the server from the session's start; the
  /// client-reported `time_spent` is stored but never trusted.
  pub async fn submit(
    &self,
    session_id: SessionId,
    user: UserId,
    sheet: AnswerSheet,
  ) -> Result<SubmissionOutcome> {
    let session = self.active_session(session_id, user).await?;
    let test = self.load_test(session.test_id).await?;

    let now = self.now();
    let elapsed = now - session.start_time;
    if elapsed > test.duration() {
      self
        .store
        .abandon_session(session_id, now)
        .await
        .map_err(Error::store)?;
      tracing::info!(id = %session_id, %user, "test submitted after time limit");
      return Err(Error::TimeExceeded {
        elapsed_secs: elapsed.num_seconds(),
        limit_secs:   test.duration().num_seconds(),
      });
    }

    if let Some(unknown) = sheet
      .answers
      .keys()
      .find(|id| !test.questions.iter().any(|q| &q.id == *id))
    {
      return Err(Error::Validation(format!(
        "answer given for unknown question {unknown:?}"
      )));
    }

    let score = scoring::score(&test, &sheet.answers);
    let input = NewTestResult {
      user_id:          user,
      test_id:          test.id,
      session_id,
      application_id:   session.application_id,
      score:            score.total_score,
      max_score:        score.max_score,
      percentage:       score.percentage,
      passed:           score.passed,
      time_spent:       sheet.time_spent,
      focus_lost_count: sheet.focus_lost_count,
      warnings_count:   sheet.warnings_count,
      answers:          sheet.answers,
      results:          score.per_question,
      created_at:       now,
    };

    let result = self
      .store
      .complete_session(session_id, input)
      .await
      .map_err(Error::store)?
      .ok_or(Error::NoActiveSession(session_id))?;

    tracing::info!(
      id = %session_id,
      %user,
      score = result.score,
      max = result.max_score,
      passed = result.passed,
      focus_lost = result.focus_lost_count,
      warnings = result.warnings_count,
      "test session completed"
    );

    let application = match result.application_id {
      Some(app_id) => self.advance_linked(app_id, &result).await,
      None => None,
    };

    Ok(SubmissionOutcome {
      result,
      application,
    })
  }

  // ── Abandon ───────────────────────────────────────────────────────────

  /// `user` gives up on their session.
  pub async fn abandon(&self, session_id: SessionId, user: UserId) -> Result<TestSession> {
    self.active_session(session_id, user).await?;
    if !self
      .store
      .abandon_session(session_id, self.now())
      .await
      .map_err(Error::store)?
    {
      return Err(Error::NoActiveSession(session_id));
    }
    self
      .store
      .get_session(session_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::NoActiveSession(session_id))
  }

  /// Mark every `in_progress` session that has been running longer than its
  /// test's time limit plus `grace` as abandoned. Intended for a periodic
  /// external job. Returns the abandoned session ids.
  pub async fn reap_stale(&self, grace: Duration) -> Result<Vec<SessionId>> {
    let now = self.now();
    let live = self
      .store
      .list_sessions(&SessionQuery {
        status: Some(SessionStatus::InProgress),
        ..Default::default()
      })
      .await
      .map_err(Error::store)?;

    let mut limits: HashMap<TestId, Duration> = HashMap::new();
    let mut reaped = Vec::new();
    for session in live {
      let limit = match limits.get(&session.test_id) {
        Some(limit) => *limit,
        None => {
          // A session pointing at a vanished test can never be submitted.
          let limit = match self.store.get_test(session.test_id).await.map_err(Error::store)? {
            Some(test) => test.duration(),
            None => Duration::zero(),
          };
          limits.insert(session.test_id, limit);
          limit
        }
      };

      if session.is_overdue(limit + grace, now)
        && self
          .store
          .abandon_session(session.id, now)
          .await
          .map_err(Error::store)?
      {
        reaped.push(session.id);
      }
    }

    tracing::info!(count = reaped.len(), "stale test sessions abandoned");
    Ok(reaped)
  }

  // ── Helpers ───────────────────────────────────────────────────────────

  async fn load_test(&self, id: TestId) -> Result<Test> {
    self
      .store
      .get_test(id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::TestNotFound(id))
  }

  async fn active_session(&self, id: SessionId, user: UserId) -> Result<TestSession> {
    self
      .store
      .get_session(id)
      .await
      .map_err(Error::store)?
      .filter(|s| s.is_active() && s.user_id == user)
      .ok_or(Error::NoActiveSession(id))
  }

  /// Push the linked application to `test_completed` or `test_failed`.
  ///
  /// The result is already stored at this point, so a refused transition
  /// (say, a reviewer never asked for the test) is logged and reported as
  /// `None` rather than failing the submit.
  async fn advance_linked(&self, app_id: ApplicationId, result: &TestResult) -> Option<Application> {
    let (status, verdict) = if result.passed {
      (ApplicationStatus::TestCompleted, "passed")
    } else {
      (ApplicationStatus::TestFailed, "failed")
    };
    let comment = format!("Test {verdict} with {:.1}%", result.percentage);

    match self
      .lifecycle
      .advance_status(app_id, status, Actor::System, Some(comment))
      .await
    {
      Ok(application) => Some(application),
      Err(e) => {
        tracing::warn!(application = %app_id, error = %e, "could not advance application after test");
        None
      }
    }
  }
}
