//! In-memory collaborators for exercising the workflow components.

use std::{
  convert::Infallible,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeZone as _, Utc};

use crate::{
  LifecycleController, TestSessionManager,
  application::{
    Application, ApplicationStatus, NewApplication, StatusChange, StatusEntry,
  },
  clock::{Clock, ManualClock},
  exam::{
    NewSession, NewTest, NewTestResult, SessionInsert, SessionStatus, Test, TestResult,
    TestSession,
  },
  id::{ApplicationId, ResultId, SessionId, TestId, UserId},
  notify::{MemberDirectory, Notification, NotificationEmitter},
  store::{ApplicationQuery, RecordStore, SessionQuery},
};

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
  applications: Vec<Application>,
  tests:        Vec<Test>,
  sessions:     Vec<TestSession>,
  results:      Vec<TestResult>,
}

/// A record store holding everything in one mutex, which makes every method
/// trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
    let mut state = self.state.lock().unwrap();
    f(&mut state)
  }

  /// Rewrite an application's status behind the controller's back, the way a
  /// concurrent writer would.
  pub fn force_status(&self, id: ApplicationId, status: ApplicationStatus) {
    self.with(|s| {
      let app = s.applications.iter_mut().find(|a| a.id == id).unwrap();
      app.status = status;
    });
  }

  pub fn session_count(&self, status: SessionStatus) -> usize {
    self.with(|s| s.sessions.iter().filter(|x| x.status == status).count())
  }

  pub fn result_count(&self) -> usize { self.with(|s| s.results.len()) }
}

impl RecordStore for MemoryStore {
  type Error = Infallible;

  async fn create_application(&self, input: NewApplication) -> Result<Application, Infallible> {
    Ok(self.with(|s| {
      let app = Application {
        id:             ApplicationId(s.applications.len() as i64 + 1),
        author_id:      input.author_id,
        character_id:   input.character_id,
        kind:           input.kind,
        status:         ApplicationStatus::Pending,
        status_history: vec![StatusEntry {
          status:      ApplicationStatus::Pending,
          at:          input.submitted_at,
          comment:     None,
          reviewer_id: None,
        }],
        data:           input.data,
        reviewer_id:    None,
        review_comment: None,
        created_at:     input.submitted_at,
        updated_at:     input.submitted_at,
      };
      s.applications.push(app.clone());
      app
    }))
  }

  async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, Infallible> {
    Ok(self.with(|s| s.applications.iter().find(|a| a.id == id).cloned()))
  }

  async fn list_applications<'a>(
    &'a self,
    query: &'a ApplicationQuery,
  ) -> Result<Vec<Application>, Infallible> {
    Ok(self.with(|s| {
      s.applications
        .iter()
        .filter(|a| query.matches(a))
        .cloned()
        .collect()
    }))
  }

  async fn transition_application(
    &self,
    id: ApplicationId,
    expected: ApplicationStatus,
    change: StatusChange,
  ) -> Result<Option<Application>, Infallible> {
    Ok(self.with(|s| {
      let app = s
        .applications
        .iter_mut()
        .find(|a| a.id == id && a.status == expected)?;
      app.status = change.status;
      app.updated_at = change.at;
      if let Some(reviewer) = change.reviewer_id {
        app.reviewer_id = Some(reviewer);
        app.review_comment = change.comment.clone();
      }
      app.status_history.push(change.entry());
      Some(app.clone())
    }))
  }

  async fn create_test(
    &self,
    input: NewTest,
    created_at: DateTime<Utc>,
  ) -> Result<Test, Infallible> {
    Ok(self.with(|s| {
      let test = Test {
        id: TestId(s.tests.len() as i64 + 1),
        title: input.title,
        related_to: input.related_to,
        duration_minutes: input.duration_minutes,
        questions: input.questions,
        created_at,
      };
      s.tests.push(test.clone());
      test
    }))
  }

  async fn get_test(&self, id: TestId) -> Result<Option<Test>, Infallible> {
    Ok(self.with(|s| s.tests.iter().find(|t| t.id == id).cloned()))
  }

  async fn create_session_exclusive(
    &self,
    input: NewSession,
  ) -> Result<SessionInsert, Infallible> {
    Ok(self.with(|s| {
      if let Some(live) = s.sessions.iter().find(|x| {
        x.user_id == input.user_id && x.test_id == input.test_id && x.is_active()
      }) {
        return SessionInsert::Existing(live.clone());
      }
      let session = TestSession {
        id:             SessionId(s.sessions.len() as i64 + 1),
        user_id:        input.user_id,
        test_id:        input.test_id,
        application_id: input.application_id,
        start_time:     input.start_time,
        end_time:       None,
        status:         SessionStatus::InProgress,
      };
      s.sessions.push(session.clone());
      SessionInsert::Created(session)
    }))
  }

  async fn get_session(&self, id: SessionId) -> Result<Option<TestSession>, Infallible> {
    Ok(self.with(|s| s.sessions.iter().find(|x| x.id == id).cloned()))
  }

  async fn list_sessions<'a>(
    &'a self,
    query: &'a SessionQuery,
  ) -> Result<Vec<TestSession>, Infallible> {
    Ok(self.with(|s| {
      s.sessions
        .iter()
        .filter(|x| query.matches(x))
        .cloned()
        .collect()
    }))
  }

  async fn abandon_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool, Infallible> {
    Ok(self.with(|s| {
      match s.sessions.iter_mut().find(|x| x.id == id && x.is_active()) {
        Some(session) => {
          session.status = SessionStatus::Abandoned;
          session.end_time = Some(at);
          true
        }
        None => false,
      }
    }))
  }

  async fn complete_session(
    &self,
    id: SessionId,
    result: NewTestResult,
  ) -> Result<Option<TestResult>, Infallible> {
    Ok(self.with(|s| {
      let session = s.sessions.iter_mut().find(|x| x.id == id && x.is_active())?;
      session.status = SessionStatus::Completed;
      session.end_time = Some(result.created_at);
      let stored = result.into_result(ResultId(s.results.len() as i64 + 1));
      s.results.push(stored.clone());
      Some(stored)
    }))
  }

  async fn latest_result(
    &self,
    user: UserId,
    test: TestId,
  ) -> Result<Option<TestResult>, Infallible> {
    Ok(self.with(|s| {
      s.results
        .iter()
        .filter(|r| r.user_id == user && r.test_id == test)
        .max_by_key(|r| r.created_at)
        .cloned()
    }))
  }
}

// ─── Emitter / directory ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("notification transport offline")]
pub struct Offline;

/// Records every notification; can be switched to fail every emit.
#[derive(Default)]
pub struct RecordingEmitter {
  pub sent:    Mutex<Vec<Notification>>,
  pub offline: bool,
}

impl RecordingEmitter {
  pub fn offline() -> Self {
    Self {
      offline: true,
      ..Default::default()
    }
  }

  pub fn sent_to(&self, user: UserId) -> Vec<Notification> {
    self
      .sent
      .lock()
      .unwrap()
      .iter()
      .filter(|n| n.recipient_id == user)
      .cloned()
      .collect()
  }

  pub fn count(&self) -> usize { self.sent.lock().unwrap().len() }
}

impl NotificationEmitter for RecordingEmitter {
  type Error = Offline;

  async fn emit(&self, notification: Notification) -> Result<(), Offline> {
    if self.offline {
      return Err(Offline);
    }
    self.sent.lock().unwrap().push(notification);
    Ok(())
  }
}

/// Fixed member list: `(user, is_reviewer)`.
pub struct StaticDirectory(pub Vec<(UserId, bool)>);

impl MemberDirectory for StaticDirectory {
  type Error = Infallible;

  async fn is_reviewer(&self, user: UserId) -> Result<bool, Infallible> {
    Ok(self.0.iter().any(|(id, reviewer)| *id == user && *reviewer))
  }

  async fn members(&self) -> Result<Vec<UserId>, Infallible> {
    Ok(self.0.iter().map(|(id, _)| *id).collect())
  }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub const MEMBER: UserId = UserId(1);
pub const OTHER_MEMBER: UserId = UserId(2);
pub const REVIEWER: UserId = UserId(10);
pub const SECOND_REVIEWER: UserId = UserId(11);

pub fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap() }

pub struct Harness {
  pub store:    Arc<MemoryStore>,
  pub emitter:  Arc<RecordingEmitter>,
  pub clock:    Arc<ManualClock>,
  pub lifecycle: Arc<LifecycleController<MemoryStore, RecordingEmitter, StaticDirectory>>,
  pub sessions: TestSessionManager<MemoryStore, RecordingEmitter, StaticDirectory>,
}

pub fn harness() -> Harness { harness_with(RecordingEmitter::default(), t0()) }

pub fn harness_at(start: DateTime<Utc>) -> Harness {
  harness_with(RecordingEmitter::default(), start)
}

pub fn harness_with(emitter: RecordingEmitter, start: DateTime<Utc>) -> Harness {
  let store = Arc::new(MemoryStore::default());
  let emitter = Arc::new(emitter);
  let clock = Arc::new(ManualClock::new(start));
  let directory = Arc::new(StaticDirectory(vec![
    (MEMBER, false),
    (OTHER_MEMBER, false),
    (REVIEWER, true),
    (SECOND_REVIEWER, true),
  ]));
  let lifecycle = Arc::new(LifecycleController::new(
    Arc::clone(&store),
    Arc::clone(&emitter),
    directory,
    Arc::clone(&clock) as Arc<dyn Clock>,
  ));
  let sessions = TestSessionManager::new(Arc::clone(&lifecycle));
  Harness {
    store,
    emitter,
    clock,
    lifecycle,
    sessions,
  }
}
