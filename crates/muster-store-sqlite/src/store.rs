//! [`SqliteStore`], the SQLite implementation of [`RecordStore`],
//! [`NotificationEmitter`] and [`MemberDirectory`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use serde::Serialize;

use muster_core::{
  application::{Application, ApplicationStatus, NewApplication, StatusChange, StatusEntry},
  exam::{NewSession, NewTest, NewTestResult, SessionInsert, SessionStatus, Test, TestResult, TestSession},
  id::{ApplicationId, ResultId, SessionId, TestId, UserId},
  notify::{MemberDirectory, Notification, NotificationEmitter},
  store::{ApplicationQuery, RecordStore, SessionQuery},
};

use crate::{
  Error, Result,
  encode::{
    RawApplication, RawResult, RawSession, RawStatusEntry, RawTest, decode_dt, encode_dt,
    encode_json,
  },
  schema::SCHEMA,
};

// ─── Row mapping ─────────────────────────────────────────────────────────────

const APPLICATION_COLUMNS: &str = "application_id, author_id, character_id, kind, status, \
                                   data_json, reviewer_id, review_comment, created_at, updated_at";

const SESSION_COLUMNS: &str =
  "session_id, user_id, test_id, application_id, start_time, end_time, status";

const RESULT_COLUMNS: &str = "result_id, user_id, test_id, session_id, application_id, score, \
                              max_score, percentage, passed, time_spent, focus_lost_count, \
                              warnings_count, answers_json, results_json, created_at";

fn application_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawApplication> {
  Ok(RawApplication {
    application_id: row.get(0)?,
    author_id:      row.get(1)?,
    character_id:   row.get(2)?,
    kind:           row.get(3)?,
    status:         row.get(4)?,
    data_json:      row.get(5)?,
    reviewer_id:    row.get(6)?,
    review_comment: row.get(7)?,
    created_at:     row.get(8)?,
    updated_at:     row.get(9)?,
    history:        Vec::new(),
  })
}

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
  Ok(RawSession {
    session_id:     row.get(0)?,
    user_id:        row.get(1)?,
    test_id:        row.get(2)?,
    application_id: row.get(3)?,
    start_time:     row.get(4)?,
    end_time:       row.get(5)?,
    status:         row.get(6)?,
  })
}

fn result_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawResult> {
  Ok(RawResult {
    result_id:        row.get(0)?,
    user_id:          row.get(1)?,
    test_id:          row.get(2)?,
    session_id:       row.get(3)?,
    application_id:   row.get(4)?,
    score:            row.get(5)?,
    max_score:        row.get(6)?,
    percentage:       row.get(7)?,
    passed:           row.get(8)?,
    time_spent:       row.get(9)?,
    focus_lost_count: row.get(10)?,
    warnings_count:   row.get(11)?,
    answers_json:     row.get(12)?,
    results_json:     row.get(13)?,
    created_at:       row.get(14)?,
  })
}

fn load_history(conn: &rusqlite::Connection, raw: &mut RawApplication) -> rusqlite::Result<()> {
  let mut stmt = conn.prepare_cached(
    "SELECT status, at, comment, reviewer_id
       FROM application_history
      WHERE application_id = ?1
      ORDER BY entry_id",
  )?;
  raw.history = stmt
    .query_map(rusqlite::params![raw.application_id], |row| {
      Ok(RawStatusEntry {
        status:      row.get(0)?,
        at:          row.get(1)?,
        comment:     row.get(2)?,
        reviewer_id: row.get(3)?,
      })
    })?
    .collect::<rusqlite::Result<_>>()?;
  Ok(())
}

fn select_application(
  conn: &rusqlite::Connection,
  id: i64,
) -> rusqlite::Result<Option<RawApplication>> {
  let raw = conn
    .query_row(
      &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE application_id = ?1"),
      rusqlite::params![id],
      application_row,
    )
    .optional()?;
  match raw {
    Some(mut raw) => {
      load_history(conn, &mut raw)?;
      Ok(Some(raw))
    }
    None => Ok(None),
  }
}

fn select_session(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<RawSession>> {
  conn
    .query_row(
      &format!("SELECT {SESSION_COLUMNS} FROM test_sessions WHERE session_id = ?1"),
      rusqlite::params![id],
      session_row,
    )
    .optional()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
  matches!(
    err,
    rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
  )
}

// ─── Outbox ──────────────────────────────────────────────────────────────────

/// A notification waiting in the outbox.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
  pub id:           i64,
  pub notification: Notification,
  pub created_at:   DateTime<Utc>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Muster record store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. All access
/// goes through one connection thread, and the multi-statement operations
/// run inside a transaction.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "opening sqlite store");
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Members ───────────────────────────────────────────────────────────

  /// Register `user`, or update their reviewer flag if already known.
  pub async fn add_member(&self, user: UserId, reviewer: bool) -> Result<()> {
    let at = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO members (user_id, is_reviewer, added_at) VALUES (?1, ?2, ?3)
           ON CONFLICT(user_id) DO UPDATE SET is_reviewer = excluded.is_reviewer",
          rusqlite::params![user.0, reviewer, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Outbox ────────────────────────────────────────────────────────────

  /// Undelivered notifications, oldest first.
  pub async fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<(i64, i64, String, String, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT notification_id, recipient_id, content, link, created_at
             FROM notifications
            WHERE delivered_at IS NULL
            ORDER BY notification_id
            LIMIT ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(id, recipient, content, link, created_at)| {
        Ok(OutboxEntry {
          id,
          notification: Notification {
            recipient_id: UserId(recipient),
            content,
            link,
          },
          created_at: decode_dt(&created_at)?,
        })
      })
      .collect()
  }

  /// Mark outbox entries as delivered. Returns how many were still open.
  pub async fn mark_delivered(&self, ids: Vec<i64>, at: DateTime<Utc>) -> Result<usize> {
    let at = encode_dt(at);
    let count = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut count = 0;
        {
          let mut stmt = tx.prepare(
            "UPDATE notifications SET delivered_at = ?2
              WHERE notification_id = ?1 AND delivered_at IS NULL",
          )?;
          for id in ids {
            count += stmt.execute(rusqlite::params![id, at])?;
          }
        }
        tx.commit()?;
        Ok(count)
      })
      .await?;
    Ok(count)
  }
}

// ─── RecordStore impl ────────────────────────────────────────────────────────

impl RecordStore for SqliteStore {
  type Error = Error;

  // ── Applications ──────────────────────────────────────────────────────

  async fn create_application(&self, input: NewApplication) -> Result<Application> {
    let author = input.author_id.0;
    let character = input.character_id.map(|c| c.0);
    let kind = input.kind.to_string();
    let status = ApplicationStatus::Pending.to_string();
    let data = encode_json(&input.data)?;
    let at = encode_dt(input.submitted_at);

    let id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO applications
             (author_id, character_id, kind, status, data_json, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
          rusqlite::params![author, character, kind, status, data, at],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
          "INSERT INTO application_history (application_id, status, at) VALUES (?1, ?2, ?3)",
          rusqlite::params![id, status, at],
        )?;
        tx.commit()?;
        Ok(id)
      })
      .await?;

    Ok(Application {
      id:             ApplicationId(id),
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
    })
  }

  async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>> {
    let raw = self
      .conn
      .call(move |conn| Ok(select_application(conn, id.0)?))
      .await?;
    raw.map(RawApplication::into_application).transpose()
  }

  async fn list_applications<'a>(
    &'a self,
    query: &'a ApplicationQuery,
  ) -> Result<Vec<Application>> {
    let author = query.author_id.map(|u| u.0);
    let status = query.status.map(|s| s.to_string());

    let raws: Vec<RawApplication> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {APPLICATION_COLUMNS} FROM applications
            WHERE (?1 IS NULL OR author_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY application_id"
        ))?;
        let mut rows = stmt
          .query_map(rusqlite::params![author, status], application_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        for raw in &mut rows {
          load_history(conn, raw)?;
        }
        Ok(rows)
      })
      .await?;

    let mut applications = raws
      .into_iter()
      .map(RawApplication::into_application)
      .collect::<Result<Vec<_>>>()?;
    // Type filtering is cheap enough to do here.
    applications.retain(|a| query.matches(a));
    Ok(applications)
  }

  async fn transition_application(
    &self,
    id: ApplicationId,
    expected: ApplicationStatus,
    change: StatusChange,
  ) -> Result<Option<Application>> {
    let expected = expected.to_string();
    let status = change.status.to_string();
    let at = encode_dt(change.at);
    let reviewer = change.reviewer_id.map(|u| u.0);
    let comment = change.comment;

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let updated = tx.execute(
          "UPDATE applications
              SET status         = ?3,
                  updated_at     = ?4,
                  reviewer_id    = COALESCE(?5, reviewer_id),
                  review_comment = CASE WHEN ?5 IS NULL THEN review_comment ELSE ?6 END
            WHERE application_id = ?1 AND status = ?2",
          rusqlite::params![id.0, expected, status, at, reviewer, comment],
        )?;
        if updated == 0 {
          return Ok(None);
        }
        tx.execute(
          "INSERT INTO application_history (application_id, status, at, comment, reviewer_id)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id.0, status, at, comment, reviewer],
        )?;
        let raw = select_application(&tx, id.0)?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawApplication::into_application).transpose()
  }

  // ── Tests ─────────────────────────────────────────────────────────────

  async fn create_test(&self, input: NewTest, created_at: DateTime<Utc>) -> Result<Test> {
    let title = input.title.clone();
    let related = encode_json(&input.related_to)?;
    let duration = input.duration_minutes;
    let questions = encode_json(&input.questions)?;
    let at = encode_dt(created_at);

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO tests (title, related_json, duration_minutes, questions_json, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![title, related, duration, questions, at],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Test {
      id: TestId(id),
      title: input.title,
      related_to: input.related_to,
      duration_minutes: input.duration_minutes,
      questions: input.questions,
      created_at,
    })
  }

  async fn get_test(&self, id: TestId) -> Result<Option<Test>> {
    let raw: Option<RawTest> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT test_id, title, related_json, duration_minutes, questions_json, created_at
                 FROM tests WHERE test_id = ?1",
              rusqlite::params![id.0],
              |row| {
                Ok(RawTest {
                  test_id:          row.get(0)?,
                  title:            row.get(1)?,
                  related_json:     row.get(2)?,
                  duration_minutes: row.get(3)?,
                  questions_json:   row.get(4)?,
                  created_at:       row.get(5)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawTest::into_test).transpose()
  }

  // ── Sessions ──────────────────────────────────────────────────────────

  async fn create_session_exclusive(&self, input: NewSession) -> Result<SessionInsert> {
    let user = input.user_id.0;
    let test = input.test_id.0;
    let application = input.application_id.map(|a| a.0);
    let start = encode_dt(input.start_time);

    let (created, raw) = self
      .conn
      .call(move |conn| {
        let inserted = conn.execute(
          "INSERT INTO test_sessions (user_id, test_id, application_id, start_time, status)
           VALUES (?1, ?2, ?3, ?4, 'in_progress')",
          rusqlite::params![user, test, application, start],
        );
        match inserted {
          Ok(_) => {
            let id = conn.last_insert_rowid();
            let raw = select_session(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            Ok((true, raw))
          }
          // The partial unique index refused a second live session.
          Err(err) if is_constraint_violation(&err) => {
            let live = conn
              .query_row(
                &format!(
                  "SELECT {SESSION_COLUMNS} FROM test_sessions
                    WHERE user_id = ?1 AND test_id = ?2 AND status = 'in_progress'"
                ),
                rusqlite::params![user, test],
                session_row,
              )
              .optional()?;
            match live {
              Some(raw) => Ok((false, raw)),
              None => Err(err.into()),
            }
          }
          Err(err) => Err(err.into()),
        }
      })
      .await?;

    let session = raw.into_session()?;
    Ok(if created {
      SessionInsert::Created(session)
    } else {
      tracing::debug!(id = %session.id, user = %session.user_id, "live session already exists");
      SessionInsert::Existing(session)
    })
  }

  async fn get_session(&self, id: SessionId) -> Result<Option<TestSession>> {
    let raw = self
      .conn
      .call(move |conn| Ok(select_session(conn, id.0)?))
      .await?;
    raw.map(RawSession::into_session).transpose()
  }

  async fn list_sessions<'a>(&'a self, query: &'a SessionQuery) -> Result<Vec<TestSession>> {
    let user = query.user_id.map(|u| u.0);
    let test = query.test_id.map(|t| t.0);
    let status = query.status.map(|s| s.to_string());

    let raws: Vec<RawSession> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SESSION_COLUMNS} FROM test_sessions
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR test_id = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY session_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![user, test, status], session_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSession::into_session).collect()
  }

  async fn abandon_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
    let at = encode_dt(at);
    let abandoned = SessionStatus::Abandoned.to_string();
    let live = SessionStatus::InProgress.to_string();

    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE test_sessions SET status = ?2, end_time = ?3
            WHERE session_id = ?1 AND status = ?4",
          rusqlite::params![id.0, abandoned, at, live],
        )?)
      })
      .await?;
    Ok(updated == 1)
  }

  async fn complete_session(
    &self,
    id: SessionId,
    result: NewTestResult,
  ) -> Result<Option<TestResult>> {
    let completed = SessionStatus::Completed.to_string();
    let live = SessionStatus::InProgress.to_string();
    let at = encode_dt(result.created_at);
    let answers = encode_json(&result.answers)?;
    let outcomes = encode_json(&result.results)?;
    let user = result.user_id.0;
    let test = result.test_id.0;
    let application = result.application_id.map(|a| a.0);
    let (score, max_score, percentage, passed) =
      (result.score, result.max_score, result.percentage, result.passed);
    let (time_spent, focus_lost, warnings) =
      (result.time_spent, result.focus_lost_count, result.warnings_count);

    let result_id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let updated = tx.execute(
          "UPDATE test_sessions SET status = ?2, end_time = ?3
            WHERE session_id = ?1 AND status = ?4",
          rusqlite::params![id.0, completed, at, live],
        )?;
        if updated == 0 {
          return Ok(None);
        }
        tx.execute(
          "INSERT INTO test_results (
             user_id, test_id, session_id, application_id, score, max_score,
             percentage, passed, time_spent, focus_lost_count, warnings_count,
             answers_json, results_json, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
          rusqlite::params![
            user,
            test,
            id.0,
            application,
            score,
            max_score,
            percentage,
            passed,
            time_spent,
            focus_lost,
            warnings,
            answers,
            outcomes,
            at,
          ],
        )?;
        let result_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(result_id))
      })
      .await?;

    Ok(result_id.map(|rid| result.into_result(ResultId(rid))))
  }

  // ── Results ───────────────────────────────────────────────────────────

  async fn latest_result(&self, user: UserId, test: TestId) -> Result<Option<TestResult>> {
    let raw: Option<RawResult> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {RESULT_COLUMNS} FROM test_results
                  WHERE user_id = ?1 AND test_id = ?2
                  ORDER BY created_at DESC, result_id DESC
                  LIMIT 1"
              ),
              rusqlite::params![user.0, test.0],
              result_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawResult::into_result).transpose()
  }
}

// ─── NotificationEmitter impl ────────────────────────────────────────────────

impl NotificationEmitter for SqliteStore {
  type Error = Error;

  /// Queue `notification` in the outbox.
  async fn emit(&self, notification: Notification) -> Result<()> {
    let at = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO notifications (recipient_id, content, link, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![
            notification.recipient_id.0,
            notification.content,
            notification.link,
            at
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── MemberDirectory impl ────────────────────────────────────────────────────

impl MemberDirectory for SqliteStore {
  type Error = Error;

  async fn is_reviewer(&self, user: UserId) -> Result<bool> {
    let reviewer = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT is_reviewer FROM members WHERE user_id = ?1",
              rusqlite::params![user.0],
              |row| row.get::<_, bool>(0),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(reviewer)
  }

  async fn members(&self) -> Result<Vec<UserId>> {
    let ids: Vec<i64> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT user_id FROM members ORDER BY user_id")?;
        let ids = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(ids.into_iter().map(UserId).collect())
  }
}
