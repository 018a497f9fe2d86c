//! Integration tests for `SqliteStore` against an in-memory database.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone as _, Utc};
use serde_json::json;

use muster_core::{
  Error as CoreError, LifecycleController, TestSessionManager,
  application::{
    Actor, ApplicationStatus, ApplicationType, NewApplication, StatusChange, Submission,
  },
  clock::{Clock, ManualClock},
  exam::{
    AnswerSheet, AnswerValue, NewSession, NewTest, NewTestResult, Question, QuestionKind,
    RelatedTo, SessionInsert, SessionStatus,
  },
  id::{ApplicationId, SessionId, TestId, UserId},
  notify::{MemberDirectory, Notification, NotificationEmitter},
  store::{ApplicationQuery, RecordStore, SessionQuery},
};

use crate::SqliteStore;

const MEMBER: UserId = UserId(1);
const REVIEWER: UserId = UserId(10);

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap() }

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn new_application(kind: ApplicationType) -> NewApplication {
  NewApplication {
    author_id:    MEMBER,
    character_id: None,
    kind,
    data:         json!({ "reason": "ready" }),
    submitted_at: t0(),
  }
}

fn new_test() -> NewTest {
  NewTest {
    title:            "Academy entrance exam".into(),
    related_to:       RelatedTo {
      application_id: None,
      department_id:  None,
      kind:           ApplicationType::Entry,
    },
    duration_minutes: 30,
    questions:        vec![
      Question {
        id:             "q1".into(),
        prompt:         "Pick b".into(),
        kind:           QuestionKind::Single,
        options:        Some(vec!["a".into(), "b".into()]),
        correct_answer: Some(AnswerValue::One("b".into())),
        points:         7,
      },
      Question {
        id:             "q2".into(),
        prompt:         "Pick a and c".into(),
        kind:           QuestionKind::Multiple,
        options:        Some(vec!["a".into(), "b".into(), "c".into()]),
        correct_answer: Some(AnswerValue::Many(vec!["a".into(), "c".into()])),
        points:         3,
      },
    ],
  }
}

fn session_input(test_id: TestId, start: DateTime<Utc>) -> NewSession {
  NewSession {
    user_id: MEMBER,
    test_id,
    application_id: None,
    start_time: start,
  }
}

fn result_for(session: SessionId, test_id: TestId, at: DateTime<Utc>) -> NewTestResult {
  NewTestResult {
    user_id:          MEMBER,
    test_id,
    session_id:       session,
    application_id:   None,
    score:            7,
    max_score:        10,
    percentage:       70.0,
    passed:           true,
    time_spent:       300,
    focus_lost_count: 1,
    warnings_count:   0,
    answers:          [("q1".to_owned(), AnswerValue::One("b".into()))]
      .into_iter()
      .collect(),
    results:          Vec::new(),
    created_at:       at,
  }
}

fn change(status: ApplicationStatus, reviewer: Option<UserId>) -> StatusChange {
  StatusChange {
    status,
    at: t0() + Duration::hours(1),
    comment: Some("looks good".into()),
    reviewer_id: reviewer,
  }
}

// ─── Applications ────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_application() {
  let s = store().await;
  let created = s.create_application(new_application(ApplicationType::Entry)).await.unwrap();
  assert_eq!(created.status, ApplicationStatus::Pending);

  let fetched = s.get_application(created.id).await.unwrap().unwrap();
  assert_eq!(fetched.kind, ApplicationType::Entry);
  assert_eq!(fetched.data, json!({ "reason": "ready" }));
  assert_eq!(fetched.status_history.len(), 1);
  assert_eq!(fetched.status_history[0].status, ApplicationStatus::Pending);
  assert_eq!(fetched.submitted_at(), t0());
}

#[tokio::test]
async fn get_application_missing_returns_none() {
  let s = store().await;
  assert!(s.get_application(ApplicationId(42)).await.unwrap().is_none());
}

#[tokio::test]
async fn list_applications_filters() {
  let s = store().await;
  s.create_application(new_application(ApplicationType::Entry)).await.unwrap();
  s.create_application(new_application(ApplicationType::Promotion)).await.unwrap();
  s.create_application(NewApplication {
    author_id: UserId(2),
    ..new_application(ApplicationType::Entry)
  })
  .await
  .unwrap();

  let mine = s.list_applications(&ApplicationQuery::by_author(MEMBER)).await.unwrap();
  assert_eq!(mine.len(), 2);

  let promotions = s
    .list_applications(
      &ApplicationQuery::by_author(MEMBER).of_kinds(&[ApplicationType::Promotion]),
    )
    .await
    .unwrap();
  assert_eq!(promotions.len(), 1);
  assert_eq!(promotions[0].kind, ApplicationType::Promotion);

  let everyone = s.list_applications(&ApplicationQuery::default()).await.unwrap();
  assert_eq!(everyone.len(), 3);
}

#[tokio::test]
async fn transition_appends_history_and_records_reviewer() {
  let s = store().await;
  let app = s.create_application(new_application(ApplicationType::Entry)).await.unwrap();

  let updated = s
    .transition_application(
      app.id,
      ApplicationStatus::Pending,
      change(ApplicationStatus::Approved, Some(REVIEWER)),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(updated.status, ApplicationStatus::Approved);
  assert_eq!(updated.reviewer_id, Some(REVIEWER));
  assert_eq!(updated.review_comment.as_deref(), Some("looks good"));
  assert_eq!(updated.updated_at, t0() + Duration::hours(1));
  assert_eq!(updated.status_history.len(), 2);
  assert_eq!(updated.status_history[1].reviewer_id, Some(REVIEWER));

  // A system change keeps the reviewer fields.
  let system = s
    .transition_application(
      app.id,
      ApplicationStatus::Approved,
      change(ApplicationStatus::TestRequired, None),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(system.reviewer_id, Some(REVIEWER));
  assert_eq!(system.status_history.len(), 3);
}

#[tokio::test]
async fn transition_with_stale_status_writes_nothing() {
  let s = store().await;
  let app = s.create_application(new_application(ApplicationType::Entry)).await.unwrap();
  s.transition_application(
    app.id,
    ApplicationStatus::Pending,
    change(ApplicationStatus::Rejected, Some(REVIEWER)),
  )
  .await
  .unwrap()
  .unwrap();

  let miss = s
    .transition_application(
      app.id,
      ApplicationStatus::Pending,
      change(ApplicationStatus::Approved, Some(UserId(11))),
    )
    .await
    .unwrap();
  assert!(miss.is_none());

  let fetched = s.get_application(app.id).await.unwrap().unwrap();
  assert_eq!(fetched.status, ApplicationStatus::Rejected);
  assert_eq!(fetched.reviewer_id, Some(REVIEWER));
  assert_eq!(fetched.status_history.len(), 2);
}

// ─── Tests and sessions ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_definition_round_trips() {
  let s = store().await;
  let created = s.create_test(new_test(), t0()).await.unwrap();
  let fetched = s.get_test(created.id).await.unwrap().unwrap();
  assert_eq!(fetched.title, "Academy entrance exam");
  assert_eq!(fetched.duration_minutes, 30);
  assert_eq!(fetched.questions.len(), 2);
  assert_eq!(
    fetched.questions[1].correct_answer,
    Some(AnswerValue::Many(vec!["a".into(), "c".into()]))
  );
  assert!(s.get_test(TestId(99)).await.unwrap().is_none());
}

#[tokio::test]
async fn only_one_live_session_per_user_and_test() {
  let s = store().await;
  let test = s.create_test(new_test(), t0()).await.unwrap();

  let first = match s.create_session_exclusive(session_input(test.id, t0())).await.unwrap() {
    SessionInsert::Created(session) => session,
    SessionInsert::Existing(_) => panic!("expected a new session"),
  };

  let later = t0() + Duration::minutes(3);
  match s.create_session_exclusive(session_input(test.id, later)).await.unwrap() {
    SessionInsert::Existing(session) => {
      assert_eq!(session.id, first.id);
      assert_eq!(session.start_time, t0());
    }
    SessionInsert::Created(_) => panic!("second live session was created"),
  }

  // Once the first is over the slot is free again.
  assert!(s.abandon_session(first.id, later).await.unwrap());
  assert!(!s.abandon_session(first.id, later).await.unwrap());
  assert!(matches!(
    s.create_session_exclusive(session_input(test.id, later)).await.unwrap(),
    SessionInsert::Created(_)
  ));

  let abandoned = s
    .list_sessions(&SessionQuery {
      status: Some(SessionStatus::Abandoned),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(abandoned.len(), 1);
  assert_eq!(abandoned[0].end_time, Some(later));
}

#[tokio::test]
async fn session_for_unknown_test_is_an_error() {
  let s = store().await;
  assert!(s.create_session_exclusive(session_input(TestId(5), t0())).await.is_err());
}

#[tokio::test]
async fn complete_session_is_single_shot() {
  let s = store().await;
  let test = s.create_test(new_test(), t0()).await.unwrap();
  let SessionInsert::Created(session) =
    s.create_session_exclusive(session_input(test.id, t0())).await.unwrap()
  else {
    panic!("expected a new session");
  };

  let at = t0() + Duration::minutes(10);
  let stored = s
    .complete_session(session.id, result_for(session.id, test.id, at))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(stored.score, 7);
  assert!(stored.passed);

  let again = s
    .complete_session(session.id, result_for(session.id, test.id, at))
    .await
    .unwrap();
  assert!(again.is_none());

  let closed = s.get_session(session.id).await.unwrap().unwrap();
  assert_eq!(closed.status, SessionStatus::Completed);
  assert_eq!(closed.end_time, Some(at));

  let latest = s.latest_result(MEMBER, test.id).await.unwrap().unwrap();
  assert_eq!(latest.id, stored.id);
  assert_eq!(latest.focus_lost_count, 1);
  assert_eq!(latest.created_at, at);
  assert_eq!(latest.answers, stored.answers);
}

#[tokio::test]
async fn latest_result_picks_most_recent() {
  let s = store().await;
  let test = s.create_test(new_test(), t0()).await.unwrap();

  let mut last = None;
  for day in 0..3 {
    let start = t0() + Duration::days(day * 2);
    let SessionInsert::Created(session) =
      s.create_session_exclusive(session_input(test.id, start)).await.unwrap()
    else {
      panic!("expected a new session");
    };
    last = s
      .complete_session(session.id, result_for(session.id, test.id, start + Duration::minutes(5)))
      .await
      .unwrap();
  }

  let latest = s.latest_result(MEMBER, test.id).await.unwrap().unwrap();
  assert_eq!(latest.id, last.unwrap().id);
  assert!(s.latest_result(UserId(2), test.id).await.unwrap().is_none());
}

// ─── Outbox and members ──────────────────────────────────────────────────────

#[tokio::test]
async fn outbox_queues_and_drains() {
  let s = store().await;
  for n in 0..3 {
    s.emit(Notification {
      recipient_id: MEMBER,
      content:      format!("notice {n}"),
      link:         "/applications".into(),
    })
    .await
    .unwrap();
  }

  let pending = s.pending_notifications(2).await.unwrap();
  assert_eq!(pending.len(), 2);
  assert_eq!(pending[0].notification.content, "notice 0");

  let ids = pending.iter().map(|e| e.id).collect();
  assert_eq!(s.mark_delivered(ids, t0()).await.unwrap(), 2);

  let rest = s.pending_notifications(10).await.unwrap();
  assert_eq!(rest.len(), 1);
  assert_eq!(rest[0].notification.content, "notice 2");
}

#[tokio::test]
async fn member_directory() {
  let s = store().await;
  s.add_member(MEMBER, false).await.unwrap();
  s.add_member(REVIEWER, true).await.unwrap();

  assert!(s.is_reviewer(REVIEWER).await.unwrap());
  assert!(!s.is_reviewer(MEMBER).await.unwrap());
  assert!(!s.is_reviewer(UserId(99)).await.unwrap());
  assert_eq!(s.members().await.unwrap(), vec![MEMBER, REVIEWER]);

  // Re-adding updates the flag.
  s.add_member(MEMBER, true).await.unwrap();
  assert!(s.is_reviewer(MEMBER).await.unwrap());
  assert_eq!(s.members().await.unwrap().len(), 2);
}

// ─── Engine on top of SQLite ─────────────────────────────────────────────────

#[tokio::test]
async fn engine_runs_end_to_end_on_sqlite() {
  let s = Arc::new(store().await);
  s.add_member(MEMBER, false).await.unwrap();
  s.add_member(REVIEWER, true).await.unwrap();

  let clock = Arc::new(ManualClock::new(t0()));
  let lifecycle = Arc::new(LifecycleController::new(
    Arc::clone(&s),
    Arc::clone(&s),
    Arc::clone(&s),
    Arc::clone(&clock) as Arc<dyn Clock>,
  ));
  let sessions = TestSessionManager::new(Arc::clone(&lifecycle));

  let app = lifecycle
    .submit(MEMBER, ApplicationType::Entry, Submission::default())
    .await
    .unwrap();
  for to in [ApplicationStatus::Approved, ApplicationStatus::TestRequired] {
    lifecycle
      .advance_status(app.id, to, Actor::Reviewer(REVIEWER), None)
      .await
      .unwrap();
  }

  let test = sessions.create_test(new_test()).await.unwrap();
  let started = sessions.start(MEMBER, test.id, Some(app.id)).await.unwrap();
  let resumed = sessions.start(MEMBER, test.id, Some(app.id)).await.unwrap();
  assert!(resumed.resumed);

  clock.advance(Duration::minutes(15));
  let outcome = sessions
    .submit(
      started.session.id,
      MEMBER,
      AnswerSheet {
        answers: [("q1".to_owned(), AnswerValue::One("b".into()))]
          .into_iter()
          .collect(),
        ..Default::default()
      },
    )
    .await
    .unwrap();
  assert!(outcome.result.passed);
  assert_eq!(
    outcome.application.map(|a| a.status),
    Some(ApplicationStatus::TestCompleted)
  );

  let err = sessions.start(MEMBER, test.id, None).await.unwrap_err();
  assert!(matches!(err, CoreError::CooldownActive { .. }));

  // One note for the reviewer, three for the author.
  let outbox = s.pending_notifications(100).await.unwrap();
  assert_eq!(outbox.iter().filter(|e| e.notification.recipient_id == REVIEWER).count(), 1);
  assert_eq!(outbox.iter().filter(|e| e.notification.recipient_id == MEMBER).count(), 3);

  let stats = lifecycle.limiter().user_stats(MEMBER).await.unwrap();
  assert_eq!(stats.month_counts[&ApplicationType::Entry], 1);

  assert_eq!(lifecycle.reset_monthly_limits().await.unwrap(), 2);
}

#[tokio::test]
async fn racing_reviewers_on_sqlite_have_one_winner() {
  let s = Arc::new(store().await);
  let clock = Arc::new(ManualClock::new(t0()));
  let lifecycle = LifecycleController::new(
    Arc::clone(&s),
    Arc::clone(&s),
    Arc::clone(&s),
    Arc::clone(&clock) as Arc<dyn Clock>,
  );
  let app = lifecycle
    .submit(MEMBER, ApplicationType::Leave, Submission::default())
    .await
    .unwrap();

  let (approve, reject) = tokio::join!(
    lifecycle.advance_status(app.id, ApplicationStatus::Approved, Actor::Reviewer(REVIEWER), None),
    lifecycle.advance_status(app.id, ApplicationStatus::Rejected, Actor::Reviewer(UserId(11)), None),
  );
  assert!(approve.is_ok() != reject.is_ok());

  let fetched = lifecycle.get(app.id).await.unwrap();
  assert_eq!(fetched.status_history.len(), 2);
}
