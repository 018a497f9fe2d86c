//! One entry application walked from submission to closure.

use chrono::Duration;
use serde_json::json;

use crate::{
  Error,
  application::{Actor, ApplicationStatus, ApplicationType, Submission},
  exam::AnswerSheet,
  id::CharacterId,
};

use super::{fixtures::*, support::*};

#[tokio::test]
async fn entry_application_end_to_end() {
  let h = harness();
  let reviewer = Actor::Reviewer(REVIEWER);

  let app = h
    .lifecycle
    .submit(
      MEMBER,
      ApplicationType::Entry,
      Submission {
        character_id: Some(CharacterId(5)),
        data:         json!({ "motivation": "serve the academy" }),
      },
    )
    .await
    .unwrap();
  assert_eq!(app.status, ApplicationStatus::Pending);
  assert!(app.requires_test());

  h.clock.advance(Duration::hours(2));
  h.lifecycle
    .advance_status(app.id, ApplicationStatus::Approved, reviewer, None)
    .await
    .unwrap();
  let app = h
    .lifecycle
    .advance_status(
      app.id,
      ApplicationStatus::TestRequired,
      reviewer,
      Some("please take the entrance exam".into()),
    )
    .await
    .unwrap();
  assert_eq!(app.status, ApplicationStatus::TestRequired);

  let test = h.sessions.create_test(entry_exam()).await.unwrap();
  let started = h.sessions.start(MEMBER, test.id, Some(app.id)).await.unwrap();
  assert_eq!(started.session.application_id, Some(app.id));

  h.clock.advance(Duration::minutes(20));
  let outcome = h
    .sessions
    .submit(
      started.session.id,
      MEMBER,
      AnswerSheet {
        answers:          [("q1".to_owned(), answer_one("b"))].into_iter().collect(),
        time_spent:       1_190,
        focus_lost_count: 0,
        warnings_count:   0,
      },
    )
    .await
    .unwrap();

  assert_eq!(outcome.result.score, 7);
  assert_eq!(outcome.result.max_score, 10);
  assert_eq!(outcome.result.percentage, 70.0);
  assert!(outcome.result.passed);

  let app = outcome.application.unwrap();
  assert_eq!(app.status, ApplicationStatus::TestCompleted);
  assert_eq!(
    app.status_history.last().unwrap().comment.as_deref(),
    Some("Test passed with 70.0%")
  );
  // The automatic move does not overwrite who reviewed it.
  assert_eq!(app.reviewer_id, Some(REVIEWER));

  h.lifecycle
    .advance_status(app.id, ApplicationStatus::Resolved, reviewer, None)
    .await
    .unwrap();
  let app = h
    .lifecycle
    .advance_status(app.id, ApplicationStatus::Closed, reviewer, None)
    .await
    .unwrap();

  let statuses: Vec<_> = app.status_history.iter().map(|e| e.status).collect();
  assert_eq!(
    statuses,
    vec![
      ApplicationStatus::Pending,
      ApplicationStatus::Approved,
      ApplicationStatus::TestRequired,
      ApplicationStatus::TestCompleted,
      ApplicationStatus::Resolved,
      ApplicationStatus::Closed,
    ]
  );
  assert!(app.status_history.windows(2).all(|w| w[0].at <= w[1].at));

  let err = h
    .lifecycle
    .advance_status(app.id, ApplicationStatus::Pending, reviewer, None)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::InvalidTransition { from: ApplicationStatus::Closed, .. }
  ));

  let err = h.sessions.start(MEMBER, test.id, None).await.unwrap_err();
  match err {
    Error::CooldownActive { until } => {
      assert_eq!(until, outcome.result.created_at + Duration::hours(24));
    }
    other => panic!("unexpected error: {other}"),
  }

  // Every status change the author was told about, plus nothing for `pending`.
  assert_eq!(h.emitter.sent_to(MEMBER).len(), 5);
  assert_eq!(h.emitter.sent_to(REVIEWER).len(), 1);
}
