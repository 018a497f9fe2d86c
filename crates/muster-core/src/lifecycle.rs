//! Application lifecycle controller.
//!
//! Owns submission and every status change. The transition table on
//! [`ApplicationStatus`] is the only authority on which moves are legal; the
//! store's compare-and-swap makes sure two reviewers racing on the same
//! application cannot both win from the same prior state.
//!
//! [`ApplicationType::requires_test`] is advisory. Nothing here stops a
//! reviewer from resolving a test-requiring application without a test.

use std::sync::Arc;

use chrono::FixedOffset;

use crate::{
  Error, Result,
  application::{
    Actor, Application, ApplicationStatus, ApplicationType, NewApplication, StatusChange,
    Submission,
  },
  clock::Clock,
  id::{ApplicationId, UserId},
  limiter::RateLimiter,
  notify::{MemberDirectory, Notification, NotificationEmitter},
  store::{ApplicationQuery, RecordStore},
};

/// How many times a transition is retried after losing a compare-and-swap.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

pub const LIMITS_REFRESHED_NOTICE: &str =
  "Monthly application limits have been refreshed. You can submit new applications.";

pub struct LifecycleController<S, N, D> {
  store:     Arc<S>,
  emitter:   Arc<N>,
  directory: Arc<D>,
  clock:     Arc<dyn Clock>,
  limiter:   RateLimiter<S>,
}

impl<S, N, D> LifecycleController<S, N, D>
where
  S: RecordStore,
  N: NotificationEmitter,
  D: MemberDirectory,
{
  pub fn new(store: Arc<S>, emitter: Arc<N>, directory: Arc<D>, clock: Arc<dyn Clock>) -> Self {
    let limiter = RateLimiter::new(Arc::clone(&store), Arc::clone(&clock));
    Self {
      store,
      emitter,
      directory,
      clock,
      limiter,
    }
  }

  /// Use `offset` for calendar-month quota boundaries.
  pub fn with_calendar(mut self, offset: FixedOffset) -> Self {
    self.limiter = self.limiter.with_calendar(offset);
    self
  }

  pub fn limiter(&self) -> &RateLimiter<S> { &self.limiter }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn clock(&self) -> &Arc<dyn Clock> { &self.clock }

  // ── Submission ────────────────────────────────────────────────────────

  /// Submit a new application on behalf of `author`.
  pub async fn submit(
    &self,
    author: UserId,
    kind: ApplicationType,
    submission: Submission,
  ) -> Result<Application> {
    if !(submission.data.is_object() || submission.data.is_null()) {
      return Err(Error::Validation(
        "application data must be a JSON object".into(),
      ));
    }

    self.limiter.can_submit(author, kind).await?.into_result()?;

    let application = self
      .store
      .create_application(NewApplication {
        author_id:    author,
        character_id: submission.character_id,
        kind,
        data:         submission.data,
        submitted_at: self.clock.now(),
      })
      .await
      .map_err(Error::store)?;

    tracing::info!(id = %application.id, %author, %kind, "application submitted");

    let content = format!(
      "New {} application #{} is waiting for review",
      kind.label(),
      application.id
    );
    for reviewer in self.reviewers().await {
      self
        .notify(Notification {
          recipient_id: reviewer,
          content:      content.clone(),
          link:         application_link(application.id),
        })
        .await;
    }

    Ok(application)
  }

  // ── Transitions ───────────────────────────────────────────────────────

  /// Move an application to `to`.
  ///
  /// Fails with [`Error::NotFound`] for an unknown id and with
  /// [`Error::InvalidTransition`] if the table does not allow the move from
  /// the application's current status.
  pub async fn advance_status(
    &self,
    id: ApplicationId,
    to: ApplicationStatus,
    actor: Actor,
    comment: Option<String>,
  ) -> Result<Application> {
    let mut current = self.load(id).await?;

    for _ in 0..MAX_TRANSITION_ATTEMPTS {
      if !current.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
          from: current.status,
          to,
        });
      }

      let change = StatusChange {
        status:      to,
        at:          self.clock.now(),
        comment:     comment.clone(),
        reviewer_id: actor.reviewer_id(),
      };

      match self
        .store
        .transition_application(id, current.status, change)
        .await
        .map_err(Error::store)?
      {
        Some(updated) => {
          tracing::info!(%id, from = %current.status, %to, ?actor, "application status changed");
          self.notify_author(&updated, comment.as_deref()).await;
          return Ok(updated);
        }
        // Somebody else moved it first; re-validate against the new status.
        None => current = self.load(id).await?,
      }
    }

    Err(Error::InvalidTransition {
      from: current.status,
      to,
    })
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  pub async fn get(&self, id: ApplicationId) -> Result<Application> { self.load(id).await }

  pub async fn list_for_author(&self, author: UserId) -> Result<Vec<Application>> {
    self
      .store
      .list_applications(&ApplicationQuery::by_author(author))
      .await
      .map_err(Error::store)
  }

  // ── Maintenance ───────────────────────────────────────────────────────

  /// Tell every member that monthly limits are fresh again.
  ///
  /// Quotas are recomputed from history on every check, so there is nothing
  /// to reset; this only produces the announcement. Returns the number of
  /// members notified.
  pub async fn reset_monthly_limits(&self) -> Result<usize> {
    let members = self.directory.members().await.map_err(Error::store)?;
    for member in &members {
      self
        .notify(Notification {
          recipient_id: *member,
          content:      LIMITS_REFRESHED_NOTICE.to_owned(),
          link:         "/applications".to_owned(),
        })
        .await;
    }
    tracing::info!(recipients = members.len(), "monthly limit refresh announced");
    Ok(members.len())
  }

  // ── Helpers ───────────────────────────────────────────────────────────

  async fn load(&self, id: ApplicationId) -> Result<Application> {
    self
      .store
      .get_application(id)
      .await
      .map_err(Error::store)?
      .ok_or_else(|| Error::NotFound(format!("application {id}")))
  }

  /// Members allowed to review. A directory failure means nobody is told,
  /// not that the submission fails.
  async fn reviewers(&self) -> Vec<UserId> {
    let members = match self.directory.members().await {
      Ok(members) => members,
      Err(e) => {
        tracing::warn!(error = %e, "could not list members for review notification");
        return Vec::new();
      }
    };

    let mut reviewers = Vec::new();
    for member in members {
      match self.directory.is_reviewer(member).await {
        Ok(true) => reviewers.push(member),
        Ok(false) => {}
        Err(e) => tracing::warn!(%member, error = %e, "reviewer check failed"),
      }
    }
    reviewers
  }

  async fn notify_author(&self, application: &Application, comment: Option<&str>) {
    let Some(notice) = application.status.notice() else {
      return;
    };
    let mut content = format!(
      "Your {} application #{}: {notice}",
      application.kind.label(),
      application.id
    );
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
      content.push_str(&format!(" ({comment})"));
    }

    self
      .notify(Notification {
        recipient_id: application.author_id,
        content,
        link: application_link(application.id),
      })
      .await;
  }

  /// Best effort: a failed emit is logged and otherwise ignored.
  async fn notify(&self, notification: Notification) {
    let recipient = notification.recipient_id;
    if let Err(e) = self.emitter.emit(notification).await {
      tracing::warn!(%recipient, error = %e, "notification could not be emitted");
    }
  }
}

pub fn application_link(id: ApplicationId) -> String { format!("/applications/{id}") }
