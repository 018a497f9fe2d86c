//! Notification events and the member directory.
//!
//! The core never delivers anything itself. It hands [`Notification`]s to a
//! [`NotificationEmitter`] and carries on whether or not that succeeds.

use std::{convert::Infallible, future::Future};

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// A message addressed to one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub recipient_id: UserId,
  pub content:      String,
  /// Frontend-relative path the notification points at.
  pub link:         String,
}

/// Sink for notification events. Delivery is the implementor's concern.
pub trait NotificationEmitter: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn emit(
    &self,
    notification: Notification,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Who is a member, and who may review.
pub trait MemberDirectory: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Whether `user` is a privileged reviewer.
  fn is_reviewer(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Every known member, reviewers included.
  fn members(&self) -> impl Future<Output = Result<Vec<UserId>, Self::Error>> + Send + '_;
}

/// Emitter that only writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl NotificationEmitter for TracingEmitter {
  type Error = Infallible;

  async fn emit(&self, notification: Notification) -> Result<(), Infallible> {
    tracing::info!(
      recipient = %notification.recipient_id,
      link = %notification.link,
      "{}",
      notification.content
    );
    Ok(())
  }
}
