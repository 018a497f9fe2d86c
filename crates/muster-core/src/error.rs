//! Error types for `muster-core`.
//!
//! Every variant except [`Error::Store`] is an expected business outcome and
//! is meant to be shown to the caller as-is.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
  application::ApplicationStatus,
  id::{SessionId, TestId},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("{0} not found")]
  NotFound(String),

  #[error("cannot move application from {from} to {to}")]
  InvalidTransition {
    from: ApplicationStatus,
    to:   ApplicationStatus,
  },

  #[error("submission limit exceeded: {reason}")]
  LimitExceeded {
    reason:           String,
    cooldown_ends_at: Option<DateTime<Utc>>,
  },

  #[error("test retake is locked until {until}")]
  CooldownActive { until: DateTime<Utc> },

  #[error("no active test session {0}")]
  NoActiveSession(SessionId),

  #[error("time limit of {limit_secs}s exceeded ({elapsed_secs}s elapsed)")]
  TimeExceeded { elapsed_secs: i64, limit_secs: i64 },

  #[error("test not found: {0}")]
  TestNotFound(TestId),

  #[error("validation error: {0}")]
  Validation(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Box a collaborator error into [`Error::Store`].
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
