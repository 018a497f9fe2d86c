//! Applications and their status state machine.
//!
//! An application's status only changes through a validated transition, and
//! every change appends a [`StatusEntry`] to its history. History entries are
//! never rewritten; the first one doubles as the submission timestamp used by
//! the rate limiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::id::{ApplicationId, CharacterId, UserId};

// ─── Type ────────────────────────────────────────────────────────────────────

/// What the member is applying for.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplicationType {
  Entry,
  Promotion,
  Qualification,
  TransferDept,
  TransferDiv,
  Leave,
  JointPrimary,
  JointSecondary,
  JointRemove,
}

impl ApplicationType {
  /// Whether a knowledge test is expected before the application resolves.
  ///
  /// Advisory only: the lifecycle controller lets a reviewer go from
  /// `approved` straight to `resolved` regardless.
  pub fn requires_test(self) -> bool {
    matches!(self, Self::Entry | Self::Promotion | Self::Qualification)
  }

  /// Human-readable name used in notification text.
  pub fn label(self) -> &'static str {
    match self {
      Self::Entry => "entry",
      Self::Promotion => "promotion",
      Self::Qualification => "qualification",
      Self::TransferDept => "department transfer",
      Self::TransferDiv => "division transfer",
      Self::Leave => "leave",
      Self::JointPrimary => "joint primary",
      Self::JointSecondary => "joint secondary",
      Self::JointRemove => "joint removal",
    }
  }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle state of an application. `pending` is initial, `closed` is
/// terminal.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplicationStatus {
  Pending,
  Approved,
  Rejected,
  TestRequired,
  TestCompleted,
  TestFailed,
  Resolved,
  Closed,
}

impl ApplicationStatus {
  /// The statuses reachable from `self` in a single transition.
  pub fn allowed_transitions(self) -> &'static [ApplicationStatus] {
    use ApplicationStatus::*;
    match self {
      Pending => &[Approved, Rejected],
      Approved => &[TestRequired, Resolved, Closed],
      TestRequired => &[TestCompleted, TestFailed],
      TestCompleted => &[Resolved, Rejected],
      TestFailed => &[Rejected, TestRequired],
      Resolved => &[Closed],
      Rejected => &[Closed],
      Closed => &[],
    }
  }

  pub fn can_transition_to(self, next: ApplicationStatus) -> bool {
    self.allowed_transitions().contains(&next)
  }

  pub fn is_terminal(self) -> bool { self.allowed_transitions().is_empty() }

  /// The phrase sent to the author when an application enters this status.
  /// `None` for `pending`, which is never a transition target.
  pub fn notice(self) -> Option<&'static str> {
    match self {
      Self::Pending => None,
      Self::Approved => Some("approved"),
      Self::Rejected => Some("rejected"),
      Self::TestRequired => Some("test required"),
      Self::TestCompleted => Some("awaiting final review"),
      Self::TestFailed => Some("failed, retake after 24h"),
      Self::Resolved => Some("processed successfully"),
      Self::Closed => Some("closed"),
    }
  }
}

// ─── History ─────────────────────────────────────────────────────────────────

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
  pub status:      ApplicationStatus,
  pub at:          DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub comment:     Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reviewer_id: Option<UserId>,
}

// ─── Application ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
  pub id:             ApplicationId,
  pub author_id:      UserId,
  pub character_id:   Option<CharacterId>,
  #[serde(rename = "type")]
  pub kind:           ApplicationType,
  pub status:         ApplicationStatus,
  pub status_history: Vec<StatusEntry>,
  /// Type-specific payload; shape is owned by the submitting frontend.
  pub data:           serde_json::Value,
  pub reviewer_id:    Option<UserId>,
  pub review_comment: Option<String>,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

impl Application {
  /// When the application was submitted: the first history entry.
  pub fn submitted_at(&self) -> DateTime<Utc> {
    self
      .status_history
      .first()
      .map_or(self.created_at, |entry| entry.at)
  }

  pub fn requires_test(&self) -> bool { self.kind.requires_test() }
}

/// Input to [`RecordStore::create_application`](crate::store::RecordStore::create_application).
///
/// The store persists it in `pending` with a single history entry stamped
/// `submitted_at`.
#[derive(Debug, Clone)]
pub struct NewApplication {
  pub author_id:    UserId,
  pub character_id: Option<CharacterId>,
  pub kind:         ApplicationType,
  pub data:         serde_json::Value,
  pub submitted_at: DateTime<Utc>,
}

/// Caller-supplied part of a submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
  #[serde(default)]
  pub character_id: Option<CharacterId>,
  #[serde(default)]
  pub data:         serde_json::Value,
}

/// Who performs a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
  /// A privileged member; recorded as the application's reviewer.
  Reviewer(UserId),
  /// The engine itself, e.g. after scoring a linked test.
  System,
}

impl Actor {
  pub fn reviewer_id(self) -> Option<UserId> {
    match self {
      Self::Reviewer(id) => Some(id),
      Self::System => None,
    }
  }
}

/// A validated status change, handed to the store for a compare-and-swap
/// write.
///
/// When `reviewer_id` is set the store also overwrites the application's
/// `reviewer_id` and `review_comment`.
#[derive(Debug, Clone)]
pub struct StatusChange {
  pub status:      ApplicationStatus,
  pub at:          DateTime<Utc>,
  pub comment:     Option<String>,
  pub reviewer_id: Option<UserId>,
}

impl StatusChange {
  pub fn entry(&self) -> StatusEntry {
    StatusEntry {
      status:      self.status,
      at:          self.at,
      comment:     self.comment.clone(),
      reviewer_id: self.reviewer_id,
    }
  }
}
