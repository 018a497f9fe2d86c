//! Submission rate limiter.
//!
//! Quotas are recomputed from the record store on every check; there is no
//! counter to drift or to reset. Two concurrent submissions can both observe
//! room under the quota, so the limit is soft. Applications are rare,
//! human-paced events and this is accepted.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{
  DateTime, Datelike as _, Duration, FixedOffset, Months, NaiveDate, NaiveTime, Offset as _, Utc,
};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator as _;

use crate::{
  Error, Result,
  application::{Application, ApplicationType},
  clock::Clock,
  id::UserId,
  store::{ApplicationQuery, RecordStore},
};

// ─── Rules ───────────────────────────────────────────────────────────────────

/// The configured limits. Constant for the whole community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
  pub entry_per_month:         u32,
  pub leave_per_month:         u32,
  /// Minimum gap between two promotion/qualification submissions.
  pub promotion_cooldown_days: i64,
}

pub const RULES: RateLimitRules = RateLimitRules {
  entry_per_month:         3,
  leave_per_month:         2,
  promotion_cooldown_days: 7,
};

/// Types sharing a single cooldown.
const COOLDOWN_KINDS: [ApplicationType; 2] =
  [ApplicationType::Promotion, ApplicationType::Qualification];

impl RateLimitRules {
  pub fn monthly_quota(&self, kind: ApplicationType) -> Option<u32> {
    match kind {
      ApplicationType::Entry => Some(self.entry_per_month),
      ApplicationType::Leave => Some(self.leave_per_month),
      _ => None,
    }
  }

  pub fn cooldown(&self) -> Duration { Duration::days(self.promotion_cooldown_days) }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Answer to "may this user submit this type now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
  pub allowed:          bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason:           Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub remaining_count:  Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cooldown_ends_at: Option<DateTime<Utc>>,
}

impl LimitDecision {
  fn allow() -> Self {
    Self {
      allowed:          true,
      reason:           None,
      remaining_count:  None,
      cooldown_ends_at: None,
    }
  }

  /// Convert a denial into [`Error::LimitExceeded`].
  pub fn into_result(self) -> Result<Self> {
    if self.allowed {
      return Ok(self);
    }
    Err(Error::LimitExceeded {
      reason:           self.reason.unwrap_or_else(|| "limit reached".into()),
      cooldown_ends_at: self.cooldown_ends_at,
    })
  }
}

/// Read-only projection for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
  /// Submissions in the current calendar month, per type.
  pub month_counts:      BTreeMap<ApplicationType, u32>,
  pub limits:            RateLimitRules,
  /// Start of next calendar month, when monthly quotas free up.
  pub resets_at:         DateTime<Utc>,
  pub last_promotion_at: Option<DateTime<Utc>>,
}

// ─── Limiter ─────────────────────────────────────────────────────────────────

pub struct RateLimiter<S> {
  store:    Arc<S>,
  clock:    Arc<dyn Clock>,
  calendar: FixedOffset,
}

impl<S> Clone for RateLimiter<S> {
  fn clone(&self) -> Self {
    Self {
      store:    Arc::clone(&self.store),
      clock:    Arc::clone(&self.clock),
      calendar: self.calendar,
    }
  }
}

impl<S: RecordStore> RateLimiter<S> {
  /// A limiter whose calendar months are UTC months.
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      calendar: Utc.fix(),
    }
  }

  /// Count calendar months in `offset` (the server's local time).
  pub fn with_calendar(mut self, offset: FixedOffset) -> Self {
    self.calendar = offset;
    self
  }

  pub async fn can_submit(&self, user: UserId, kind: ApplicationType) -> Result<LimitDecision> {
    let now = self.clock.now();

    let decision = if let Some(quota) = RULES.monthly_quota(kind) {
      let (month_start, _) = month_bounds(now, self.calendar);
      let history = self.history(user, &[kind]).await?;
      let used = count_between(&history, month_start, now);

      if used < quota {
        // Left over once the submission being checked goes through.
        LimitDecision {
          remaining_count: Some(quota - used - 1),
          ..LimitDecision::allow()
        }
      } else {
        LimitDecision {
          allowed:          false,
          reason:           Some(format!(
            "at most {quota} {} applications may be submitted per month",
            kind.label()
          )),
          remaining_count:  Some(0),
          cooldown_ends_at: None,
        }
      }
    } else if COOLDOWN_KINDS.contains(&kind) {
      let history = self.history(user, &COOLDOWN_KINDS).await?;
      match latest_submission(&history) {
        Some(last) if now < last + RULES.cooldown() => {
          let ends = last + RULES.cooldown();
          LimitDecision {
            allowed:          false,
            reason:           Some(format!(
              "promotion and qualification applications need {} days between submissions",
              RULES.promotion_cooldown_days
            )),
            remaining_count:  None,
            cooldown_ends_at: Some(ends),
          }
        }
        _ => LimitDecision::allow(),
      }
    } else {
      LimitDecision::allow()
    };

    tracing::debug!(%user, %kind, allowed = decision.allowed, "rate limit check");
    Ok(decision)
  }

  pub async fn user_stats(&self, user: UserId) -> Result<UserStats> {
    let now = self.clock.now();
    let (month_start, next_month) = month_bounds(now, self.calendar);
    let history = self
      .store
      .list_applications(&ApplicationQuery::by_author(user))
      .await
      .map_err(Error::store)?;

    let month_counts = ApplicationType::iter()
      .map(|kind| {
        let of_kind = history.iter().filter(|a| a.kind == kind);
        (kind, count_between(of_kind, month_start, now))
      })
      .collect();

    let cooldown_history: Vec<_> = history
      .into_iter()
      .filter(|a| COOLDOWN_KINDS.contains(&a.kind))
      .collect();

    Ok(UserStats {
      month_counts,
      limits: RULES,
      resets_at: next_month,
      last_promotion_at: latest_submission(&cooldown_history),
    })
  }

  async fn history(&self, user: UserId, kinds: &[ApplicationType]) -> Result<Vec<Application>> {
    let query = ApplicationQuery::by_author(user).of_kinds(kinds);
    self.store.list_applications(&query).await.map_err(Error::store)
  }
}

fn count_between<'a>(
  history: impl IntoIterator<Item = &'a Application>,
  from: DateTime<Utc>,
  to: DateTime<Utc>,
) -> u32 {
  history
    .into_iter()
    .map(Application::submitted_at)
    .filter(|at| *at >= from && *at <= to)
    .count() as u32
}

fn latest_submission(history: &[Application]) -> Option<DateTime<Utc>> {
  history.iter().map(Application::submitted_at).max()
}

/// Start of the calendar month containing `now` and start of the next one,
/// both as seen from `calendar`.
pub fn month_bounds(now: DateTime<Utc>, calendar: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
  let today = now.with_timezone(&calendar).date_naive();
  let first = today.with_day(1).unwrap_or(today);
  let next = first.checked_add_months(Months::new(1)).unwrap_or(first);
  (local_midnight(first, calendar), local_midnight(next, calendar))
}

fn local_midnight(date: NaiveDate, calendar: FixedOffset) -> DateTime<Utc> {
  let naive = date.and_time(NaiveTime::MIN);
  naive
    .and_local_timezone(calendar)
    .single()
    .map_or_else(|| naive.and_utc(), |dt| dt.with_timezone(&Utc))
}
