//! Due-date evaluation: converts a filter record and the current time into
//! zero or more notification events.

use chrono::{DateTime, Months, Utc};
use tracing::warn;

use super::record::FilterRecord;

const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_HOUR: i64 = 3_600;

/// Notification tier, in escalating order of urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
  Upcoming,
  DueToday,
  Overdue,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Upcoming => "upcoming",
      Severity::DueToday => "due-today",
      Severity::Overdue => "overdue",
    }
  }
}

/// One decided notification. Produced and consumed within a single evaluation
/// pass; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
  pub severity: Severity,
  pub filter_id: String,
  pub title: String,
  pub body: String,
  /// Collapses repeated firings of the same alert within one calendar day
  pub dedupe_key: String,
}

/// The due date for a record: last replacement plus the configured number of
/// calendar months (end-of-month dates clamp, e.g. Jan 31 + 1 month = Feb 29).
pub fn next_due(filter: &FilterRecord) -> Option<DateTime<Utc>> {
  filter
    .last_replaced
    .checked_add_months(Months::new(filter.interval_months))
}

/// Evaluate one record against the current time.
///
/// Pure in its output: identical `(filter, now)` inputs always produce the
/// identical event set. A record may legally emit more than one event in a
/// pass (e.g. the blanket overdue alert plus a due-day-tier reminder); the
/// dispatcher collapses by dedupe key.
pub fn evaluate(filter: &FilterRecord, now: DateTime<Utc>) -> Vec<NotificationEvent> {
  if filter.interval_months == 0 {
    warn!(
      filter = %filter.id,
      "Record has intervalMonths = 0, skipping"
    );
    return Vec::new();
  }

  let Some(due) = next_due(filter) else {
    warn!(filter = %filter.id, "Due date out of range, skipping");
    return Vec::new();
  };

  let until_due_secs = (due - now).num_seconds();
  let days_until_due = until_due_secs.div_euclid(SECS_PER_DAY)
    + i64::from(until_due_secs.rem_euclid(SECS_PER_DAY) != 0);
  let hours_until_due = until_due_secs.div_euclid(SECS_PER_HOUR);

  let mut events = Vec::new();

  if days_until_due > 0 && days_until_due <= filter.advance_notify_days {
    events.push(event(
      filter,
      now,
      Severity::Upcoming,
      "Filter replacement coming up",
      format!(
        "{} needs replacement in {} day(s)",
        filter.name, days_until_due
      ),
    ));
  }

  if days_until_due <= 0 {
    events.push(event(
      filter,
      now,
      Severity::Overdue,
      "Filter overdue",
      format!("{} is {} day(s) overdue", filter.name, -days_until_due),
    ));
  }

  if filter.day_before_enabled && days_until_due == 1 {
    if let Some(interval) = cadence(filter, "dayBeforeIntervalHours", filter.day_before_interval_hours)
    {
      if hours_until_due % interval == 0 {
        events.push(event(
          filter,
          now,
          Severity::Upcoming,
          "Filter due tomorrow",
          format!("{} is due tomorrow", filter.name),
        ));
      }
    }
  }

  if filter.due_day_enabled && days_until_due == 0 {
    // The modulus is over hours-since-due, which is 0..=23 inside the due-day
    // window; hours-until-due is negative here and would make the "every N
    // hours" cadence meaningless.
    let hours_since_due = (-until_due_secs).div_euclid(SECS_PER_HOUR);
    if let Some(interval) = cadence(filter, "dueDayIntervalHours", filter.due_day_interval_hours) {
      if hours_since_due % interval == 0 {
        events.push(event(
          filter,
          now,
          Severity::DueToday,
          "Filter due today",
          format!("{} is due today", filter.name),
        ));
      }
    }
  }

  events
}

/// A tier whose interval is zero or negative is treated as disabled rather
/// than a configuration error; the rest of the record still evaluates.
fn cadence(filter: &FilterRecord, field: &str, hours: i64) -> Option<i64> {
  if hours > 0 {
    Some(hours)
  } else {
    warn!(
      filter = %filter.id,
      "{field} = {hours} with its tier enabled, treating tier as disabled"
    );
    None
  }
}

fn event(
  filter: &FilterRecord,
  now: DateTime<Utc>,
  severity: Severity,
  title: &str,
  body: String,
) -> NotificationEvent {
  NotificationEvent {
    severity,
    filter_id: filter.id.clone(),
    title: title.to_string(),
    body,
    dedupe_key: format!("{}:{}:{}", filter.id, severity.as_str(), now.date_naive()),
  }
}
