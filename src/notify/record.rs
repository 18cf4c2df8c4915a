//! Filter records and the snapshot document they arrive in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One tracked replaceable item, as written by the main application.
///
/// The agent only ever reads these; the main app owns the records and
/// publishes them into the cache as a JSON snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRecord {
  pub id: String,
  pub name: String,
  /// When the item was last replaced
  pub last_replaced: DateTime<Utc>,
  /// Months until the next due date
  pub interval_months: u32,
  /// Fire an "upcoming" alert this many days ahead of the due date
  #[serde(default)]
  pub advance_notify_days: i64,
  #[serde(default)]
  pub day_before_enabled: bool,
  /// Reminder cadence during the final 24 hours before due
  #[serde(default)]
  pub day_before_interval_hours: i64,
  #[serde(default)]
  pub due_day_enabled: bool,
  /// Reminder cadence during the due-day window
  #[serde(default)]
  pub due_day_interval_hours: i64,
}

/// Decode the snapshot document into records.
///
/// The snapshot is untrusted input from the agent's point of view: a document
/// that is not an array yields zero records, and a malformed element is
/// skipped without affecting its neighbours. Never fails the pass.
pub fn decode_snapshot(bytes: &[u8]) -> Vec<FilterRecord> {
  let value: serde_json::Value = match serde_json::from_slice(bytes) {
    Ok(v) => v,
    Err(e) => {
      warn!("Filter snapshot is not valid JSON, treating as empty: {e}");
      return Vec::new();
    }
  };

  let items = match value {
    serde_json::Value::Array(items) => items,
    other => {
      warn!(
        "Filter snapshot is not an array (got {}), treating as empty",
        type_name(&other)
      );
      return Vec::new();
    }
  };

  items
    .into_iter()
    .enumerate()
    .filter_map(|(index, item)| match serde_json::from_value(item) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!("Skipping malformed filter record at index {index}: {e}");
        None
      }
    })
    .collect()
}

fn type_name(value: &serde_json::Value) -> &'static str {
  match value {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "bool",
    serde_json::Value::Number(_) => "number",
    serde_json::Value::String(_) => "string",
    serde_json::Value::Array(_) => "array",
    serde_json::Value::Object(_) => "object",
  }
}
