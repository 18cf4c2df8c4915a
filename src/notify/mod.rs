//! Due-date notification engine: record model, tier evaluation, dispatch.

mod dispatcher;
mod policy;
mod record;

pub use dispatcher::{
  ClientSurface, LogSurface, Notification, NotificationDispatcher, NotificationSurface,
};
pub use policy::{evaluate, next_due, NotificationEvent, Severity};
pub use record::{decode_snapshot, FilterRecord};
