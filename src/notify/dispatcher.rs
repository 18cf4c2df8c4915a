//! Deduplicated delivery of notification events to the platform surface.

use std::collections::HashSet;

use tracing::{debug, info};

use super::policy::{NotificationEvent, Severity};

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Replace-in-place tag: a later notification with the same tag replaces
  /// the earlier one instead of stacking
  pub tag: String,
  pub severity: Severity,
  pub icon: Option<String>,
  /// Small monochrome status-bar image, where the platform shows one
  pub badge: Option<String>,
  /// Alert again when replacing a notification with the same tag
  pub renotify: bool,
}

/// Platform-specific notification adapters implement this trait.
pub trait NotificationSurface: Send + Sync {
  /// Whether notifications can be shown at all (permission granted).
  fn available(&self) -> bool {
    true
  }

  fn show(&self, notification: &Notification);

  fn close(&self, tag: &str);
}

/// Platform-specific window adapters implement this trait.
pub trait ClientSurface: Send + Sync {
  /// Focus an existing window for the given origin, or open a new one if none
  /// exists. Exactly one window ends up focused or opened per call.
  fn focus_or_open(&self, origin: &str);
}

/// Surface that only logs. Stands in where no platform adapter is wired up.
#[derive(Debug, Default)]
pub struct LogSurface;

impl NotificationSurface for LogSurface {
  fn show(&self, notification: &Notification) {
    info!(
      tag = %notification.tag,
      severity = notification.severity.as_str(),
      "{}: {}",
      notification.title,
      notification.body
    );
  }

  fn close(&self, tag: &str) {
    debug!(%tag, "Closing notification");
  }
}

impl ClientSurface for LogSurface {
  fn focus_or_open(&self, origin: &str) {
    info!(%origin, "Would focus or open app window");
  }
}

/// Emits policy decisions as platform notifications, collapsing duplicates.
pub struct NotificationDispatcher<N: NotificationSurface, C: ClientSurface> {
  notifications: N,
  clients: C,
  /// App origin that clicks navigate to
  origin: String,
  /// Icon URL attached to every notification
  icon: Option<String>,
  /// Badge URL attached to every notification
  badge: Option<String>,
}

impl<N: NotificationSurface, C: ClientSurface> NotificationDispatcher<N, C> {
  pub fn new(notifications: N, clients: C, origin: String) -> Self {
    Self {
      notifications,
      clients,
      origin,
      icon: None,
      badge: None,
    }
  }

  pub fn with_icon(mut self, icon: Option<String>) -> Self {
    self.icon = icon;
    self
  }

  pub fn with_badge(mut self, badge: Option<String>) -> Self {
    self.badge = badge;
    self
  }

  /// Show each event, collapsing events that share a dedupe key. The key
  /// doubles as the platform tag, so a re-fire on a later pass within the same
  /// day replaces the prior notification instead of stacking a duplicate.
  ///
  /// Returns how many notifications were shown. When the surface is
  /// unavailable the whole dispatch is a no-op, not an error.
  pub fn dispatch(&self, events: &[NotificationEvent]) -> usize {
    if !self.notifications.available() {
      debug!(
        count = events.len(),
        "Notification surface unavailable, dropping events"
      );
      return 0;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut shown = 0;

    for event in events {
      if !seen.insert(&event.dedupe_key) {
        debug!(key = %event.dedupe_key, "Collapsed duplicate event");
        continue;
      }

      // Replace-in-place without re-alerting: a later pass re-firing the
      // same tag within the day is silent from the user's perspective
      self.notifications.show(&Notification {
        title: event.title.clone(),
        body: event.body.clone(),
        tag: event.dedupe_key.clone(),
        severity: event.severity,
        icon: self.icon.clone(),
        badge: self.badge.clone(),
        renotify: false,
      });
      shown += 1;
    }

    shown
  }

  /// Show a one-off notification that bypasses the policy (ad-hoc "notify"
  /// messages from the host).
  pub fn notify(&self, title: &str, body: &str) {
    if !self.notifications.available() {
      return;
    }

    self.notifications.show(&Notification {
      title: title.to_string(),
      body: body.to_string(),
      tag: format!("adhoc:{title}"),
      severity: Severity::Upcoming,
      icon: self.icon.clone(),
      badge: self.badge.clone(),
      renotify: false,
    });
  }

  /// The user clicked a notification: close it and bring the app forward.
  pub fn on_notification_click(&self, tag: &str) {
    self.notifications.close(tag);
    self.clients.focus_or_open(&self.origin);
  }
}
