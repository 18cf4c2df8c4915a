use color_eyre::Result;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::cache::CachedResponse;
use crate::fetch::FetchRequest;

/// Message action that triggers one reminder evaluation pass.
pub const ACTION_RUN_CHECK: &str = "run-check";
/// Message action that shows a one-off notification.
pub const ACTION_NOTIFY: &str = "notify";

/// Lifecycle and host events delivered to the agent.
#[derive(Debug)]
pub enum AgentEvent {
  /// Promote a waiting install to active
  Activate,
  /// Route a client request; the answer goes back on the oneshot. The client
  /// may drop the receiver (navigated away) - the route still completes and
  /// its cache write-back remains valid.
  Fetch {
    request: FetchRequest,
    respond: oneshot::Sender<Result<CachedResponse>>,
  },
  /// Opaque host message; recognized actions are handled, the rest ignored
  Message(serde_json::Value),
  /// The user clicked a notification with this tag
  NotificationClick { tag: String },
  Shutdown,
}

/// Channel the agent consumes events from, plus host-side producers.
pub struct EventBus {
  tx: mpsc::UnboundedSender<AgentEvent>,
  rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Get a sender for posting events from the host side.
  pub fn sender(&self) -> mpsc::UnboundedSender<AgentEvent> {
    self.tx.clone()
  }

  /// Receive the next event.
  pub async fn next(&mut self) -> Option<AgentEvent> {
    self.rx.recv().await
  }

  /// Spawn the host-side timer that posts a run-check message at a fixed
  /// cadence. The engine never self-schedules; this stands in for the
  /// platform's periodic wake-up.
  pub fn spawn_check_timer(&self, period: Duration) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      // The immediate first tick would race the install
      interval.tick().await;

      loop {
        interval.tick().await;
        let message = serde_json::json!({ "action": ACTION_RUN_CHECK });
        if tx.send(AgentEvent::Message(message)).is_err() {
          break;
        }
      }
    });
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
