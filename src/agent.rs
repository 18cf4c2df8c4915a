//! Lifecycle controller: wires the cache, router, policy and dispatcher
//! together and drives them from agent events.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, RequestKey};
use crate::config::Config;
use crate::event::{AgentEvent, EventBus, ACTION_NOTIFY, ACTION_RUN_CHECK};
use crate::fetch::{FetchRouter, Transport};
use crate::notify::{
  decode_snapshot, evaluate, ClientSurface, FilterRecord, NotificationDispatcher,
  NotificationEvent, NotificationSurface,
};

/// Lifecycle states. Installing transitions to Waiting (or straight to Active
/// under skip-waiting) once the baseline cache is populated; eviction of old
/// generations happens on the Waiting -> Active edge, never earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Active,
}

/// The background agent.
pub struct Agent<T, N, C>
where
  T: Transport + Clone,
  N: NotificationSurface,
  C: ClientSurface,
{
  store: CacheStore,
  transport: T,
  router: FetchRouter<T>,
  dispatcher: NotificationDispatcher<N, C>,

  /// Baseline assets populated at install
  assets: Vec<RequestKey>,
  /// Cache location of the filter-record snapshot
  snapshot_key: RequestKey,
  skip_waiting: bool,

  state: LifecycleState,
}

impl<T, N, C> Agent<T, N, C>
where
  T: Transport + Clone,
  N: NotificationSurface,
  C: ClientSurface,
{
  pub fn new(
    config: &Config,
    store: CacheStore,
    transport: T,
    notifications: N,
    clients: C,
  ) -> Result<Self> {
    let assets = config.asset_keys()?;
    let snapshot_key = config.request_key(&config.app.snapshot_path)?;
    let offline_document = config.request_key(&config.app.offline_document)?;

    let icon = match &config.app.icon {
      Some(path) => Some(config.request_key(path)?.url().to_string()),
      None => None,
    };
    let badge = match &config.app.badge {
      Some(path) => Some(config.request_key(path)?.url().to_string()),
      None => None,
    };

    let router = FetchRouter::new(transport.clone(), offline_document);
    let dispatcher =
      NotificationDispatcher::new(notifications, clients, config.app.base_url.clone())
        .with_icon(icon)
        .with_badge(badge);

    Ok(Self {
      store,
      transport,
      router,
      dispatcher,
      assets,
      snapshot_key,
      skip_waiting: config.skip_waiting,
      state: LifecycleState::Installing,
    })
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  /// Install, then process events until shutdown.
  pub async fn run(&mut self, mut bus: EventBus) -> Result<()> {
    self.install().await?;

    while let Some(event) = bus.next().await {
      if !self.handle_event(event).await {
        break;
      }
    }

    Ok(())
  }

  /// Populate the configured generation.
  ///
  /// Precondition: state is Installing. Postcondition: Active (skip-waiting
  /// or fallback to a committed generation) or Waiting. A failed populate
  /// writes nothing; if a generation was ever committed, the agent keeps
  /// serving it and the install retries on the next start.
  pub async fn install(&mut self) -> Result<()> {
    if self.state != LifecycleState::Installing {
      debug!(state = ?self.state, "Ignoring install, already past it");
      return Ok(());
    }

    info!(
      generation = self.store.generation(),
      assets = self.assets.len(),
      "Installing"
    );

    let transport = self.transport.clone();
    let populated = self
      .store
      .populate(&self.assets, move |key| {
        let transport = transport.clone();
        async move { transport.fetch(&key).await }
      })
      .await;

    match populated {
      Ok(count) => {
        info!(count, "Baseline cache populated");
        if self.skip_waiting {
          self.activate()
        } else {
          self.state = LifecycleState::Waiting;
          Ok(())
        }
      }
      Err(e) => match self.store.current_generation()? {
        Some(previous) => {
          if previous != self.store.generation() {
            warn!(
              generation = self.store.generation(),
              %previous,
              "Install failed, continuing to serve previous generation: {e}"
            );
            self.store.rebind(&previous);
          } else {
            // Re-installing the committed generation; its entries are intact
            warn!(
              generation = self.store.generation(),
              "Install failed, continuing to serve the committed generation: {e}"
            );
          }
          self.state = LifecycleState::Active;
          Ok(())
        }
        None => Err(eyre!(
          "Install of generation {} failed with nothing to fall back to: {}",
          self.store.generation(),
          e
        )),
      },
    }
  }

  /// Cut over to this generation and evict every other one.
  ///
  /// Precondition: this generation's population has completed. The cutover
  /// marker is committed before eviction so in-flight use of the previous
  /// generation is never invalidated mid-install.
  fn activate(&mut self) -> Result<()> {
    self.store.commit_cutover()?;
    let evicted = self.store.evict_other_generations()?;
    self.state = LifecycleState::Active;

    info!(
      generation = self.store.generation(),
      evicted, "Activated"
    );
    Ok(())
  }

  /// Handle one event. Returns false when the agent should stop.
  pub async fn handle_event(&mut self, event: AgentEvent) -> bool {
    match event {
      AgentEvent::Activate => {
        if self.state == LifecycleState::Waiting {
          if let Err(e) = self.activate() {
            warn!("Activation failed: {e}");
          }
        } else {
          debug!(state = ?self.state, "Ignoring activate");
        }
      }
      AgentEvent::Fetch { request, respond } => {
        let result = if self.state == LifecycleState::Active {
          self.router.route(&self.store, &request).await
        } else {
          Err(eyre!("Agent is not active yet"))
        };
        // The client may have abandoned the request; any cache write-back
        // already happened and stays valid
        let _ = respond.send(result);
      }
      AgentEvent::Message(message) => self.handle_message(&message),
      AgentEvent::NotificationClick { tag } => self.dispatcher.on_notification_click(&tag),
      AgentEvent::Shutdown => {
        info!("Shutting down");
        return false;
      }
    }

    true
  }

  fn handle_message(&mut self, message: &serde_json::Value) {
    match message.get("action").and_then(|a| a.as_str()) {
      Some(ACTION_RUN_CHECK) => {
        if self.state == LifecycleState::Active {
          self.run_check();
        } else {
          debug!(state = ?self.state, "Ignoring run-check before activation");
        }
      }
      Some(ACTION_NOTIFY) => {
        let title = message
          .get("title")
          .and_then(|t| t.as_str())
          .unwrap_or("Reminder");
        let body = message
          .get("body")
          .and_then(|b| b.as_str())
          .unwrap_or("Time to check your filter!");
        self.dispatcher.notify(title, body);
      }
      other => {
        debug!(action = ?other, "Ignoring unrecognized message");
      }
    }
  }

  /// One evaluation pass over the snapshot records.
  fn run_check(&self) {
    let records = self.load_records();
    let now = Utc::now();

    let mut events: Vec<NotificationEvent> = Vec::new();
    for record in &records {
      // A degenerate record yields no events; it never aborts the pass
      events.extend(evaluate(record, now));
    }

    let shown = self.dispatcher.dispatch(&events);
    info!(
      records = records.len(),
      decided = events.len(),
      shown,
      "Reminder check complete"
    );
  }

  /// Read the snapshot from the cache. Missing or unreadable degrades to no
  /// records; the snapshot is owned by the main app and may lag behind it.
  fn load_records(&self) -> Vec<FilterRecord> {
    match self.store.lookup(&self.snapshot_key) {
      Ok(Some(entry)) => {
        debug!(
          generation = %entry.generation,
          fetched_at = %entry.fetched_at,
          "Loaded filter snapshot from cache"
        );
        decode_snapshot(&entry.response.body)
      }
      Ok(None) => {
        warn!(
          key = %self.snapshot_key.description(),
          "Filter snapshot not in cache, no records to check"
        );
        Vec::new()
      }
      Err(e) => {
        warn!("Failed to read filter snapshot: {e}");
        Vec::new()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CachedResponse;
  use crate::fetch::FetchRequest;
  use crate::notify::Notification;
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};
  use tokio::sync::oneshot;

  #[derive(Clone, Default)]
  struct FakeTransport {
    responses: Arc<HashMap<String, String>>,
  }

  impl FakeTransport {
    fn serving(pairs: &[(&str, &str)]) -> Self {
      let responses = pairs
        .iter()
        .map(|(url, body)| (url.to_string(), body.to_string()))
        .collect();
      Self {
        responses: Arc::new(responses),
      }
    }
  }

  impl Transport for FakeTransport {
    async fn fetch(&self, key: &RequestKey) -> Result<CachedResponse> {
      self
        .responses
        .get(key.url().as_str())
        .map(|body| CachedResponse {
          status: 200,
          content_type: Some("text/html".to_string()),
          headers: Vec::new(),
          body: body.as_bytes().to_vec(),
        })
        .ok_or_else(|| eyre!("connection refused"))
    }
  }

  #[derive(Clone, Default)]
  struct FakeSurface {
    shown: Arc<Mutex<Vec<Notification>>>,
    focused: Arc<Mutex<Vec<String>>>,
  }

  impl NotificationSurface for FakeSurface {
    fn show(&self, notification: &Notification) {
      self.shown.lock().unwrap().push(notification.clone());
    }

    fn close(&self, _tag: &str) {}
  }

  impl ClientSurface for FakeSurface {
    fn focus_or_open(&self, origin: &str) {
      self.focused.lock().unwrap().push(origin.to_string());
    }
  }

  fn config(version: &str, skip_waiting: bool) -> Config {
    serde_yaml::from_str(&format!(
      r#"
app:
  base_url: "https://tracker.example/"
  assets:
    - "index.html"
    - "app.js"
cache:
  version: "{version}"
skip_waiting: {skip_waiting}
"#
    ))
    .unwrap()
  }

  fn full_transport() -> FakeTransport {
    FakeTransport::serving(&[
      ("https://tracker.example/index.html", "<html>app</html>"),
      ("https://tracker.example/app.js", "console.log('app')"),
    ])
  }

  fn agent(
    version: &str,
    skip_waiting: bool,
    store: CacheStore,
    transport: FakeTransport,
    surface: &FakeSurface,
  ) -> Agent<FakeTransport, FakeSurface, FakeSurface> {
    Agent::new(
      &config(version, skip_waiting),
      store,
      transport,
      surface.clone(),
      surface.clone(),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_install_with_skip_waiting_activates_and_evicts() {
    let store = CacheStore::open_in_memory("v0").unwrap();
    let stale = RequestKey::get("https://tracker.example/old-asset").unwrap();
    store
      .put(
        &stale,
        &CachedResponse {
          status: 200,
          content_type: None,
          headers: Vec::new(),
          body: b"old".to_vec(),
        },
      )
      .unwrap();

    let store = store.with_generation("v1");
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);

    agent.install().await.unwrap();

    assert_eq!(agent.state(), LifecycleState::Active);
    assert_eq!(agent.store.current_generation().unwrap(), Some("v1".to_string()));
    assert_eq!(agent.store.generations().unwrap(), vec!["v1".to_string()]);
  }

  #[tokio::test]
  async fn test_install_without_skip_waiting_parks_until_activate() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", false, store, full_transport(), &surface);

    agent.install().await.unwrap();
    assert_eq!(agent.state(), LifecycleState::Waiting);
    assert_eq!(agent.store.current_generation().unwrap(), None);

    agent.handle_event(AgentEvent::Activate).await;
    assert_eq!(agent.state(), LifecycleState::Active);
    assert_eq!(agent.store.current_generation().unwrap(), Some("v1".to_string()));
  }

  #[tokio::test]
  async fn test_failed_install_with_no_fallback_is_fatal() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    // Transport is missing app.js
    let transport =
      FakeTransport::serving(&[("https://tracker.example/index.html", "<html>app</html>")]);
    let mut agent = agent("v1", true, store, transport, &surface);

    assert!(agent.install().await.is_err());
    assert_eq!(agent.state(), LifecycleState::Installing);
    assert_eq!(agent.store.current_generation().unwrap(), None);
  }

  #[tokio::test]
  async fn test_failed_install_falls_back_to_committed_generation() {
    // v1 installed and committed earlier
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");
    {
      let store = CacheStore::open_at(&db, "v1").unwrap();
      let key = RequestKey::get("https://tracker.example/index.html").unwrap();
      store
        .put(
          &key,
          &CachedResponse {
            status: 200,
            content_type: None,
            headers: Vec::new(),
            body: b"v1 shell".to_vec(),
          },
        )
        .unwrap();
      store.commit_cutover().unwrap();
    }

    // v2 install cannot fetch anything
    let store = CacheStore::open_at(&db, "v2").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v2", true, store, FakeTransport::default(), &surface);

    agent.install().await.unwrap();

    assert_eq!(agent.state(), LifecycleState::Active);
    assert_eq!(agent.store.generation(), "v1");
    // v1 entries still serve
    let key = RequestKey::get("https://tracker.example/index.html").unwrap();
    assert!(agent.store.lookup(&key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_reinstall_of_committed_generation_keeps_serving() {
    // v1 was installed and committed on an earlier run
    let store = CacheStore::open_in_memory("v1").unwrap();
    let key = RequestKey::get("https://tracker.example/index.html").unwrap();
    store
      .put(
        &key,
        &CachedResponse {
          status: 200,
          content_type: None,
          headers: Vec::new(),
          body: b"v1 shell".to_vec(),
        },
      )
      .unwrap();
    store.commit_cutover().unwrap();

    // This run re-installs v1 but cannot fetch anything
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, FakeTransport::default(), &surface);

    agent.install().await.unwrap();

    assert_eq!(agent.state(), LifecycleState::Active);
    assert_eq!(agent.store.generation(), "v1");
    assert!(agent.store.lookup(&key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_fetch_event_routes_and_responds() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    let key = RequestKey::get("https://tracker.example/app.js").unwrap();
    let (respond, rx) = oneshot::channel();
    agent
      .handle_event(AgentEvent::Fetch {
        request: FetchRequest::asset(key),
        respond,
      })
      .await;

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.body_text(), "console.log('app')");
  }

  #[tokio::test]
  async fn test_abandoned_fetch_does_not_corrupt_the_cache() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let transport = FakeTransport::serving(&[
      ("https://tracker.example/index.html", "<html>app</html>"),
      ("https://tracker.example/app.js", "console.log('app')"),
      ("https://tracker.example/late.js", "late body"),
    ]);
    let mut agent = agent("v1", true, store, transport, &surface);
    agent.install().await.unwrap();

    let key = RequestKey::get("https://tracker.example/late.js").unwrap();
    let (respond, rx) = oneshot::channel();
    drop(rx); // client navigated away

    agent
      .handle_event(AgentEvent::Fetch {
        request: FetchRequest::asset(key.clone()),
        respond,
      })
      .await;

    // The write-back still landed and is valid
    let entry = agent.store.lookup(&key).unwrap().unwrap();
    assert_eq!(entry.response.body_text(), "late body");
  }

  #[tokio::test]
  async fn test_run_check_evaluates_snapshot_and_notifies() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    // Snapshot with one long-overdue record, as the main app would publish it
    let snapshot = serde_json::json!([{
      "id": "kitchen",
      "name": "Kitchen filter",
      "lastReplaced": "2020-01-01T00:00:00Z",
      "intervalMonths": 3
    }]);
    agent
      .store
      .put(
        &agent.snapshot_key.clone(),
        &CachedResponse {
          status: 200,
          content_type: Some("application/json".to_string()),
          headers: Vec::new(),
          body: serde_json::to_vec(&snapshot).unwrap(),
        },
      )
      .unwrap();

    agent
      .handle_event(AgentEvent::Message(
        serde_json::json!({ "action": "run-check" }),
      ))
      .await;

    let shown = surface.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].severity, crate::notify::Severity::Overdue);
    assert!(shown[0].body.contains("overdue"));
  }

  #[tokio::test]
  async fn test_missing_snapshot_degrades_to_zero_events() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    agent
      .handle_event(AgentEvent::Message(
        serde_json::json!({ "action": "run-check" }),
      ))
      .await;

    assert!(surface.shown.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unrecognized_message_is_ignored() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    agent
      .handle_event(AgentEvent::Message(
        serde_json::json!({ "action": "reticulate-splines" }),
      ))
      .await;
    agent
      .handle_event(AgentEvent::Message(serde_json::json!("not an object")))
      .await;

    assert!(surface.shown.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_adhoc_notify_message_shows_notification() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    agent
      .handle_event(AgentEvent::Message(serde_json::json!({
        "action": "notify",
        "title": "Heads up",
        "body": "Snapshot refreshed"
      })))
      .await;

    let shown = surface.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "Heads up");
  }

  #[tokio::test]
  async fn test_notification_click_focuses_app_origin() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", true, store, full_transport(), &surface);
    agent.install().await.unwrap();

    agent
      .handle_event(AgentEvent::NotificationClick {
        tag: "kitchen:overdue:2024-04-03".to_string(),
      })
      .await;

    assert_eq!(
      *surface.focused.lock().unwrap(),
      vec!["https://tracker.example/".to_string()]
    );
  }

  #[tokio::test]
  async fn test_run_check_before_activation_is_ignored() {
    let store = CacheStore::open_in_memory("v1").unwrap();
    let surface = FakeSurface::default();
    let mut agent = agent("v1", false, store, full_transport(), &surface);
    agent.install().await.unwrap();
    assert_eq!(agent.state(), LifecycleState::Waiting);

    agent
      .handle_event(AgentEvent::Message(
        serde_json::json!({ "action": "run-check" }),
      ))
      .await;

    assert!(surface.shown.lock().unwrap().is_empty());
  }
}
