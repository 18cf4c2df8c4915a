//! Request routing: cache-first vs network-first per request class.

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};

use crate::cache::{CacheStore, CachedResponse, RequestKey};

use super::transport::Transport;

/// An inbound request to route.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub key: RequestKey,
  /// Accept header advertised by the client, if any
  pub accept: Option<String>,
  /// True for a top-level document load
  pub navigation: bool,
}

impl FetchRequest {
  pub fn navigation(key: RequestKey) -> Self {
    Self {
      key,
      accept: Some("text/html".to_string()),
      navigation: true,
    }
  }

  pub fn asset(key: RequestKey) -> Self {
    Self {
      key,
      accept: None,
      navigation: false,
    }
  }

  fn is_document(&self) -> bool {
    self.navigation
      || self
        .accept
        .as_deref()
        .is_some_and(|a| a.contains("text/html"))
  }
}

/// Routes requests between the cache and the network.
///
/// Documents are network-first so the user always sees the freshest page when
/// online; everything else is cache-first. Both paths write successful network
/// responses back into the store, warming the cache as a byproduct of use.
pub struct FetchRouter<T: Transport> {
  transport: T,
  /// Cached document served when a navigation has no network and no cached copy
  offline_document: RequestKey,
}

impl<T: Transport> FetchRouter<T> {
  pub fn new(transport: T, offline_document: RequestKey) -> Self {
    Self {
      transport,
      offline_document,
    }
  }

  /// Route one request against the given generation of the cache.
  pub async fn route(&self, store: &CacheStore, request: &FetchRequest) -> Result<CachedResponse> {
    if request.is_document() {
      self.network_first(store, request).await
    } else {
      self.cache_first(store, request).await
    }
  }

  /// Network-first: fresh page when online, cached copy when not, offline
  /// document as the last resort.
  async fn network_first(
    &self,
    store: &CacheStore,
    request: &FetchRequest,
  ) -> Result<CachedResponse> {
    match self.transport.fetch(&request.key).await {
      Ok(response) => {
        if response.is_success() {
          self.write_back(store, &request.key, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(
          request = %request.key.description(),
          "Network failed for document, falling back to cache: {e}"
        );

        if let Some(entry) = store.lookup(&request.key)? {
          debug!(
            request = %request.key.description(),
            fetched_at = %entry.fetched_at,
            "Serving cached document"
          );
          return Ok(entry.response);
        }

        if let Some(entry) = store.lookup(&self.offline_document)? {
          return Ok(entry.response);
        }

        Err(eyre!(
          "Document {} unavailable: network failed and no cached copy or offline document",
          request.key.description()
        ))
      }
    }
  }

  /// Cache-first: immediate hit if cached, otherwise fetch and fill.
  async fn cache_first(
    &self,
    store: &CacheStore,
    request: &FetchRequest,
  ) -> Result<CachedResponse> {
    if let Some(entry) = store.lookup(&request.key)? {
      return Ok(entry.response);
    }

    let response = self
      .transport
      .fetch(&request.key)
      .await
      .map_err(|e| eyre!("Asset {} uncached and unreachable: {}", request.key.description(), e))?;

    if response.is_success() {
      self.write_back(store, &request.key, &response);
    }

    Ok(response)
  }

  /// A write-back failure must not fail a request that already has a response.
  fn write_back(&self, store: &CacheStore, key: &RequestKey, response: &CachedResponse) {
    if let Err(e) = store.put(key, response) {
      warn!(request = %key.description(), "Cache write-back failed: {e}");
    }
  }
}
