//! Normalized request identity used as the cache key.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Identity of a cacheable request: method plus normalized URL.
///
/// Two requests that differ only in URL fragment (or method casing) map to the
/// same key, matching how the cache is warmed and looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  /// Build a key from a method and URL string, normalizing both.
  pub fn new(method: &str, url: &str) -> Result<Self> {
    let mut url = Url::parse(url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
    // Fragments never reach the server and must not split cache entries
    url.set_fragment(None);

    Ok(Self {
      method: method.to_uppercase(),
      url,
    })
  }

  /// Convenience constructor for GET requests (the common case for assets).
  pub fn get(url: &str) -> Result<Self> {
    Self::new("GET", url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
  }

  /// Human-readable form for logging.
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}
