//! Network transport seam.

use color_eyre::{eyre::eyre, Result};

use crate::cache::{CachedResponse, RequestKey};

/// Network backend for the router and the installer.
///
/// Implemented by the HTTP client in production and by in-memory fakes in
/// tests. No timeout is imposed here; the underlying client's deadline
/// applies.
pub trait Transport: Send + Sync {
  fn fetch(
    &self,
    key: &RequestKey,
  ) -> impl std::future::Future<Output = Result<CachedResponse>> + Send;
}

/// Transport backed by an HTTP client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  async fn fetch(&self, key: &RequestKey) -> Result<CachedResponse> {
    let method = reqwest::Method::from_bytes(key.method().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", key.method(), e))?;

    let response = self
      .client
      .request(method, key.url().clone())
      .send()
      .await
      .map_err(|e| eyre!("Request {} failed: {}", key.description(), e))?;

    let status = response.status().as_u16();

    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", key.description(), e))?
      .to_vec();

    Ok(CachedResponse {
      status,
      content_type,
      headers,
      body,
    })
  }
}
