// Upstream HTTP access with ordered fallback across sources
use crate::nvt_config::Source;
use crate::nvt_error::{NVTError, Result};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// Something that can fetch the raw payload behind a [`Source`].
pub trait Upstream: Send + Sync + 'static {
    fn fetch(&self, source: &Source) -> impl Future<Output = Result<Bytes>> + Send;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstream {
    /// `timeout` applies to every source that does not set its own.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nvt-live/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NVTError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(HttpUpstream { client, timeout })
    }
}

impl Upstream for HttpUpstream {
    async fn fetch(&self, source: &Source) -> Result<Bytes> {
        let timeout = source.timeout.unwrap_or(self.timeout);
        let unreachable = |e: reqwest::Error| {
            let message = if e.is_timeout() {
                format!("timed out after {:?}", timeout)
            } else {
                // The URL carries the API key.
                e.without_url().to_string()
            };
            NVTError::UpstreamUnreachable {
                upstream: source.name.clone(),
                status: None,
                message,
            }
        };

        let response = self
            .client
            .get(&source.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(NVTError::UpstreamUnreachable {
                upstream: source.name.clone(),
                status: Some(status.as_u16()),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            });
        }

        let body = response.bytes().await.map_err(unreachable)?;
        log::debug!("Fetched {} KB from {}", body.len() / 1024, source.name);
        Ok(body)
    }
}

/// Tries `sources` in order, passing each payload to `accept`, and returns the
/// first accepted value with the name of the source that produced it. On
/// exhaustion every failure is returned, in attempt order.
pub async fn first_success<U, T, F, Fut>(
    upstream: &U,
    sources: &[Source],
    mut accept: F,
) -> std::result::Result<(String, T), Vec<NVTError>>
where
    U: Upstream,
    F: FnMut(&Source, Bytes) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = Vec::with_capacity(sources.len());

    for source in sources {
        let outcome = match upstream.fetch(source).await {
            Ok(body) => accept(source, body).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => return Ok((source.name.clone(), value)),
            Err(e) => {
                log::warn!("Source {} failed: {}", source.name, e);
                failures.push(e);
            }
        }
    }

    Err(failures)
}
