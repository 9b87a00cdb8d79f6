use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::{HeaderMap, ACCEPT, CACHE_CONTROL};
use http::{Method, StatusCode};
use http_cache_semantics::{AfterResponse, BeforeRequest, CachePolicy};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::file_store::FileStore;

/// Read timeout applied to every request.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How often a request is attempted before a transient failure becomes an
/// error, and the base delay between attempts.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Caching behavior of a single request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheMode {
    /// Regular HTTP caching semantics.
    Default,
    /// Serve only from the cache; absent entries are an error.
    OnlyIfCached,
    /// Bypass the cache entirely.
    NoStore,
}

/// Error raised by the HTTP layer.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum HttpError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("io error while caching response: {0}")]
    Io(#[from] std::io::Error),

    #[error("request not in cache, and cache_mode=OnlyIfCached: {0}")]
    NotCached(Url),

    #[error("unexpected status {1} for {0}")]
    Status(Url, StatusCode),

    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),
}

/// A fully buffered response.
#[derive(Debug)]
pub struct HttpResponse {
    /// The response status.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The url after redirects.
    pub final_url: Url,
    /// The response body.
    pub body: Vec<u8>,
    /// Whether the body was served from the local cache.
    pub from_cache: bool,
}

impl HttpResponse {
    /// The `Content-Type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    policy: CachePolicy,
    url: Url,
}

/// An HTTP client with an on-disk response cache and bounded retry.
///
/// Transient failures (connect errors, timeouts, 5xx responses) are retried
/// with exponential backoff inside this layer; only a final failure
/// propagates to the repository.
#[derive(Debug, Clone)]
pub struct Http {
    client: reqwest::Client,
    cache: Arc<FileStore>,
}

impl Http {
    /// Creates a client writing cached responses into `cache`.
    pub fn new(client: reqwest::Client, cache: FileStore) -> Self {
        Http {
            client,
            cache: Arc::new(cache),
        }
    }

    /// Performs a request with the given caching semantics.
    pub async fn request(
        &self,
        url: Url,
        method: Method,
        headers: HeaderMap,
        cache_mode: CacheMode,
    ) -> Result<HttpResponse, HttpError> {
        tracing::debug!(url=%url, ?cache_mode, "executing request");

        if cache_mode == CacheMode::NoStore {
            let response = self.execute_with_retry(&url, &method, &headers).await?;
            return buffer_response(response).await;
        }

        let key = request_cache_key(&url, &method, &headers);
        let cached = self
            .cache
            .get(&key)
            .and_then(|mut file| read_cache_entry(&mut file).ok());

        let Some((envelope, cached_body)) = cached else {
            if cache_mode == CacheMode::OnlyIfCached {
                return Err(HttpError::NotCached(url));
            }
            let request = self.build_request(&url, &method, &headers)?;
            let response = self.execute_with_retry(&url, &method, &headers).await?;
            let parts = response_parts(&response);
            let policy = CachePolicy::new(&request, &parts);
            let mut buffered = buffer_response(response).await?;
            if policy.is_storable() {
                self.store(&key, &policy, &buffered)?;
            }
            buffered.from_cache = false;
            return Ok(buffered);
        };

        let request = self.build_request(&url, &method, &headers)?;
        match envelope.policy.before_request(&request, SystemTime::now()) {
            BeforeRequest::Fresh(parts) => {
                tracing::debug!(url=%url, "cache entry is fresh");
                Ok(HttpResponse {
                    status: parts.status,
                    headers: parts.headers,
                    final_url: envelope.url,
                    body: cached_body,
                    from_cache: true,
                })
            }
            BeforeRequest::Stale {
                request: new_parts, ..
            } => {
                if cache_mode == CacheMode::OnlyIfCached {
                    return Err(HttpError::NotCached(url));
                }

                // Revalidate with the conditional headers the policy built.
                let mut revalidation_headers = headers.clone();
                for (name, value) in new_parts.headers.iter() {
                    revalidation_headers.insert(name.clone(), value.clone());
                }
                let request = self.build_request(&url, &method, &revalidation_headers)?;
                let response = self
                    .execute_with_retry(&url, &method, &revalidation_headers)
                    .await?;
                let final_url = Url::parse(response.url().as_str()).expect("response url is valid");

                match envelope
                    .policy
                    .after_response(&request, &response, SystemTime::now())
                {
                    AfterResponse::NotModified(new_policy, parts) => {
                        tracing::debug!(url=%url, "cache entry revalidated");
                        let refreshed = HttpResponse {
                            status: parts.status,
                            headers: parts.headers,
                            final_url,
                            body: cached_body,
                            from_cache: true,
                        };
                        self.store(&key, &new_policy, &refreshed)?;
                        Ok(refreshed)
                    }
                    AfterResponse::Modified(new_policy, _) => {
                        tracing::debug!(url=%url, "cache entry changed upstream");
                        let mut buffered = buffer_response(response).await?;
                        if new_policy.is_storable() {
                            self.store(&key, &new_policy, &buffered)?;
                        } else if let Some(lock) = self.cache.lock_if_exists(&key) {
                            lock.remove()?;
                        }
                        buffered.from_cache = false;
                        Ok(buffered)
                    }
                }
            }
        }
    }

    fn build_request(
        &self,
        url: &Url,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<reqwest::Request, HttpError> {
        Ok(self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .timeout(READ_TIMEOUT)
            .build()?)
    }

    /// Executes a request, retrying transient failures with exponential
    /// backoff.
    async fn execute_with_retry(
        &self,
        url: &Url,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<reqwest::Response, HttpError> {
        let mut attempt = 0;
        loop {
            let request = self.build_request(url, method, headers)?;
            let result = self.client.execute(request).await;
            let retriable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            };
            attempt += 1;
            if !retriable || attempt >= RETRY_ATTEMPTS {
                return Ok(result?);
            }
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            tracing::warn!(url=%url, attempt, "transient http failure, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    fn store(
        &self,
        key: &std::path::Path,
        policy: &CachePolicy,
        response: &HttpResponse,
    ) -> Result<(), HttpError> {
        let envelope = CacheEnvelope {
            policy: policy.clone(),
            url: response.final_url.clone(),
        };
        let header =
            serde_json::to_vec(&envelope).map_err(|e| HttpError::InvalidCacheEntry(e.to_string()))?;
        let lock = self.cache.lock(key)?;
        let mut writer = lock.begin()?;
        use std::io::Write;
        writer.write_all(&header)?;
        writer.write_all(b"\n")?;
        writer.write_all(&response.body)?;
        writer.commit()?;
        Ok(())
    }
}

/// Cache key: method, url without fragment, and the headers that change what
/// the server returns.
fn request_cache_key(url: &Url, method: &Method, headers: &HeaderMap) -> std::path::PathBuf {
    let mut material = Vec::new();
    material.extend_from_slice(method.as_str().as_bytes());
    material.push(0);

    let mut url = url.clone();
    url.set_fragment(None);
    material.extend_from_slice(url.as_str().as_bytes());

    for header_name in [ACCEPT, CACHE_CONTROL] {
        if let Some(value) = headers.get(&header_name) {
            material.push(0);
            material.extend_from_slice(header_name.as_str().as_bytes());
            material.push(0);
            material.extend_from_slice(value.as_bytes());
        }
    }
    FileStore::key_for_bytes(&material)
}

fn read_cache_entry(file: &mut std::fs::File) -> Result<(CacheEnvelope, Vec<u8>), HttpError> {
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let split = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| HttpError::InvalidCacheEntry("missing envelope delimiter".into()))?;
    let envelope: CacheEnvelope = serde_json::from_slice(&raw[..split])
        .map_err(|e| HttpError::InvalidCacheEntry(e.to_string()))?;
    Ok((envelope, raw[split + 1..].to_vec()))
}

/// A headers-only `http::Response` for feeding `CachePolicy::new`.
fn response_parts(response: &reqwest::Response) -> http::Response<()> {
    let mut builder = http::Response::builder()
        .status(response.status())
        .version(response.version());
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers().clone();
    }
    builder.body(()).expect("a headers-only response is valid")
}

async fn buffer_response(response: reqwest::Response) -> Result<HttpResponse, HttpError> {
    let status = response.status();
    let headers = response.headers().clone();
    let final_url = Url::parse(response.url().as_str()).expect("response url is valid");
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        status,
        headers,
        final_url,
        body,
        from_cache: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_ignore_fragments() {
        let headers = HeaderMap::new();
        let a = request_cache_key(
            &Url::parse("https://example.com/x#sha256=abc").unwrap(),
            &Method::GET,
            &headers,
        );
        let b = request_cache_key(
            &Url::parse("https://example.com/x").unwrap(),
            &Method::GET,
            &headers,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn cache_keys_differ_by_accept_header() {
        let plain = HeaderMap::new();
        let mut json = HeaderMap::new();
        json.insert(ACCEPT, "application/vnd.pypi.simple.v1+json".parse().unwrap());
        let url = Url::parse("https://example.com/simple/demo/").unwrap();
        assert_ne!(
            request_cache_key(&url, &Method::GET, &plain),
            request_cache_key(&url, &Method::GET, &json)
        );
    }
}
