// file: src/network/transport.rs
// version: 1.0.0
// guid: cbd8fe9d-a855-4266-831d-2a307228df30

//! HTTP transport used by the image fetcher
//!
//! The fetcher only needs "GET this URL, optionally from byte N" and a body
//! stream. [`HttpTransport`] does that with reqwest; [`MemoryTransport`]
//! serves fixed bodies from memory so fetch logic can be exercised without a
//! network.

use crate::config::Settings;
use crate::error::AutoInstallError;
use crate::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Status line and body of one GET
pub struct RangeResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl RangeResponse {
    /// Drain the body into memory
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
        while let Some(chunk) = self.body.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

/// Source of HTTP responses
pub trait Transport: Send + Sync {
    /// GET `url`; with `range_start` the request asks for `bytes=<start>-`
    fn get<'a>(
        &'a self,
        url: &'a str,
        range_start: Option<u64>,
    ) -> BoxFuture<'a, Result<RangeResponse>>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client honouring the configured timeout and user agent
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.http_timeout())
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get<'a>(
        &'a self,
        url: &'a str,
        range_start: Option<u64>,
    ) -> BoxFuture<'a, Result<RangeResponse>> {
        async move {
            let mut request = self.client.get(url);
            if let Some(start) = range_start {
                request = request.header(reqwest::header::RANGE, format!("bytes={}-", start));
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            let content_length = response.content_length();
            debug!("GET {} (from {:?}) -> {}", url, range_start, status);

            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(AutoInstallError::from))
                .boxed();

            Ok(RangeResponse {
                status,
                content_length,
                body,
            })
        }
        .boxed()
    }
}

/// A request seen by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub range_start: Option<u64>,
}

/// Serves fixed bodies from memory and records every request
#[derive(Debug, Default)]
pub struct MemoryTransport {
    bodies: HashMap<String, Bytes>,
    ignore_ranges: bool,
    chunk_size: usize,
    failures: Mutex<Vec<(String, usize)>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            chunk_size: 4096,
            ..Self::default()
        }
    }

    /// Serve `body` at `url`
    pub fn with_body(mut self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(url.into(), body.into());
        self
    }

    /// Answer every request with the full body and status 200
    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    /// Break the next response for `url` after `after` body bytes
    pub fn fail_once_after(self, url: impl Into<String>, after: usize) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((url.into(), after));
        }
        self
    }

    /// Requests made so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Requests made so far for `url`
    pub fn requests_for(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url == url)
            .collect()
    }

    fn take_failure(&self, url: &str) -> Option<usize> {
        let mut failures = self.failures.lock().ok()?;
        let index = failures.iter().position(|(u, _)| u == url)?;
        Some(failures.remove(index).1)
    }

    fn respond(&self, url: &str, range_start: Option<u64>) -> RangeResponse {
        let Some(full) = self.bodies.get(url) else {
            return empty_response(404);
        };

        let (status, body) = match range_start {
            Some(start) if !self.ignore_ranges => {
                if start >= full.len() as u64 {
                    return empty_response(416);
                }
                (206, full.slice(start as usize..))
            }
            _ => (200, full.clone()),
        };

        let content_length = Some(body.len() as u64);
        let failure = self.take_failure(url);
        let served = match failure {
            Some(after) => body.slice(..after.min(body.len())),
            None => body,
        };

        let step = self.chunk_size.max(1);
        let mut items: Vec<Result<Bytes>> = (0..served.len())
            .step_by(step)
            .map(|offset| Ok(served.slice(offset..(offset + step).min(served.len()))))
            .collect();
        if failure.is_some() {
            items.push(Err(AutoInstallError::network("connection reset by peer")));
        }

        RangeResponse {
            status,
            content_length,
            body: stream::iter(items).boxed(),
        }
    }
}

fn empty_response(status: u16) -> RangeResponse {
    RangeResponse {
        status,
        content_length: Some(0),
        body: stream::empty().boxed(),
    }
}

impl Transport for MemoryTransport {
    fn get<'a>(
        &'a self,
        url: &'a str,
        range_start: Option<u64>,
    ) -> BoxFuture<'a, Result<RangeResponse>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                url: url.to_string(),
                range_start,
            });
        }
        let response = self.respond(url, range_start);
        async move { Ok(response) }.boxed()
    }
}
