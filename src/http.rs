use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::error::SyncError;

pub const CONTENT_ATTEMPTS: u32 = 10;
pub const TOKEN_ATTEMPTS: u32 = 5;

const SLEEP_SLICE: Duration = Duration::from_millis(200);
const COPY_CHUNK: usize = 64 * 1024;

/// Attempt bound and timeout growth for one class of request.
///
/// Attempt `n` (counted from zero) gets a timeout of `(n + 5)^2 + 20` units, and a
/// non-2xx answer is followed by a pause of the same length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl RequestPolicy {
    pub const fn content() -> Self {
        Self {
            max_attempts: CONTENT_ATTEMPTS,
            unit: Duration::from_secs(1),
        }
    }

    pub const fn token() -> Self {
        Self {
            max_attempts: TOKEN_ATTEMPTS,
            unit: Duration::from_secs(1),
        }
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn timeout(&self, attempt: u32) -> Duration {
        let steps = (attempt + 5).pow(2) + 20;
        self.unit * steps
    }
}

/// Shared interrupt flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early with `Cancelled` once the flag is set.
    pub fn sleep(&self, duration: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Streams `reader` into `writer` chunk by chunk, checking the flag between reads.
    /// Read errors are transport failures; write errors are local.
    pub fn copy<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<u64, SyncError> {
        let mut buffer = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            self.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(0) => return Ok(total),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SyncError::Http(format!("reading response body: {err}"))),
            };
            writer
                .write_all(&buffer[..read])
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            total += read as u64;
        }
    }
}

pub fn build_client() -> Result<Client, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("archive-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::Http(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|err| SyncError::Http(err.to_string()))
}

#[derive(Clone)]
pub struct RetryingHttp {
    client: Client,
    cancel: CancelToken,
}

impl RetryingHttp {
    pub fn new(client: Client, cancel: CancelToken) -> Self {
        Self { client, cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Sends the request built by `make_req` until it answers 2xx or `policy` is spent.
    pub fn send<F>(
        &self,
        url: &str,
        policy: RequestPolicy,
        mut make_req: F,
    ) -> Result<Response, SyncError>
    where
        F: FnMut(&Client) -> RequestBuilder,
    {
        for attempt in 0..policy.max_attempts {
            self.cancel.check()?;
            let timeout = policy.timeout(attempt);
            match make_req(&self.client).timeout(timeout).send() {
                Ok(response) if response.status().is_success() => {
                    debug!(url, attempt, "request succeeded");
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(
                        url,
                        status = response.status().as_u16(),
                        wait_secs = timeout.as_secs(),
                        "request failed, waiting before retry"
                    );
                    self.cancel.sleep(timeout)?;
                }
                Err(err) => {
                    warn!(
                        url,
                        timeout_secs = timeout.as_secs(),
                        error = %err,
                        "request failed, retrying"
                    );
                }
            }
        }
        Err(SyncError::RequestExhausted {
            url: url.to_string(),
            attempts: policy.max_attempts,
        })
    }
}
