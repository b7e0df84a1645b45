//! RPC client: one logical connection to a coordinator or shuffle server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{Request, RequestId, RequestPayload, Response, WireError, codec};

/// Base delay for the first retry backoff step.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// A client for one remote endpoint.
///
/// The underlying TCP connection is established lazily, reused across
/// calls, and dropped on any transport fault so the next call dials
/// fresh. Calls are serialized per client; callers that want parallel
/// fan-out hold one `RpcClient` per target.
#[derive(Debug)]
pub struct RpcClient {
    addr: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: Mutex<Option<TcpStream>>,
}

impl RpcClient {
    /// Creates a client for `addr` with a per-call deadline.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    /// Returns the remote address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Performs one request/response exchange under the per-call deadline.
    ///
    /// Transport faults tear down the cached connection; the next call
    /// reconnects.
    pub async fn call(&self, payload: RequestPayload) -> Result<Response, WireError> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Request::new(id, payload);

        let mut guard = self.conn.lock().await;
        let result = tokio::time::timeout(self.timeout, Self::exchange(&mut guard, &self.addr, &request)).await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                *guard = None;
                return Err(e);
            }
            Err(_) => {
                // The stream may be mid-frame; it cannot be reused.
                *guard = None;
                return Err(WireError::Timeout(self.timeout));
            }
        };

        if response.id != id {
            *guard = None;
            return Err(WireError::IdMismatch {
                expected: id.0,
                got: response.id.0,
            });
        }
        Ok(response)
    }

    async fn exchange(
        conn: &mut Option<TcpStream>,
        addr: &str,
        request: &Request,
    ) -> Result<Response, WireError> {
        if conn.is_none() {
            *conn = Some(TcpStream::connect(addr).await?);
        }
        let stream = conn.as_mut().expect("connection established above");
        codec::write_frame(stream, request).await?;
        codec::read_frame(stream).await
    }

    /// Calls with retries on transport faults and retryable status codes.
    ///
    /// Retries up to `retry_max` additional attempts with jittered
    /// exponential backoff capped at `retry_interval_max`. A response with
    /// a non-retryable status is returned to the caller as-is; retry
    /// exhaustion on transport faults yields
    /// [`WireError::RetriesExhausted`].
    pub async fn call_with_retry(
        &self,
        payload: RequestPayload,
        retry_max: u32,
        retry_interval_max: Duration,
    ) -> Result<Response, WireError> {
        let mut last_err: Option<WireError> = None;

        for attempt in 0..=retry_max {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt, retry_interval_max)).await;
            }

            match self.call(payload.clone()).await {
                Ok(response) if response.status.is_retryable() && attempt < retry_max => {
                    tracing::debug!(
                        addr = %self.addr,
                        status = %response.status,
                        attempt = attempt,
                        "retryable status, backing off"
                    );
                    last_err = None;
                    continue;
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        addr = %self.addr,
                        error = %e,
                        attempt = attempt,
                        "transport fault, will retry"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(WireError::RetriesExhausted {
            addr: self.addr.clone(),
            attempts: retry_max + 1,
            last: Box::new(last_err.unwrap_or(WireError::ConnectionClosed)),
        })
    }
}

/// Exponential backoff with ±50% jitter, capped at `max`.
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1 << attempt.min(16));
    let capped = exp.min(max);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let max = Duration::from_millis(200);
        for attempt in 1..20 {
            assert!(backoff_delay(attempt, max) <= max);
        }
    }

    #[test]
    fn backoff_grows_before_cap() {
        let max = Duration::from_secs(60);
        // With jitter in [0.5, 1.5), attempt 6 (3.2s base) always exceeds
        // attempt 1's upper bound (150ms).
        assert!(backoff_delay(6, max) > backoff_delay(1, max));
    }
}
