// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retrying HTTP transport.
//!
//! Wraps a [`reqwest::Client`] with an exponential-backoff retry loop.
//! Transport errors, 5xx and 429 responses are retried; everything else is
//! returned to the caller as-is. Request bodies must be replayable
//! ([`reqwest::Request::try_clone`]) for retries to be possible.

use rand::Rng;
use reqwest::{Request, Response, StatusCode};
use slog::{warn, Logger};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial request.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay, applied before jitter.
    pub max_delay: Duration,
    /// Factor by which the delay grows per attempt.
    pub multiplier: f64,
    /// Symmetric jitter fraction, 0.1 = +/-10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// The reason the final attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream status {0}")]
    Status(StatusCode),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("retries exhausted after {attempts} attempts: {cause}")]
    RetryExhausted { attempts: u32, cause: Cause },

    #[error("request body cannot be replayed for retry")]
    NonReplayableBody,

    #[error("request cancelled")]
    Cancelled,
}

/// Compute the pre-jitter delay before retry attempt `attempt` (0-based):
/// `min(max_delay, initial * multiplier^attempt)`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = config.initial_delay.as_secs_f64()
        * config.multiplier.powi(attempt as i32);
    let capped = raw.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped)
}

fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let spread = delay.as_secs_f64() * jitter;
    let perturbed = delay.as_secs_f64()
        + rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64(perturbed.max(0.0))
}

fn retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub struct RetryingClient {
    client: reqwest::Client,
    config: RetryConfig,
    log: Logger,
}

impl RetryingClient {
    pub fn new(
        client: reqwest::Client,
        config: RetryConfig,
        log: Logger,
    ) -> Self {
        Self {
            client,
            config,
            log,
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a request, retrying on transport errors, 5xx and 429.
    ///
    /// Returns the first non-retryable response (including 4xx), or
    /// [`Error::RetryExhausted`] with the final cause. A pending backoff wait
    /// aborts promptly when `cancel` fires.
    pub async fn execute(
        &self,
        req: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, Error> {
        let mut original = Some(req);
        let mut last: Option<Cause> = None;

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Rewind: take a fresh copy of the request for this attempt. A
            // non-replayable body can be sent once but never retried.
            let this = match original.as_ref().and_then(|r| r.try_clone()) {
                Some(copy) => copy,
                None => original.take().ok_or(Error::NonReplayableBody)?,
            };

            match self.client.execute(this).await {
                Ok(resp) if !retryable(resp.status()) => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    // Drain the body so the connection returns to the pool.
                    let _ = resp.bytes().await;
                    last = Some(Cause::Status(status));
                }
                Err(e) => last = Some(Cause::Transport(e)),
            }

            if attempt < self.config.max_retries {
                let delay =
                    with_jitter(backoff_delay(&self.config, attempt), self.config.jitter);
                let cause = last
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                warn!(
                    self.log,
                    "request failed, retrying in {:?} ({}/{}): {}",
                    delay,
                    attempt + 1,
                    self.config.max_retries,
                    cause
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        match last {
            Some(cause) => Err(Error::RetryExhausted {
                attempts: self.config.max_retries,
                cause,
            }),
            // Unreachable: the loop body runs at least once.
            None => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn cfg_ms(initial: u64) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(initial),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_sequence_is_exact_without_jitter() {
        let config = cfg_ms(100);
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = RetryConfig {
            max_delay: Duration::from_millis(250),
            ..cfg_ms(100)
        };
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = with_jitter(base, 0.1).as_millis();
            assert!((900..=1100).contains(&d), "delay {d}ms out of bounds");
        }
    }

    /// Serve canned HTTP/1.1 status lines, one connection per entry.
    async fn canned_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for status in statuses {
                let (mut sock, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        (format!("http://{addr}/"), hits)
    }

    fn test_client(initial_ms: u64) -> RetryingClient {
        let log = wren_common::log::build_logger(std::io::sink());
        RetryingClient::new(reqwest::Client::new(), cfg_ms(initial_ms), log)
    }

    #[tokio::test]
    async fn retries_5xx_until_success() {
        let (url, hits) = canned_server(vec![503, 503, 200]).await;
        let client = test_client(1);
        let req = client.inner().get(&url).build().unwrap();
        let resp = client
            .execute(req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let (url, hits) = canned_server(vec![404, 200]).await;
        let client = test_client(1);
        let req = client.inner().get(&url).build().unwrap();
        let resp = client
            .execute(req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_final_status() {
        let (url, hits) = canned_server(vec![503, 503, 503, 503]).await;
        let client = test_client(1);
        let req = client.inner().get(&url).build().unwrap();
        let err = client
            .execute(req, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::RetryExhausted { attempts, cause } => {
                assert_eq!(attempts, 3);
                assert!(matches!(
                    cause,
                    Cause::Status(StatusCode::SERVICE_UNAVAILABLE)
                ));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_wait() {
        let (url, _hits) = canned_server(vec![503]).await;
        let client = RetryingClient::new(
            reqwest::Client::new(),
            RetryConfig {
                initial_delay: Duration::from_secs(60),
                jitter: 0.0,
                ..RetryConfig::default()
            },
            wren_common::log::build_logger(std::io::sink()),
        );
        let req = client.inner().get(&url).build().unwrap();
        let cancel = CancellationToken::new();
        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            aborter.cancel();
        });
        let err = client.execute(req, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
