// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed client for the control plane agent API.
//!
//! All calls go through the retrying transport ([`retry`]) and are gated by a
//! shared circuit breaker ([`breaker`]). GET responses are unwrapped from the
//! control plane's `{code, message, data}` envelope.

pub mod breaker;
pub mod retry;
pub mod types;

use breaker::CircuitBreaker;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use retry::{RetryConfig, RetryingClient};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use types::*;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Rejected(#[from] breaker::Rejection),

    #[error("control plane unavailable: {0}")]
    Unavailable(#[from] retry::Error),

    #[error("control plane returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to decode control plane response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("failed to build request: {0}")]
    Request(#[source] reqwest::Error),
}

pub struct CpClient {
    base: String,
    router: String,
    token: String,
    transport: RetryingClient,
    breaker: Arc<CircuitBreaker>,
}

impl CpClient {
    pub fn new(
        base: &str,
        router: &str,
        token: &str,
        request_timeout: Duration,
        retry: RetryConfig,
        breaker: Arc<CircuitBreaker>,
        log: Logger,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::Request)?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            router: router.to_string(),
            token: token.to_string(),
            transport: RetryingClient::new(client, retry, log),
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/agent/{}/{}", self.base, self.router, tail)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        tail: &str,
        cancel: &CancellationToken,
    ) -> Result<T, Error> {
        self.breaker.allow()?;
        let req = self
            .transport
            .inner()
            .get(self.url(tail))
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .build()
            .map_err(Error::Request)?;
        let resp = match self.transport.execute(req, cancel).await {
            Ok(resp) => resp,
            Err(e) => {
                self.breaker.record_failure();
                return Err(e.into());
            }
        };
        let status = resp.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }
        match resp.json::<Envelope<T>>().await {
            Ok(envelope) => {
                self.breaker.record_success();
                Ok(envelope.data)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(Error::Decode(e))
            }
        }
    }

    async fn post_json<B: Serialize>(
        &self,
        tail: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.breaker.allow()?;
        let req = self
            .transport
            .inner()
            .post(self.url(tail))
            .bearer_auth(&self.token)
            .json(body)
            .build()
            .map_err(Error::Request)?;
        let resp = match self.transport.execute(req, cancel).await {
            Ok(resp) => resp,
            Err(e) => {
                self.breaker.record_failure();
                return Err(e.into());
            }
        };
        let status = resp.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }
        self.breaker.record_success();
        // Drain so the connection can be reused.
        let _ = resp.bytes().await;
        Ok(())
    }

    /// `GET /agent/{router}/sessions`
    pub async fn fetch_sessions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<PeeringSession>, Error> {
        let data: SessionsData = self.get_json("sessions", cancel).await?;
        Ok(data.bgp_sessions)
    }

    /// `GET /agent/{router}/bird-config`
    pub async fn fetch_bird_config(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BirdConfigBundle, Error> {
        self.get_json("bird-config", cancel).await
    }

    /// `GET /agent/{router}/mesh`
    pub async fn fetch_mesh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MeshConfig, Error> {
        self.get_json("mesh", cancel).await
    }

    /// `POST /agent/{router}/modify` — report a session status change.
    pub async fn report_modify(
        &self,
        peer_id: Uuid,
        status: &str,
        last_error: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let body = ModifyRequest {
            peer_id,
            status: status.to_string(),
            last_error: last_error.map(str::to_string),
        };
        self.post_json("modify", &body, cancel).await
    }

    /// `POST /agent/{router}/heartbeat`
    pub async fn send_heartbeat(
        &self,
        report: &HeartbeatReport,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.post_json("heartbeat", report, cancel).await
    }

    /// `POST /agent/{router}/report`
    pub async fn send_bgp_report(
        &self,
        report: &BgpStateReport,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.post_json("report", report, cancel).await
    }

    /// `POST /agent/{router}/rtt`
    pub async fn send_rtt(
        &self,
        report: &RttReport,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.post_json("rtt", report, cancel).await
    }

    /// `POST /agent/{router}/mesh/status`
    pub async fn send_mesh_status(
        &self,
        report: &MeshStatusReport,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.post_json("mesh/status", report, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breaker::BreakerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client_for(base: &str, breaker: Arc<CircuitBreaker>) -> CpClient {
        CpClient::new(
            base,
            "nue1",
            "secret",
            Duration::from_secs(2),
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            breaker,
            wren_common::log::build_logger(std::io::sink()),
        )
        .unwrap()
    }

    async fn one_shot_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_sessions_unwraps_envelope() {
        let base = one_shot_server(
            r#"{"code":0,"message":"ok","data":{"bgpSessions":[{
                "uuid":"b4b2d3a0-6a0f-4f3e-9f6a-5b1d2c3e4f50",
                "asn":4242420123,"status":2,"type":"wireguard"}]}}"#,
        )
        .await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let client = client_for(&base, breaker.clone());
        let sessions = client
            .fetch_sessions(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].asn, 4242420123);
        assert_eq!(breaker.state(), breaker::State::Closed);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_network() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            open_duration: Duration::from_secs(3600),
            ..BreakerConfig::default()
        }));
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Point at a closed port; the breaker must reject before dialing.
        let client = client_for("http://127.0.0.1:9", breaker);
        let err = client
            .fetch_sessions(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected(breaker::Rejection::CircuitOpen)
        ));
    }
}
