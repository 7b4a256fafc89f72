// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local HTTP API: status, manual sync, metrics, maintenance toggles and
//! the peer restart surface. Diagnostic tools live in [`crate::tools`].

use crate::error::Error;
use crate::log::inf;
use crate::maintenance::MaintenanceState;
use crate::metrics::Metrics;
use crate::tools;
use bird::Pool;
use cp_client::breaker::CircuitBreaker;
use dropshot::{
    endpoint, ApiDescription, Body, ConfigDropshot, HttpError, HttpResponseOk,
    HttpServer, HttpServerStarter, RequestContext, TypedBody,
};
use netsys::wireguard::WgExecutor;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{o, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

const UNIT: &str = "admin";

pub struct HandlerContext {
    pub version: String,
    pub start: Instant,
    pub maintenance: Arc<MaintenanceState>,
    pub metrics: Arc<Metrics>,
    pub breaker: Arc<CircuitBreaker>,
    pub sync_nudge: Arc<Notify>,
    pub pool: Arc<Pool>,
    pub wg: Arc<WgExecutor>,
    pub api_token: String,
    pub log: Logger,
}

#[macro_export]
macro_rules! register {
    ($api:expr, $endpoint:expr) => {
        $api.register($endpoint).expect(stringify!($endpoint))
    };
}

pub fn start_server(
    log: &Logger,
    listen: SocketAddr,
    context: Arc<HandlerContext>,
) -> Result<HttpServer<Arc<HandlerContext>>, String> {
    let ds_config = ConfigDropshot {
        bind_address: listen,
        ..Default::default()
    };
    let ds_log = log.new(o!("unit" => "api-server"));

    let mut api = ApiDescription::new();
    register!(api, get_status);
    register!(api, trigger_sync);
    register!(api, get_metrics);
    register!(api, get_maintenance);
    register!(api, maintenance_start);
    register!(api, maintenance_stop);
    register!(api, restart_peer);
    tools::api_description(&mut api);

    let server = HttpServerStarter::new(&ds_config, api, context, &ds_log)
        .map_err(|e| format!("create admin server: {e}"))?
        .start();
    inf!(log, UNIT, "listening on {listen}");
    Ok(server)
}

#[derive(Serialize, JsonSchema)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_s: u64,
    pub maintenance_mode: bool,
}

#[endpoint { method = GET, path = "/status" }]
async fn get_status(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<StatusResponse>, HttpError> {
    let ctx = rqctx.context();
    Ok(HttpResponseOk(StatusResponse {
        status: "ok".to_string(),
        version: ctx.version.clone(),
        uptime_s: ctx.start.elapsed().as_secs(),
        maintenance_mode: ctx.maintenance.is_enabled().await,
    }))
}

#[derive(Serialize, JsonSchema)]
pub struct SyncResponse {
    pub status: String,
}

/// Nudge the session-sync task to run an iteration right away.
#[endpoint { method = GET, path = "/sync" }]
async fn trigger_sync(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<SyncResponse>, HttpError> {
    let ctx = rqctx.context();
    ctx.sync_nudge.notify_one();
    Ok(HttpResponseOk(SyncResponse {
        status: "sync_triggered".to_string(),
    }))
}

#[endpoint { method = GET, path = "/metrics" }]
async fn get_metrics(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<http::Response<Body>, HttpError> {
    let ctx = rqctx.context();
    let text = ctx.metrics.render(&ctx.version, ctx.breaker.state());
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(
            http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )
        .body(text.into())
        .map_err(|e| HttpError::for_internal_error(e.to_string()))
}

#[derive(Serialize, JsonSchema)]
pub struct MaintenanceResponse {
    pub maintenance_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[endpoint { method = GET, path = "/maintenance" }]
async fn get_maintenance(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<MaintenanceResponse>, HttpError> {
    let ctx = rqctx.context();
    Ok(HttpResponseOk(MaintenanceResponse {
        maintenance_mode: ctx.maintenance.is_enabled().await,
        entered_at: ctx.maintenance.entered_at().await.map(|t| t.to_rfc3339()),
        message: None,
    }))
}

#[endpoint { method = POST, path = "/maintenance/start" }]
async fn maintenance_start(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<MaintenanceResponse>, HttpError> {
    let ctx = rqctx.context();
    ctx.maintenance
        .enter()
        .await
        .map_err(|e| HttpError::from(Error::Internal(e)))?;
    Ok(HttpResponseOk(MaintenanceResponse {
        maintenance_mode: true,
        entered_at: ctx.maintenance.entered_at().await.map(|t| t.to_rfc3339()),
        message: Some(
            "Maintenance mode enabled, eBGP sessions gracefully shutdown"
                .to_string(),
        ),
    }))
}

#[endpoint { method = POST, path = "/maintenance/stop" }]
async fn maintenance_stop(
    rqctx: RequestContext<Arc<HandlerContext>>,
) -> Result<HttpResponseOk<MaintenanceResponse>, HttpError> {
    let ctx = rqctx.context();
    ctx.maintenance
        .exit()
        .await
        .map_err(|e| HttpError::from(Error::Internal(e)))?;
    Ok(HttpResponseOk(MaintenanceResponse {
        maintenance_mode: false,
        entered_at: None,
        message: Some(
            "Maintenance mode disabled, normal routing restored".to_string(),
        ),
    }))
}

#[derive(Deserialize, JsonSchema)]
pub struct RestartRequest {
    /// BIRD protocol name, e.g. `dn42_4242420123`.
    pub peer_name: String,
    /// Only refresh the tunnel, leave BGP alone.
    #[serde(default)]
    pub wg_only: bool,
    /// Only bounce BGP, leave the tunnel alone.
    #[serde(default)]
    pub bgp_only: bool,
}

#[derive(Serialize, JsonSchema)]
pub struct RestartResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

/// Protocol names are interpolated into control-socket commands; anything
/// outside this alphabet could smuggle a second command onto the line.
fn valid_protocol_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[endpoint { method = POST, path = "/restart" }]
async fn restart_peer(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<RestartRequest>,
) -> Result<HttpResponseOk<RestartResponse>, HttpError> {
    let ctx = rqctx.context();
    let request = body.into_inner();
    if !valid_protocol_name(&request.peer_name) {
        return Err(Error::Invalid("peer_name is required".to_string()).into());
    }

    inf!(
        ctx.log,
        UNIT,
        "restarting peer {} (wg_only={}, bgp_only={})",
        request.peer_name,
        request.wg_only,
        request.bgp_only
    );

    let mut steps = Vec::new();
    let mut failure: Option<String> = None;

    if !request.wg_only {
        match ctx
            .pool
            .execute(&format!("disable {}", request.peer_name))
            .await
        {
            Ok(_) => steps.push(format!("BGP disabled: {}", request.peer_name)),
            Err(e) => failure = Some(e.to_string()),
        }
    }

    if !request.bgp_only {
        // The tunnel interface shares the protocol name.
        match ctx.wg.status(&request.peer_name).await {
            Ok(_) => steps
                .push(format!("WireGuard interface checked: {}", request.peer_name)),
            Err(e) => failure = Some(e.to_string()),
        }
    }

    if !request.wg_only {
        match ctx
            .pool
            .execute(&format!("enable {}", request.peer_name))
            .await
        {
            Ok(_) => steps.push(format!("BGP enabled: {}", request.peer_name)),
            Err(e) => failure = Some(e.to_string()),
        }
    }

    match failure {
        Some(reason) => Ok(HttpResponseOk(RestartResponse {
            success: false,
            message: format!("Restart failed: {reason}"),
            steps,
        })),
        None => Ok(HttpResponseOk(RestartResponse {
            success: true,
            message: "Peer restarted successfully".to_string(),
            steps,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_reject_command_smuggling() {
        assert!(valid_protocol_name("dn42_4242420123"));
        assert!(valid_protocol_name("dn42-wg-igp-2"));
        assert!(!valid_protocol_name(""));
        assert!(!valid_protocol_name("dn42_1; configure"));
        assert!(!valid_protocol_name("a\nb"));
    }
}
