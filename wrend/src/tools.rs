// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bearer-guarded network diagnostic endpoints.
//!
//! Targets are interpolated into external commands and control-socket
//! lines, so input is validated against a conservative alphabet and error
//! messages are sanitized before they leave the process.

use crate::admin::HandlerContext;
use crate::error::Error;
use crate::register;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk, RequestContext,
    TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::warn;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub(crate) fn api_description(api: &mut ApiDescription<Arc<HandlerContext>>) {
    register!(api, tool_ping);
    register!(api, tool_tcping);
    register!(api, tool_trace);
    register!(api, tool_route);
    register!(api, tool_path);
}

#[derive(Deserialize, JsonSchema)]
pub struct ToolRequest {
    pub target: String,
}

#[derive(Serialize, JsonSchema)]
pub struct ToolResponse {
    pub result: String,
}

/// Shell metacharacters plus whitespace: a target must be a bare host,
/// address or host:port.
const FORBIDDEN: &str = ";&|`$(){}[]<>\\\"'";

fn validate_target(target: &str) -> Result<(), Error> {
    if target.is_empty() {
        return Err(Error::Invalid("Missing target".to_string()));
    }
    if target
        .chars()
        .any(|c| FORBIDDEN.contains(c) || c.is_whitespace())
    {
        return Err(Error::Invalid("Invalid target".to_string()));
    }
    Ok(())
}

fn check_bearer(rqctx: &RequestContext<Arc<HandlerContext>>) -> Result<(), Error> {
    let ctx = rqctx.context();
    if ctx.api_token.is_empty() {
        return Ok(());
    }
    let expected = format!("Bearer {}", ctx.api_token);
    let presented = rqctx
        .request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Run a diagnostic command, returning combined stdout+stderr. A non-zero
/// exit still yields output (ping reports loss that way); spawn failures
/// and timeouts surface with sanitized messages only.
async fn run_tool(
    rqctx: &RequestContext<Arc<HandlerContext>>,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, Error> {
    let log = &rqctx.context().log;
    let invocation = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(timeout, invocation).await {
        Err(_) => Err(Error::Internal("Command timed out".to_string())),
        Ok(Err(e)) => {
            warn!(log, "tool {program} failed to spawn: {e}");
            Err(Error::Internal("Command execution failed".to_string()))
        }
        Ok(Ok(output)) => {
            let mut text =
                String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(text)
        }
    }
}

#[endpoint { method = POST, path = "/ping" }]
async fn tool_ping(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<ToolRequest>,
) -> Result<HttpResponseOk<ToolResponse>, HttpError> {
    check_bearer(&rqctx)?;
    let request = body.into_inner();
    validate_target(&request.target)?;
    let result = run_tool(
        &rqctx,
        "ping",
        &["-c", "4", "-W", "2", &request.target],
        Duration::from_secs(10),
    )
    .await?;
    Ok(HttpResponseOk(ToolResponse { result }))
}

#[endpoint { method = POST, path = "/trace" }]
async fn tool_trace(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<ToolRequest>,
) -> Result<HttpResponseOk<ToolResponse>, HttpError> {
    check_bearer(&rqctx)?;
    let request = body.into_inner();
    validate_target(&request.target)?;
    let result = run_tool(
        &rqctx,
        "traceroute",
        &["-m", "20", "-w", "2", &request.target],
        Duration::from_secs(30),
    )
    .await?;
    Ok(HttpResponseOk(ToolResponse { result }))
}

#[endpoint { method = POST, path = "/tcping" }]
async fn tool_tcping(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<ToolRequest>,
) -> Result<HttpResponseOk<ToolResponse>, HttpError> {
    check_bearer(&rqctx)?;
    let request = body.into_inner();
    validate_target(&request.target)?;
    let (host, port) = split_host_port(&request.target);

    let mut results = Vec::new();
    for attempt in 1..=4 {
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            TcpStream::connect((host.as_str(), port)),
        )
        .await;
        match outcome {
            Ok(Ok(_)) => results.push(format!(
                "Connection {attempt}: connected in {}ms",
                start.elapsed().as_millis()
            )),
            Ok(Err(e)) => results
                .push(format!("Connection {attempt}: failed - {}", e.kind())),
            Err(_) => {
                results.push(format!("Connection {attempt}: failed - timeout"))
            }
        }
        if attempt < 4 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
    Ok(HttpResponseOk(ToolResponse {
        result: results.join("\n"),
    }))
}

#[endpoint { method = POST, path = "/route" }]
async fn tool_route(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<ToolRequest>,
) -> Result<HttpResponseOk<ToolResponse>, HttpError> {
    check_bearer(&rqctx)?;
    let request = body.into_inner();
    validate_target(&request.target)?;
    let result = route_lookup(&rqctx, &request.target).await?;
    Ok(HttpResponseOk(ToolResponse { result }))
}

/// Like `/route`, filtered down to AS-path-relevant lines.
#[endpoint { method = POST, path = "/path" }]
async fn tool_path(
    rqctx: RequestContext<Arc<HandlerContext>>,
    body: TypedBody<ToolRequest>,
) -> Result<HttpResponseOk<ToolResponse>, HttpError> {
    check_bearer(&rqctx)?;
    let request = body.into_inner();
    validate_target(&request.target)?;
    let result = route_lookup(&rqctx, &request.target).await?;
    let filtered: Vec<&str> = result
        .lines()
        .filter(|line| {
            line.contains("BGP.as_path")
                || line.contains("via")
                || line.contains("unicast")
        })
        .collect();
    let result = if filtered.is_empty() {
        result
    } else {
        filtered.join("\n")
    };
    Ok(HttpResponseOk(ToolResponse { result }))
}

async fn route_lookup(
    rqctx: &RequestContext<Arc<HandlerContext>>,
    target: &str,
) -> Result<String, Error> {
    let ctx = rqctx.context();
    ctx.pool
        .execute(&format!("show route for {target} all"))
        .await
        .map_err(|e| {
            warn!(ctx.log, "route lookup failed: {e}");
            Error::Internal("Route lookup failed".to_string())
        })
}

fn split_host_port(target: &str) -> (String, u16) {
    if let Ok(sa) = target.parse::<std::net::SocketAddr>() {
        return (sa.ip().to_string(), sa.port());
    }
    // A bare IPv6 address is all colons; don't mistake its tail for a port.
    if target.parse::<std::net::Ipv6Addr>().is_ok() {
        return (target.to_string(), 80);
    }
    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if !host.is_empty() {
                return (host.to_string(), port);
            }
        }
    }
    (target.to_string(), 80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_validation_blocks_injection() {
        assert!(validate_target("172.20.0.53").is_ok());
        assert!(validate_target("fd00:4242:7777::1").is_ok());
        assert!(validate_target("example.dn42").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("1.1.1.1; rm -rf /").is_err());
        assert!(validate_target("$(id)").is_err());
        assert!(validate_target("a|b").is_err());
        assert!(validate_target("host name").is_err());
        assert!(validate_target("x\ny").is_err());
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("1.2.3.4:443"), ("1.2.3.4".into(), 443));
        assert_eq!(split_host_port("1.2.3.4"), ("1.2.3.4".into(), 80));
        assert_eq!(
            split_host_port("fd00:4242:7777::1"),
            ("fd00:4242:7777::1".into(), 80)
        );
        assert_eq!(
            split_host_port("[fd00::1]:8080"),
            ("fd00::1".into(), 8080)
        );
        assert_eq!(
            split_host_port("router.dn42:179"),
            ("router.dn42".into(), 179)
        );
        assert_eq!(
            split_host_port("router.dn42"),
            ("router.dn42".into(), 80)
        );
    }
}
