// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::admin::HandlerContext;
use crate::log::{inf, wrn};
use crate::maintenance::MaintenanceState;
use crate::metrics::Metrics;
use crate::state::{MeshState, PolicyState, SessionMap};
use crate::tasks::bird_config_sync::BirdConfigSync;
use crate::tasks::heartbeat::Heartbeat;
use crate::tasks::ibgp_sync::IbgpSync;
use crate::tasks::mesh_sync::MeshSync;
use crate::tasks::metric::MetricCollector;
use crate::tasks::rtt::Rtt;
use crate::tasks::session_sync::SessionSync;
use anyhow::Context;
use bird::config::ConfigGenerator;
use bird::Pool;
use clap::Parser;
use cp_client::breaker::{BreakerConfig, CircuitBreaker};
use cp_client::retry::RetryConfig;
use cp_client::CpClient;
use netsys::firewall::FirewallExecutor;
use netsys::loopback::LoopbackExecutor;
use netsys::wireguard::WgExecutor;
use slog::{o, Logger};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wren_common::lock;

mod admin;
mod config;
mod error;
mod log;
mod maintenance;
mod metrics;
mod state;
mod tasks;
mod tools;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVER_SIGNATURE: &str = "wrend";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const UNIT: &str = "daemon";

#[derive(Parser, Debug)]
#[command(name = "wrend", about = "DN42 node control agent")]
struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', default_value = "./config.json")]
    config: PathBuf,

    /// Print version and exit.
    #[arg(short = 'v')]
    version: bool,

    /// Append logs to this file instead of stdout.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{SERVER_SIGNATURE} {VERSION}");
        return Ok(());
    }
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let log = match &cli.log_file {
        Some(path) => wren_common::log::init_file_logger(path)
            .context("failed to open log file")?,
        None => wren_common::log::init_logger(),
    };

    let config = Arc::new(
        config::load_with_bootstrap(&cli.config)
            .await
            .context("failed to load config")?,
    );

    inf!(log, UNIT, "{SERVER_SIGNATURE} {VERSION} starting");
    inf!(log, UNIT, "node: {}", config.node.name);
    inf!(log, UNIT, "control plane: {}", config.control_plane.url);
    inf!(log, UNIT, "listen: {}", config.server.listen);

    let pool = Arc::new(
        Pool::connect(
            &config.bird.control_socket,
            config.bird.pool_size,
            config.bird.pool_size_max,
            log.new(o!("unit" => "bird-pool")),
        )
        .await
        .context("failed to initialize BIRD pool")?,
    );

    let generator = Arc::new(
        ConfigGenerator::new(
            &config.bird.conf_dir,
            log.new(o!("unit" => "bird-config")),
        )
        .context("failed to initialize config generator")?,
    );

    let wg = Arc::new(
        WgExecutor::new(
            Path::new(&config.wireguard.private_key_path),
            Path::new(&config.wireguard.public_key_path),
            log.new(o!("unit" => "wireguard")),
        )
        .await
        .context("failed to initialize WireGuard executor")?,
    );

    let loopback = LoopbackExecutor::new(log.new(o!("unit" => "loopback")));
    if !config.wireguard.dn42_ipv4.is_empty()
        || !config.wireguard.dn42_ipv6.is_empty()
    {
        match loopback
            .setup_addresses(
                &config.wireguard.dn42_ipv4,
                &config.wireguard.dn42_ipv6,
            )
            .await
        {
            Ok(()) => inf!(
                log,
                UNIT,
                "loopback configured: {} {}",
                config.wireguard.dn42_ipv4,
                config.wireguard.dn42_ipv6
            ),
            Err(e) => wrn!(log, UNIT, "failed to setup loopback: {e}"),
        }
    }

    let firewall =
        Arc::new(FirewallExecutor::new(log.new(o!("unit" => "firewall"))));

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let retry = RetryConfig {
        max_retries: config.control_plane.max_retries,
        initial_delay: Duration::from_millis(
            config.control_plane.retry_initial_delay,
        ),
        ..RetryConfig::default()
    };
    let cp = Arc::new(
        CpClient::new(
            &config.control_plane.url,
            &config.node.name,
            &config.control_plane.token,
            config.request_timeout(),
            retry,
            breaker.clone(),
            log.new(o!("unit" => "cp-client")),
        )
        .context("failed to build control plane client")?,
    );

    let metrics = Arc::new(Metrics::new());
    let sessions = Arc::new(SessionMap::new());
    let mesh = Arc::new(MeshState::new());
    let policy = Arc::new(PolicyState::new(config.node.asn));
    let maintenance = Arc::new(MaintenanceState::new(
        Path::new(&config.bird.conf_dir),
        pool.clone(),
        log.clone(),
    ));
    let sync_nudge = Arc::new(Notify::new());

    let heartbeat = Heartbeat::new(
        config.clone(),
        cp.clone(),
        metrics.clone(),
        VERSION.to_string(),
        wg.public_key().to_string(),
        log.clone(),
    );
    let session_sync = SessionSync::new(
        config.clone(),
        cp.clone(),
        pool.clone(),
        generator.clone(),
        wg.clone(),
        firewall.clone(),
        sessions.clone(),
        metrics.clone(),
        log.clone(),
    );
    let metric_collector = MetricCollector::new(
        config.clone(),
        cp.clone(),
        pool.clone(),
        log.clone(),
    );
    let mesh_sync = Arc::new(MeshSync::new(
        config.clone(),
        cp.clone(),
        wg.clone(),
        mesh.clone(),
        log.clone(),
    ));
    let ibgp_sync = IbgpSync::new(
        config.clone(),
        pool.clone(),
        generator.clone(),
        mesh.clone(),
        policy.clone(),
        log.clone(),
    );
    let bird_config_sync = BirdConfigSync::new(
        cp.clone(),
        pool.clone(),
        generator.clone(),
        mesh.clone(),
        policy.clone(),
        log.clone(),
    );
    let rtt = Rtt::new(config.clone(), cp.clone(), log.clone());

    // Mesh fan-out feeds the RTT target list.
    let rtt_targets = rtt.targets();
    let fanout_log = log.clone();
    mesh.subscribe(Box::new(move |peers| {
        let targets = tasks::rtt::collect_targets(peers);
        inf!(fanout_log, "rtt", "updated {} mesh peer targets", targets.len());
        *lock!(rtt_targets) = targets;
    }));

    let listen = parse_listen(&config.server.listen)
        .context("invalid listen address")?;
    let ctx = Arc::new(HandlerContext {
        version: VERSION.to_string(),
        start: Instant::now(),
        maintenance: maintenance.clone(),
        metrics: metrics.clone(),
        breaker: breaker.clone(),
        sync_nudge: sync_nudge.clone(),
        pool: pool.clone(),
        wg: wg.clone(),
        api_token: config.control_plane.token.clone(),
        log: log.clone(),
    });
    let server = admin::start_server(&log, listen, ctx)
        .map_err(|e| anyhow::anyhow!(e))?;

    let cancel = CancellationToken::new();
    let handles: Vec<(&'static str, JoinHandle<()>)> = vec![
        (
            "heartbeat",
            tokio::spawn(heartbeat.run(cancel.clone())),
        ),
        (
            "session-sync",
            tokio::spawn(session_sync.run(cancel.clone(), sync_nudge.clone())),
        ),
        (
            "metric",
            tokio::spawn(metric_collector.run(cancel.clone())),
        ),
        ("rtt", tokio::spawn(rtt.run(cancel.clone()))),
        ("mesh-sync", tokio::spawn(mesh_sync.run(cancel.clone()))),
        ("ibgp", tokio::spawn(ibgp_sync.run(cancel.clone()))),
        (
            "bird-config",
            tokio::spawn(bird_config_sync.run(cancel.clone())),
        ),
    ];

    wait_for_shutdown(&log).await;

    inf!(log, UNIT, "initiating graceful shutdown");
    cancel.cancel();
    if let Err(e) = server.close().await {
        wrn!(log, UNIT, "admin server shutdown error: {e}");
    }

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    for (name, handle) in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, handle).await.is_err() {
            wrn!(log, UNIT, "task {name} did not drain in time, abandoning");
        }
    }
    pool.close();

    inf!(log, UNIT, "{SERVER_SIGNATURE} stopped");
    Ok(())
}

async fn wait_for_shutdown(log: &Logger) {
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    inf!(log, UNIT, "interrupt received")
                }
                _ = sigterm.recv() => {
                    inf!(log, UNIT, "termination signal received")
                }
            }
        }
        Err(e) => {
            wrn!(log, UNIT, "failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Accept both `host:port` and the bare `:port` shorthand.
fn parse_listen(listen: &str) -> anyhow::Result<SocketAddr> {
    let candidate = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    Ok(candidate.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_shorthand_is_accepted() {
        assert_eq!(
            parse_listen(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen("not an address").is_err());
    }
}
