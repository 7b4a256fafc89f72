// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Internal counters with a Prometheus text exposition. One instance is
//! created by the supervisor and injected wherever needed.

use cp_client::breaker::State as BreakerState;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    start: Instant,
    cp_requests_success: AtomicU64,
    cp_requests_failed: AtomicU64,
    last_heartbeat_ts: AtomicI64,
    sessions_total: AtomicU64,
    sessions_active: AtomicU64,
    sessions_error: AtomicU64,
    session_syncs: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            cp_requests_success: AtomicU64::new(0),
            cp_requests_failed: AtomicU64::new(0),
            last_heartbeat_ts: AtomicI64::new(0),
            sessions_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_error: AtomicU64::new(0),
            session_syncs: AtomicU64::new(0),
        }
    }

    pub fn record_cp_request(&self, success: bool) {
        if success {
            self.cp_requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cp_requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, timestamp: i64) {
        self.last_heartbeat_ts.store(timestamp, Ordering::Relaxed);
    }

    pub fn set_session_counts(&self, total: u64, active: u64, errored: u64) {
        self.sessions_total.store(total, Ordering::Relaxed);
        self.sessions_active.store(active, Ordering::Relaxed);
        self.sessions_error.store(errored, Ordering::Relaxed);
    }

    pub fn record_session_sync(&self) {
        self.session_syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self, version: &str, breaker: BreakerState) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP wrend_agent_info Agent information");
        let _ = writeln!(out, "# TYPE wrend_agent_info gauge");
        let _ = writeln!(out, "wrend_agent_info{{version=\"{version}\"}} 1");

        let _ = writeln!(
            out,
            "# HELP wrend_agent_uptime_seconds Agent uptime in seconds"
        );
        let _ = writeln!(out, "# TYPE wrend_agent_uptime_seconds counter");
        let _ = writeln!(
            out,
            "wrend_agent_uptime_seconds {}",
            self.start.elapsed().as_secs()
        );

        let _ = writeln!(
            out,
            "# HELP wrend_cp_requests_total Total control plane requests"
        );
        let _ = writeln!(out, "# TYPE wrend_cp_requests_total counter");
        let _ = writeln!(
            out,
            "wrend_cp_requests_total{{result=\"success\"}} {}",
            self.cp_requests_success.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "wrend_cp_requests_total{{result=\"failed\"}} {}",
            self.cp_requests_failed.load(Ordering::Relaxed)
        );

        let heartbeat = self.last_heartbeat_ts.load(Ordering::Relaxed);
        if heartbeat > 0 {
            let _ = writeln!(
                out,
                "# HELP wrend_cp_last_heartbeat_timestamp Last successful heartbeat"
            );
            let _ =
                writeln!(out, "# TYPE wrend_cp_last_heartbeat_timestamp gauge");
            let _ =
                writeln!(out, "wrend_cp_last_heartbeat_timestamp {heartbeat}");
        }

        let breaker_value = match breaker {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        };
        let _ = writeln!(
            out,
            "# HELP wrend_circuit_breaker_state Circuit breaker state (0=closed, 1=open, 2=half-open)"
        );
        let _ = writeln!(out, "# TYPE wrend_circuit_breaker_state gauge");
        let _ = writeln!(out, "wrend_circuit_breaker_state {breaker_value}");

        let _ = writeln!(out, "# HELP wrend_bgp_sessions BGP session counts");
        let _ = writeln!(out, "# TYPE wrend_bgp_sessions gauge");
        let _ = writeln!(
            out,
            "wrend_bgp_sessions{{status=\"total\"}} {}",
            self.sessions_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "wrend_bgp_sessions{{status=\"active\"}} {}",
            self.sessions_active.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "wrend_bgp_sessions{{status=\"error\"}} {}",
            self.sessions_error.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP wrend_session_syncs_total Total session sync operations"
        );
        let _ = writeln!(out, "# TYPE wrend_session_syncs_total counter");
        let _ = writeln!(
            out,
            "wrend_session_syncs_total {}",
            self.session_syncs.load(Ordering::Relaxed)
        );

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_reflects_counters() {
        let metrics = Metrics::new();
        metrics.record_cp_request(true);
        metrics.record_cp_request(true);
        metrics.record_cp_request(false);
        metrics.set_session_counts(7, 5, 1);
        metrics.record_session_sync();
        metrics.record_heartbeat(1_700_000_000);

        let text = metrics.render("0.1.0", BreakerState::Open);
        assert!(text.contains("wrend_agent_info{version=\"0.1.0\"} 1"));
        assert!(text.contains("wrend_cp_requests_total{result=\"success\"} 2"));
        assert!(text.contains("wrend_cp_requests_total{result=\"failed\"} 1"));
        assert!(text.contains("wrend_circuit_breaker_state 1"));
        assert!(text.contains("wrend_bgp_sessions{status=\"active\"} 5"));
        assert!(text.contains("wrend_session_syncs_total 1"));
        assert!(text.contains("wrend_cp_last_heartbeat_timestamp 1700000000"));
    }
}
