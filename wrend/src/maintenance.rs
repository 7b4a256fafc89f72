// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maintenance mode.
//!
//! The marker file `maintenance.conf` under the BIRD config root defines
//! `MAINTENANCE_MODE`; the daemon's filters attach the RFC 8326
//! graceful-shutdown community to exported routes while it is true. Enter
//! and Exit rewrite the marker and trigger a reconfigure.

use crate::log::{inf, wrn};
use bird::Pool;
use chrono::{DateTime, Utc};
use slog::Logger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const UNIT: &str = "maintenance";

const MARKER_ACTIVE: &str = "define MAINTENANCE_MODE = true;\n";
const MARKER_INACTIVE: &str = "define MAINTENANCE_MODE = false;\n";

fn marker_content(enabled: bool) -> &'static str {
    if enabled {
        MARKER_ACTIVE
    } else {
        MARKER_INACTIVE
    }
}

fn parse_marker(content: &str) -> bool {
    content.trim() == MARKER_ACTIVE.trim()
}

struct Inner {
    enabled: bool,
    entered_at: Option<DateTime<Utc>>,
}

pub struct MaintenanceState {
    inner: Mutex<Inner>,
    marker_path: PathBuf,
    pool: Arc<Pool>,
    log: Logger,
}

impl MaintenanceState {
    /// Recover the current mode from the marker file if one exists.
    pub fn new(conf_dir: &Path, pool: Arc<Pool>, log: Logger) -> Self {
        let marker_path = conf_dir.join("maintenance.conf");
        let enabled = std::fs::read_to_string(&marker_path)
            .map(|c| parse_marker(&c))
            .unwrap_or(false);
        let entered_at = enabled.then(Utc::now);
        Self {
            inner: Mutex::new(Inner {
                enabled,
                entered_at,
            }),
            marker_path,
            pool,
            log,
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    pub async fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.entered_at
    }

    /// Enable maintenance mode. A no-op when already enabled. A failed
    /// reconfigure rolls the marker back.
    pub async fn enter(&self) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if inner.enabled {
            return Ok(());
        }

        inf!(self.log, UNIT, "entering maintenance mode (graceful shutdown)");
        std::fs::write(&self.marker_path, marker_content(true))
            .map_err(|e| format!("failed to write maintenance marker: {e}"))?;

        if let Err(e) = self.pool.configure().await {
            let _ = std::fs::write(&self.marker_path, marker_content(false));
            return Err(format!("failed to reconfigure BIRD: {e}"));
        }

        inner.enabled = true;
        inner.entered_at = Some(Utc::now());
        inf!(self.log, UNIT, "maintenance mode enabled");
        Ok(())
    }

    /// Disable maintenance mode. A no-op when already disabled.
    pub async fn exit(&self) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if !inner.enabled {
            return Ok(());
        }

        inf!(self.log, UNIT, "exiting maintenance mode");
        std::fs::write(&self.marker_path, marker_content(false))
            .map_err(|e| format!("failed to write maintenance marker: {e}"))?;

        if let Err(e) = self.pool.configure().await {
            wrn!(self.log, UNIT, "BIRD reconfigure failed: {e}");
        }

        inner.enabled = false;
        inner.entered_at = None;
        inf!(self.log, UNIT, "maintenance mode disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        assert!(parse_marker(marker_content(true)));
        assert!(!parse_marker(marker_content(false)));
        assert!(!parse_marker(""));
        assert!(!parse_marker("define SOMETHING_ELSE = true;\n"));
    }
}
