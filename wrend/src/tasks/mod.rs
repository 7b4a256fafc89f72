// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic reconciliation tasks. Each task is a struct constructed by the
//! supervisor with its dependencies injected, and a `run` loop bound to the
//! root cancellation token. One iteration finishes (or errors out) before
//! the next begins; the next tick is the retry.

pub mod bird_config_sync;
pub mod heartbeat;
pub mod ibgp_sync;
pub mod mesh_sync;
pub mod metric;
pub mod rtt;
pub mod session_sync;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless cancelled first. Returns false on
/// cancellation.
pub(crate) async fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
