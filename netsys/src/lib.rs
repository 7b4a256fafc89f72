// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-facing executors. Every mutation is a single external command with
//! explicit arguments; stderr is captured for diagnostics. No shell is ever
//! involved.

pub mod cmd;
pub mod firewall;
pub mod loopback;
pub mod wireguard;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("wg produced an empty {0} key")]
    EmptyKey(&'static str),

    #[error("node needs at least one loopback address")]
    NoLoopbackAddress,
}
