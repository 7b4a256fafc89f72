// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out dialing control socket")]
    DialTimeout,

    #[error("control socket closed mid-response")]
    UnexpectedEof,

    #[error("pool is closed")]
    PoolClosed,

    #[error("configure failed: {0}")]
    ConfigureFailed(String),

    #[error("{fragment} fragment is missing required field {field}")]
    MissingField {
        fragment: &'static str,
        field: &'static str,
    },
}
