// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! wrn {
    ($log:expr, $unit:expr, $($args:tt)+) => {
        slog::warn!($log, "[{}] {}", $unit, format!($($args)+))
    }
}

macro_rules! inf {
    ($log:expr, $unit:expr, $($args:tt)+) => {
        slog::info!($log, "[{}] {}", $unit, format!($($args)+))
    }
}

macro_rules! dbg {
    ($log:expr, $unit:expr, $($args:tt)+) => {
        slog::debug!($log, "[{}] {}", $unit, format!($($args)+))
    }
}

pub(crate) use {dbg, inf, wrn};
