// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BIRD integration: a pooled control-socket client and a typed
//! configuration-fragment generator.

pub mod config;
pub mod error;
pub mod pool;

pub use error::Error;
pub use pool::Pool;
