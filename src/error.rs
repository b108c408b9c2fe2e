// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all hyperclean-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypercleanError {
    #[error("{0}")]
    Clean(#[from] crate::controller::CleanError),

    #[error("{0}")]
    Engine(#[from] crate::engine::EngineError),

    #[error("{0}")]
    Stats(#[from] crate::stats::StatsError),
}
