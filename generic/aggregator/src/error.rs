// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid latency: minimum {min:?} is larger than maximum {max:?}")]
    InvalidLatency { min: Duration, max: Duration },
    #[error("Failed to start: {0}")]
    StartFailed(String),
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    #[error("Already started")]
    AlreadyStarted,
    #[error("Not started")]
    NotStarted,
}
