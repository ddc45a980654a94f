//! This module implements the fleet controller, a loop that consumes jobs from a request queue,
//! scales a fleet of worker instances in response to the queue backlog and dispatches the
//! received jobs to the workers over HTTP.
//!
//! The term `worker` represents a single cloud instance that runs the job intake endpoint.
pub mod aws;
pub mod config;
pub mod dispatch;
mod estimator;
pub mod job;
pub mod process;
pub mod provider;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod scaling;
pub mod service;
pub mod status;

pub type FleetResult<T> = anyhow::Result<T>;

pub use estimator::{BacklogEstimator, ReactiveEstimator, SmoothedEstimator};
pub use process::Controller;
pub use service::{ControllerService, create_controller_service};

use crate::common::timeutils::get_duration_from_env;
use std::time::Duration;

/// Tag key used to mark instances launched by a controller.
pub const CONTROLLER_TAG_KEY: &str = "fleetq:controller";

/// Upper bound of the SQS long polling wait time.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Upper bound of messages received in a single SQS call.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Delay levels between launches after failed provisioning attempts.
/// See [`scaling::ScalingLimiter`].
pub const LAUNCH_FAILURE_DELAYS: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
];

/// How long should a failed queue receive wait before the next attempt.
pub fn get_receive_error_delay() -> Duration {
    get_duration_from_env("FLEETQ_RECEIVE_ERROR_DELAY_MS").unwrap_or(Duration::from_secs(5))
}

/// How long can a graceful stop take before the controller gives up on draining the fleet.
pub fn get_drain_timeout() -> Duration {
    get_duration_from_env("FLEETQ_DRAIN_TIMEOUT_MS").unwrap_or(Duration::from_secs(5 * 60))
}
