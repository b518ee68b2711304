//! Reserves jobs from beanstalkd, spawns worker processes, and manages the
//! interaction between the two.
//!
//! A [`Broker`] serves one (tube, slot) pair on its own connection; the
//! [`Dispatcher`] fans brokers out across tubes, counts reservations against
//! the global job cap, and discovers new tubes when asked to.

pub mod broker;
pub mod dispatcher;


pub use broker::{Broker, JobResult};
pub use dispatcher::Dispatcher;

use std::time::Duration;

use thiserror::Error;

use crate::beanstalk::BeanstalkError;

/// Compensates for beanstalkd's whole-second precision: a job reserved with
/// TTR=1 can report time-left=0, so touch timers and the kill timer are
/// offset by this margin.
pub const TTR_MARGIN: Duration = Duration::from_secs(1);

/// Number of timeouts a job must reach before it is buried.
pub const TIMEOUT_TRIES: u64 = 1;

/// Number of releases a job must reach before it is buried.
pub const RELEASE_TRIES: u64 = 10;

/// Server-side reserve timeout. Doubles as the interval at which an idle
/// broker re-checks the cancellation token.
pub const RESERVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time between list-tubes polls when discovering tubes.
pub const LIST_TUBE_DELAY: Duration = Duration::from_secs(10);

/// Fatal broker failures. Everything else is handled within the loop: a
/// reservation timeout yields, transient reserve errors back off and retry,
/// and per-job harness failures ride along in [`JobResult`].
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The connection failed, or a per-job metadata query did. Without
    /// working stats the policy checks cannot run, so the broker stops.
    #[error("beanstalkd error: {0}")]
    Beanstalk(#[from] BeanstalkError),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
