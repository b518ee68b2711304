//! Job data reserved from the server.

use std::time::Duration;

/// A reserved job: server-assigned identifier plus opaque body.
///
/// A job is owned by exactly one broker between reservation and resolution
/// (delete, release, or bury) and carries no connection state of its own; all
/// server interaction goes through the reserving [`Connection`].
///
/// [`Connection`]: super::Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Server-assigned job id, unique per beanstalkd instance.
    pub id: u64,

    /// Opaque job body, handed verbatim to the worker command's stdin.
    pub body: Vec<u8>,
}

/// The subset of `stats-job` counters the broker acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    /// Number of times the job has timed out of a reservation.
    pub timeouts: u64,

    /// Number of times the job has been released back to the ready queue.
    pub releases: u64,

    /// Time until the current reservation's TTR expires.
    ///
    /// Beanstalkd reports whole seconds, so a job reserved with TTR=1 can
    /// legitimately report zero here.
    pub time_left: Duration,
}
