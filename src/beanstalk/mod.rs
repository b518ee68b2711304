//! Beanstalkd client: connection management, the text protocol, and job data.
//!
//! This is a deliberately thin layer: it exposes exactly the operations the
//! broker needs (reserve-with-timeout, per-job stats and actions, list-tubes)
//! and maps server replies onto Rust types. There is no connection pooling and
//! no retry logic here; each broker owns one connection and decides for itself
//! what is fatal.

pub mod conn;
pub mod job;

pub use conn::{Connection, Reserve};
pub use job::{Job, JobStats};

use thiserror::Error;

/// Priority used for bury and release commands.
///
/// Beanstalkd treats lower values as more urgent; 1024 is the conventional
/// midpoint for jobs with no particular urgency.
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Errors from the beanstalkd connection.
///
/// A reservation timeout is *not* an error; see [`Reserve`].
#[derive(Debug, Error)]
pub enum BeanstalkError {
    /// Network or stream failure, including an unexpected EOF from the server.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The server replied `NOT_FOUND`: the job does not exist or is not
    /// reserved by this connection.
    #[error("job not found")]
    NotFound,

    /// A documented server-side failure reply (`OUT_OF_MEMORY`,
    /// `INTERNAL_ERROR`, `BAD_FORMAT`, `UNKNOWN_COMMAND`, `DRAINING`).
    #[error("server error: {0}")]
    Server(String),

    /// A reply line that is not valid for the command that was sent.
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),

    /// A structurally invalid reply (bad id, bad length, bad stats body).
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Result type for beanstalkd operations.
pub type Result<T> = std::result::Result<T, BeanstalkError>;
