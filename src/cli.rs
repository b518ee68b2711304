//! Command-line options.

use clap::Parser;

/// Default beanstalkd address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:11300";

/// Pipes beanstalkd jobs through arbitrary unix commands.
///
/// Each reserved job is written to the stdin of a fresh `sh -c <cmd>`
/// worker. Exit 0 deletes the job; any other exit releases it with an
/// exponential backoff; a worker that outlives the job TTR is terminated
/// and the job is buried on its next reservation.
#[derive(Parser, Debug)]
#[command(name = "cmdstalk", version)]
pub struct Options {
    /// beanstalkd TCP address.
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Watch all tubes, polling for newly created ones.
    #[arg(long)]
    pub all: bool,

    /// Shell command to execute for each job.
    #[arg(long)]
    pub cmd: String,

    /// Number of brokers to run per tube.
    #[arg(long, default_value_t = 1)]
    pub per_tube: u64,

    /// Comma-separated tubes to watch. Ignored when --all is set.
    #[arg(long, value_delimiter = ',', default_value = "default")]
    pub tubes: Vec<String>,

    /// Quit after this many jobs have been reserved; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_jobs: u64,
}
