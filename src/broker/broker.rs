//! The per-(tube, slot) broker: reserve, policy-check, execute, resolve.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::beanstalk::{Connection, Job, Reserve, DEFAULT_PRIORITY};
use crate::command::{CommandError, CommandRunner};

use super::{Result, RELEASE_TRIES, RESERVE_TIMEOUT, TIMEOUT_TRIES, TTR_MARGIN};

/// What became of one reserved job.
///
/// Emitted at most once per reserved job when a results sink is configured;
/// the dispatcher runs its brokers fire-and-forget, without one.
#[derive(Debug, Default)]
pub struct JobResult {
    /// The job was buried by a policy check, without running the command.
    pub buried: bool,

    /// The worker command was executed (or at least attempted).
    pub executed: bool,

    /// Exit status of the command; 0 for success. Meaningless when
    /// `executed` is false or `error` is set.
    pub exit_status: i32,

    /// Job id from beanstalkd.
    pub job_id: u64,

    /// Everything the worker wrote to stdout.
    pub stdout: Vec<u8>,

    /// The worker outlived the job's TTR and was terminated. Tracked by the
    /// broker's own timer, separately from beanstalkd.
    pub timed_out: bool,

    /// Harness failure while handling the job (never the worker's own
    /// non-zero exit). When set, no terminal action was taken and the job is
    /// left to re-expire on the server.
    pub error: Option<CommandError>,
}

impl JobResult {
    fn buried(job_id: u64) -> Self {
        JobResult {
            job_id,
            buried: true,
            ..JobResult::default()
        }
    }

    fn executed(job_id: u64) -> Self {
        JobResult {
            job_id,
            executed: true,
            ..JobResult::default()
        }
    }
}

/// Serves a single tube on a dedicated connection.
///
/// `slot` only distinguishes multiple brokers on the same tube in the logs;
/// the brokers themselves are identical.
pub struct Broker {
    address: String,
    tube: String,
    slot: u64,
    cmd: String,
    cancel: CancellationToken,
    reserved_signal: mpsc::Sender<()>,
    results: Option<mpsc::Sender<JobResult>>,
}

impl Broker {
    /// New broker instance. `reserved_signal` receives one token per
    /// successful reservation (the dispatcher counts these against the job
    /// cap); `results` is optional and mostly useful to tests.
    pub fn new(
        address: impl Into<String>,
        tube: impl Into<String>,
        slot: u64,
        cmd: impl Into<String>,
        cancel: CancellationToken,
        reserved_signal: mpsc::Sender<()>,
        results: Option<mpsc::Sender<JobResult>>,
    ) -> Self {
        Broker {
            address: address.into(),
            tube: tube.into(),
            slot,
            cmd: cmd.into(),
            cancel,
            reserved_signal,
            results,
        }
    }

    /// Connects to beanstalkd and runs the reserve loop until cancellation
    /// or a fatal error.
    ///
    /// Cancellation is only observed between reservations: a job that is
    /// already executing runs to completion.
    #[instrument(name = "broker", skip_all, fields(tube = %self.tube, slot = self.slot))]
    pub async fn run(self) -> Result<()> {
        info!(command = %self.cmd, address = %self.address, "connecting");
        let mut conn = Connection::dial(&self.address).await?;

        conn.watch_only(&self.tube).await?;
        info!("watching tube, waiting for jobs");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let job = match conn.reserve_with_timeout(RESERVE_TIMEOUT).await {
                Ok(Reserve::TimedOut) => continue,
                Ok(Reserve::Job(job)) => job,
                Err(error) => {
                    warn!(%error, "reserve failed, backing off");
                    tokio::time::sleep(RESERVE_TIMEOUT).await;
                    continue;
                }
            };

            // One token per reservation, before any policy decision. This
            // send blocks while the counter is behind, which is what keeps
            // the job cap from being overshot.
            if self.reserved_signal.send(()).await.is_err() {
                debug!("reservation counter is gone");
            }

            self.handle_job(&mut conn, job).await?;
        }

        info!("broker finished");
        Ok(())
    }

    /// One reserved job: policy checks, execution, resolution, result.
    ///
    /// Stats queries are the only fatal failures in here; everything that
    /// goes wrong further down is captured in the emitted [`JobResult`].
    async fn handle_job(&self, conn: &mut Connection, job: Job) -> Result<()> {
        let stats = conn.stats_job(job.id).await?;

        if stats.timeouts >= TIMEOUT_TRIES {
            info!(job = job.id, timeouts = stats.timeouts, "burying job");
            if let Err(error) = conn.bury(job.id, DEFAULT_PRIORITY).await {
                error!(job = job.id, %error, "bury failed");
            }
            self.emit(JobResult::buried(job.id)).await;
            return Ok(());
        }

        if stats.releases >= RELEASE_TRIES {
            info!(job = job.id, releases = stats.releases, "burying job");
            if let Err(error) = conn.bury(job.id, DEFAULT_PRIORITY).await {
                error!(job = job.id, %error, "bury failed");
            }
            self.emit(JobResult::buried(job.id)).await;
            return Ok(());
        }

        info!(job = job.id, "executing job");
        let result = self.execute_job(conn, &job, stats.time_left).await;

        if let Some(error) = &result.error {
            // No terminal action on a harness failure: the reservation will
            // re-expire on the server and the job will come around again.
            warn!(job = job.id, %error, "job left unresolved");
        } else {
            self.resolve(conn, &job, &result).await;
        }

        self.emit(result).await;
        Ok(())
    }

    /// Runs the worker command under TTR supervision.
    ///
    /// While the child streams stdout, a touch timer refreshes the
    /// reservation every `time_left - TTR_MARGIN`. Once stdout closes the
    /// child has one `TTR_MARGIN` to be reaped; past that it is terminated
    /// and the job is marked timed out.
    async fn execute_job(&self, conn: &mut Connection, job: &Job, time_left: Duration) -> JobResult {
        let mut result = JobResult::executed(job.id);

        let (mut runner, mut stdout) = match CommandRunner::build(&self.cmd) {
            Ok(built) => built,
            Err(error) => {
                result.error = Some(error);
                return result;
            }
        };
        if let Err(error) = runner.start_with_stdin(job.body.clone()) {
            result.error = Some(error);
            return result;
        }

        // Clamped so a TTR at or below the margin cannot produce a zero
        // period; such a job will time out server-side no matter what we do.
        let period = time_left.saturating_sub(TTR_MARGIN).max(Duration::from_secs(1));
        let mut touch_timer = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = touch_timer.tick() => {
                    debug!(job = job.id, "touching job");
                    if let Err(error) = conn.touch(job.id).await {
                        warn!(job = job.id, %error, "touch failed");
                    }
                }
                chunk = stdout.recv() => match chunk {
                    Some(data) => result.stdout.extend_from_slice(&data),
                    None => break,
                }
            }
        }

        let mut wait = match runner.wait_event() {
            Ok(wait) => wait,
            Err(error) => {
                result.error = Some(error);
                return result;
            }
        };

        let mut kill_timer = interval_at(Instant::now() + TTR_MARGIN, TTR_MARGIN);
        loop {
            tokio::select! {
                event = &mut wait => {
                    match event {
                        Ok(event) => {
                            result.exit_status = event.status;
                            if result.error.is_none() {
                                result.error = event.error;
                            }
                        }
                        Err(_) => result.error = Some(CommandError::WaitLost),
                    }
                    break;
                }
                _ = kill_timer.tick() => {
                    info!(job = job.id, "worker exceeded TTR, terminating");
                    runner.terminate();
                    result.timed_out = true;
                    // Keep racing: terminate is idempotent and the wait
                    // event is still coming.
                }
            }
        }

        result
    }

    /// Translates an execution outcome into a server action.
    async fn resolve(&self, conn: &mut Connection, job: &Job, result: &JobResult) {
        if result.timed_out {
            // Beanstalkd's own TTR reclaims the job; the incremented timeouts
            // counter buries it on its next reservation.
            info!(job = job.id, "job timed out");
            return;
        }

        info!(job = job.id, status = result.exit_status, "job finished");
        match result.exit_status {
            0 => {
                info!(job = job.id, "deleting job");
                if let Err(error) = conn.delete(job.id).await {
                    error!(job = job.id, %error, "delete failed");
                }
            }
            _ => {
                let releases = conn.releases(job.id).await.unwrap_or(RELEASE_TRIES);
                let delay = release_delay(releases);
                info!(
                    job = job.id,
                    releases,
                    delay_secs = delay.as_secs(),
                    "releasing job with delay"
                );
                if let Err(error) = conn.release(job.id, DEFAULT_PRIORITY, delay).await {
                    error!(job = job.id, %error, "release failed");
                }
            }
        }
    }

    async fn emit(&self, result: JobResult) {
        if let Some(results) = &self.results {
            let _ = results.send(result).await;
        }
    }
}

/// Backoff before a released job becomes ready again: `releases^4` seconds.
/// The 10th and final try waits 10,000s; the cumulative schedule approaches
/// eight hours.
fn release_delay(releases: u64) -> Duration {
    Duration::from_secs(releases.saturating_pow(4))
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn release_delay_is_quartic() {
        assert_eq!(release_delay(0), Duration::from_secs(0));
        assert_eq!(release_delay(1), Duration::from_secs(1));
        assert_eq!(release_delay(2), Duration::from_secs(16));
        assert_eq!(release_delay(9), Duration::from_secs(6561));
        assert_eq!(release_delay(10), Duration::from_secs(10_000));
    }

    #[test]
    fn release_delay_saturates() {
        // A corrupt releases counter must not panic the broker.
        assert_eq!(release_delay(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
