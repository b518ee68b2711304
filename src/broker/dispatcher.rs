//! Fans brokers out across tubes and enforces the global job cap.
//!
//! The dispatcher can be told tubes explicitly ([`run_tubes`]) or poll the
//! server for tubes as they are created ([`run_all_tubes`]). Either way it
//! starts `per_tube` brokers for each tube, all sharing one cancellation
//! token and one reservation-signal channel.
//!
//! [`run_tubes`]: Dispatcher::run_tubes
//! [`run_all_tubes`]: Dispatcher::run_all_tubes

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::beanstalk::{self, Connection};

use super::{Broker, LIST_TUBE_DELAY};

/// Supervises one broker per (tube, slot) pair.
///
/// Cloning is shallow: clones share the tube set, the cancellation token,
/// the reservation counter, and the broker task tracker.
#[derive(Clone)]
pub struct Dispatcher {
    address: String,
    cmd: String,
    per_tube: u64,
    tube_set: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    reserved_signal: mpsc::Sender<()>,
    brokers: TaskTracker,
    list_tube_delay: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher and starts its reservation counter.
    ///
    /// The counter cancels the (derived) token once `max_jobs` reservations
    /// have been signalled; `max_jobs = 0` means unlimited. Cancelling
    /// `parent` stops everything either way.
    pub fn new(
        parent: &CancellationToken,
        address: impl Into<String>,
        cmd: impl Into<String>,
        per_tube: u64,
        max_jobs: u64,
    ) -> Self {
        let cancel = parent.child_token();

        // Capacity 1 is the closest tokio gets to an unbuffered channel: a
        // counter that falls behind backpressures the brokers' reserve
        // loops, so the cap cannot be overshot.
        let (reserved_signal, signal_rx) = mpsc::channel(1);
        tokio::spawn(count_reservations(max_jobs, cancel.clone(), signal_rx));

        Dispatcher {
            address: address.into(),
            cmd: cmd.into(),
            per_tube,
            tube_set: Arc::new(Mutex::new(HashSet::new())),
            cancel,
            reserved_signal,
            brokers: TaskTracker::new(),
            list_tube_delay: LIST_TUBE_DELAY,
        }
    }

    /// Overrides the tube discovery interval. Tests poll faster than the
    /// production cadence.
    #[cfg(test)]
    pub(crate) fn with_list_tube_delay(mut self, delay: Duration) -> Self {
        self.list_tube_delay = delay;
        self
    }

    /// Runs `per_tube` brokers for the given tube.
    pub async fn run_tube(&self, tube: &str) {
        self.tube_set.lock().await.insert(tube.to_string());
        for slot in 0..self.per_tube {
            let broker = Broker::new(
                self.address.clone(),
                tube,
                slot,
                self.cmd.clone(),
                self.cancel.clone(),
                self.reserved_signal.clone(),
                None,
            );
            let tube = tube.to_string();
            self.brokers.spawn(async move {
                if let Err(error) = broker.run().await {
                    error!(tube = %tube, slot, %error, "broker failed");
                }
            });
        }
    }

    /// Runs brokers for each of the given tubes, once per tube.
    pub async fn run_tubes(&self, tubes: &[String]) {
        for tube in tubes {
            self.run_tube(tube).await;
        }
    }

    /// Polls beanstalkd for tubes, starting brokers as new ones appear.
    ///
    /// The first discovery pass runs before this returns, so brokers for
    /// the tubes that already exist start immediately; discovery then
    /// repeats every [`LIST_TUBE_DELAY`] until cancellation. Only the
    /// initial dial is fatal; list-tubes failures are logged and retried on
    /// the next tick.
    pub async fn run_all_tubes(&self) -> beanstalk::Result<()> {
        let mut conn = Connection::dial(&self.address).await?;

        if let Err(error) = self.watch_new_tubes(&mut conn).await {
            warn!(%error, "tube discovery failed");
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let delay = dispatcher.list_tube_delay;
            let mut ticker = interval_at(Instant::now() + delay, delay);
            loop {
                tokio::select! {
                    _ = dispatcher.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = dispatcher.watch_new_tubes(&mut conn).await {
                            warn!(%error, "tube discovery failed");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Blocks until every spawned broker has returned.
    pub async fn wait(&self) {
        self.brokers.close();
        self.brokers.wait().await;
    }

    /// Number of broker tasks still running.
    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    /// Number of tubes being served.
    pub async fn tube_count(&self) -> usize {
        self.tube_set.lock().await.len()
    }

    async fn watch_new_tubes(&self, conn: &mut Connection) -> beanstalk::Result<()> {
        for tube in conn.list_tubes().await? {
            let seen = self.tube_set.lock().await.contains(&tube);
            if !seen {
                info!(tube = %tube, "discovered tube");
                self.run_tube(&tube).await;
            }
        }
        Ok(())
    }
}

/// Drains the reservation-signal channel, cancelling once the cap is hit.
///
/// The count starts at 1 so cancellation fires on the `max_jobs`-th
/// reservation itself, not the one after. With `max_jobs = 0` the channel is
/// drained forever.
async fn count_reservations(
    max_jobs: u64,
    cancel: CancellationToken,
    mut signals: mpsc::Receiver<()>,
) {
    let mut generated: u64 = 1;
    while signals.recv().await.is_some() {
        if max_jobs != 0 && generated == max_jobs {
            info!("reached job limit. quitting.");
            cancel.cancel();
        }
        generated += 1;
    }
}
