//! The sampling loop: aligned ticks, windowed aggregation, and commits on
//! wall-clock boundaries.
//!
//! All timing decisions are made from snapshot timestamps, not from a live
//! clock, so replaying a recorded stream reproduces the original run's
//! commits exactly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::{SystemWindow, UserTable};
use crate::db::UtilizationSink;
use crate::measure::{ProcessMeasurement, Snapshot};
use crate::replay::ReplayWriter;
use crate::sampler::Sampler;

/// A tick this close below the boundary counts as reaching it.
const COMMIT_TOLERANCE: f64 = 0.1;
/// A tick this far past the boundary realigns instead of committing.
const DRIFT_TOLERANCE: f64 = 10.0;
/// Oversleeping by this much gets logged.
const SLEEP_WARNING: f64 = 0.5;
/// Collection taking this long gets logged.
const COLLECTION_WARNING: f64 = 1.0;
/// A database write taking this long gets logged.
const COMMIT_WARNING: f64 = 0.5;

/// Wall-clock access for the live stream, swapped out in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UNIX time in seconds.
    fn now(&self) -> f64;
    async fn sleep(&self, seconds: f64);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    }
}

/// Where snapshots come from: live sampling on a tick aligned to multiples
/// of the interval, or playback of a recorded stream without any sleeping.
pub enum SnapshotStream {
    Live {
        sampler: Box<dyn Sampler>,
        clock: Arc<dyn Clock>,
        interval: f64,
        last_time: f64,
        recorder: Option<ReplayWriter>,
    },
    Replay {
        snapshots: VecDeque<Snapshot>,
    },
}

impl SnapshotStream {
    pub fn live(
        sampler: Box<dyn Sampler>,
        clock: Arc<dyn Clock>,
        interval: f64,
        recorder: Option<ReplayWriter>,
    ) -> Self {
        let last_time = clock.now();
        SnapshotStream::Live {
            sampler,
            clock,
            interval,
            last_time,
            recorder,
        }
    }

    pub fn replay(snapshots: Vec<Snapshot>) -> Self {
        SnapshotStream::Replay {
            snapshots: snapshots.into(),
        }
    }

    /// Produces the next snapshot, or `None` once cancelled or the replay
    /// is exhausted. Cancellation is only observed while sleeping; a signal
    /// arriving during collection takes effect on the next tick.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Snapshot>> {
        match self {
            SnapshotStream::Live {
                sampler,
                clock,
                interval,
                last_time,
                recorder,
            } => {
                // Sleep to the next multiple of the interval, not for the
                // interval itself, so ticks stay aligned regardless of how
                // long the previous collection took.
                let before_sleep = clock.now();
                let expected = *interval - before_sleep.rem_euclid(*interval);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    _ = clock.sleep(expected) => {}
                }

                let timestamp = clock.now();
                let overslept = timestamp - before_sleep - expected;
                if overslept >= SLEEP_WARNING {
                    warn!("drift of {:.1}s detected after sleep", overslept);
                }

                let (system, processes) = sampler.collect(*last_time, timestamp);
                let elapsed = clock.now() - timestamp;
                if elapsed >= COLLECTION_WARNING {
                    warn!(
                        "drift of {:.1}s during collection of process statistics",
                        elapsed
                    );
                }
                *last_time = timestamp;

                let snapshot = Snapshot {
                    timestamp,
                    system,
                    processes,
                };
                if let Some(recorder) = recorder {
                    recorder.append(&snapshot)?;
                }
                Ok(Some(snapshot))
            }
            SnapshotStream::Replay { snapshots } => {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                Ok(snapshots.pop_front())
            }
        }
    }
}

/// First multiple of `interval` strictly after `timestamp`.
pub fn next_boundary(timestamp: f64, interval: f64) -> f64 {
    ((timestamp / interval).floor() + 1.0) * interval
}

/// Drives the sample, aggregate, commit cycle over a snapshot stream.
pub struct Monitor {
    commit_interval: f64,
    hostname: String,
    system: SystemWindow,
    users: UserTable,
}

impl Monitor {
    pub fn new(
        commit_interval: f64,
        hostname: String,
        groups: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        Ok(Monitor {
            commit_interval,
            hostname,
            system: SystemWindow::new(),
            users: UserTable::new(groups)?,
        })
    }

    /// Consumes the stream until it ends, committing accumulated windows
    /// whenever a tick reaches a commit boundary. Windows still open when
    /// the stream ends are dropped, not committed; a partial window would
    /// misrepresent the interval it claims to cover.
    pub async fn run(
        &mut self,
        stream: &mut SnapshotStream,
        sink: &mut dyn UtilizationSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut next_commit: Option<f64> = None;
        while let Some(snapshot) = stream.next(cancel).await? {
            let boundary = *next_commit
                .get_or_insert_with(|| next_boundary(snapshot.timestamp, self.commit_interval));
            debug!(
                "time until next commit: {:.3}s",
                boundary - snapshot.timestamp
            );

            if snapshot.timestamp - boundary >= DRIFT_TOLERANCE {
                warn!(
                    "tick drifted {:.1}s past the commit boundary, realigning and \
                     discarding the partial window",
                    snapshot.timestamp - boundary
                );
                self.system.reset();
                self.users.reset();
                next_commit = Some(next_boundary(snapshot.timestamp, self.commit_interval));
                continue;
            }

            let Snapshot {
                timestamp,
                system,
                processes,
            } = snapshot;
            self.system.add_measurement(system);
            for (user, measurements) in group_by_user(&processes) {
                self.users.add_measurements(user.cloned(), &measurements);
            }

            if timestamp + COMMIT_TOLERANCE >= boundary {
                self.commit(sink)?;
                next_commit = Some(next_boundary(
                    timestamp + COMMIT_TOLERANCE,
                    self.commit_interval,
                ));
            }
        }
        Ok(())
    }

    fn commit(&mut self, sink: &mut dyn UtilizationSink) -> Result<()> {
        let Some(system) = self.system.record(&self.hostname) else {
            debug!("nothing accumulated, skipping commit");
            self.users.reset();
            return Ok(());
        };
        let users = self.users.records(&self.hostname);
        debug!(
            "committing system record from {} to {}",
            system.time_start, system.time_end
        );
        for record in &users {
            debug!(
                "committing record for user {:?} group {:?} from {} to {}",
                record.user, record.group, record.time_start, record.time_end
            );
        }

        let started = Instant::now();
        sink.commit(&system, &users)?;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed >= COMMIT_WARNING {
            warn!("writing utilization records took {:.1}s", elapsed);
        }

        self.system.reset();
        self.users.reset();
        Ok(())
    }
}

/// Splits one tick's measurements by owner, unattributed processes under
/// `None`. BTreeMap keys keep the per-tick processing order stable.
fn group_by_user(
    processes: &[ProcessMeasurement],
) -> BTreeMap<Option<&String>, Vec<&ProcessMeasurement>> {
    let mut by_user: BTreeMap<Option<&String>, Vec<&ProcessMeasurement>> = BTreeMap::new();
    for process in processes {
        by_user.entry(process.username.as_ref()).or_default().push(process);
    }
    by_user
}
