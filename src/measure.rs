//! Measurement types shared by the sampler, the aggregation windows, and
//! the replay stream.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Stable identity of a process: the pid together with the creation time.
/// The kernel recycles pids, but a recycled pid gets a new creation time,
/// so the pair stays unique for the lifetime of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub pid: u32,
    pub create_time: u64,
}

/// Resource usage of one process over one sample interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMeasurement {
    pub pid: u32,
    /// Owning username, `None` when the process runs below the UID
    /// threshold and is not attributed to anyone.
    pub username: Option<String>,
    pub time_start: f64,
    pub time_end: f64,
    /// CPU time consumed as a fraction of one core over the interval.
    pub cpu_usage: f64,
    /// Resident set size as a fraction of total system memory.
    pub mem_usage: f64,
    /// Command line split into arguments, `None` when unreadable or empty
    /// (kernel threads have no command line).
    pub command: Option<Vec<String>>,
    /// Creation time in whole UNIX seconds, when known.
    pub create_time: Option<u64>,
}

impl ProcessMeasurement {
    /// Stable identity for process counting, `None` when the creation time
    /// could not be determined.
    pub fn unique_id(&self) -> Option<ProcessId> {
        self.create_time.map(|create_time| ProcessId {
            pid: self.pid,
            create_time,
        })
    }
}

/// Host-wide resource usage over one sample interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMeasurement {
    pub time_start: f64,
    pub time_end: f64,
    /// Busy fraction across all cores combined, 0.0 to 1.0.
    pub cpu_usage: f64,
    /// Fraction of total memory not available for new allocations.
    pub mem_usage: f64,
    /// Usernames owning at least one process in this interval.
    pub users: HashSet<String>,
    /// Identities of all processes seen in this interval, attributed or
    /// not.
    pub user_processes: HashSet<ProcessId>,
}

impl SystemMeasurement {
    pub fn from_processes(
        processes: &[ProcessMeasurement],
        cpu_usage: f64,
        mem_usage: f64,
        time_start: f64,
        time_end: f64,
    ) -> Self {
        let mut users = HashSet::new();
        let mut user_processes = HashSet::new();
        for process in processes {
            // Anonymous processes still count, only the owner set is gated.
            if let Some(id) = process.unique_id() {
                user_processes.insert(id);
            }
            if let Some(username) = &process.username {
                users.insert(username.clone());
            }
        }
        SystemMeasurement {
            time_start,
            time_end,
            cpu_usage,
            mem_usage,
            users,
            user_processes,
        }
    }
}

/// One tick of collected data, the unit of the record/replay stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Wall-clock time the sample was taken, UNIX seconds.
    pub timestamp: f64,
    pub system: SystemMeasurement,
    pub processes: Vec<ProcessMeasurement>,
}

/// Several process measurements from the same tick and owner, merged into
/// one: usage sums, identities union.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMeasurement {
    pub username: Option<String>,
    pub time_start: f64,
    pub time_end: f64,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub processes: HashSet<ProcessId>,
}

impl MergedMeasurement {
    /// Merges measurements sharing one owner and one interval.
    ///
    /// # Panics
    ///
    /// Panics when `measurements` is empty or the entries disagree on the
    /// owner or the interval. Callers group by owner per tick first, so a
    /// mismatch here is a programming error.
    pub fn from_measurements(measurements: &[&ProcessMeasurement]) -> Self {
        let first = measurements
            .first()
            .expect("merging requires at least one measurement");
        let mut merged = MergedMeasurement {
            username: first.username.clone(),
            time_start: first.time_start,
            time_end: first.time_end,
            cpu_usage: 0.0,
            mem_usage: 0.0,
            processes: HashSet::new(),
        };
        for measurement in measurements {
            assert_eq!(
                merged.username, measurement.username,
                "measurements from different users"
            );
            assert!(
                merged.time_start == measurement.time_start
                    && merged.time_end == measurement.time_end,
                "measurements from different intervals"
            );
            merged.cpu_usage += measurement.cpu_usage;
            merged.mem_usage += measurement.mem_usage;
            if let Some(id) = measurement.unique_id() {
                merged.processes.insert(id);
            }
        }
        merged
    }

    pub fn duration(&self) -> f64 {
        self.time_end - self.time_start
    }
}
