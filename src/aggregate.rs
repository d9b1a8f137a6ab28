//! Windowed aggregation of measurements between commits.
//!
//! Windows accumulate per-tick measurements and reduce them to one record
//! per commit interval. Averages are weighted by interval duration so a
//! short tick does not count as much as a long one; peaks are plain maxima;
//! process and user counts are unions of identities over the window.

use std::collections::{BTreeMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::db::{SystemRecord, UserRecord};
use crate::filter::{CommandFilter, GroupSelector};
use crate::measure::{MergedMeasurement, ProcessId, ProcessMeasurement, SystemMeasurement};

/// Time-weighted mean of (value, duration) pairs. An empty window or a
/// zero-length span yields 0.0, never NaN.
fn weighted_average(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let mut weighted_sum = 0.0;
    let mut span = 0.0;
    for (value, duration) in values {
        weighted_sum += value * duration;
        span += duration;
    }
    if span > 0.0 {
        weighted_sum / span
    } else {
        0.0
    }
}

/// Largest observed value, 0.0 for an empty window.
fn peak(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, f64::max)
}

/// Timestamps are stored at whole-second resolution.
fn round_utc(timestamp: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_default()
}

/// Host-wide measurements accumulated since the last commit.
#[derive(Debug, Default)]
pub struct SystemWindow {
    measurements: VecDeque<SystemMeasurement>,
}

impl SystemWindow {
    pub fn new() -> Self {
        SystemWindow::default()
    }

    pub fn add_measurement(&mut self, measurement: SystemMeasurement) {
        self.measurements.push_back(measurement);
    }

    pub fn reset(&mut self) {
        self.measurements.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn average_cpu_usage(&self) -> f64 {
        weighted_average(
            self.measurements
                .iter()
                .map(|m| (m.cpu_usage, m.time_end - m.time_start)),
        )
    }

    pub fn average_mem_usage(&self) -> f64 {
        weighted_average(
            self.measurements
                .iter()
                .map(|m| (m.mem_usage, m.time_end - m.time_start)),
        )
    }

    pub fn peak_cpu_usage(&self) -> f64 {
        peak(self.measurements.iter().map(|m| m.cpu_usage))
    }

    pub fn peak_mem_usage(&self) -> f64 {
        peak(self.measurements.iter().map(|m| m.mem_usage))
    }

    /// Distinct usernames seen anywhere in the window.
    pub fn users(&self) -> usize {
        let mut users = HashSet::new();
        for measurement in &self.measurements {
            users.extend(measurement.users.iter());
        }
        users.len()
    }

    /// Distinct processes seen anywhere in the window.
    pub fn user_processes(&self) -> usize {
        let mut processes: HashSet<ProcessId> = HashSet::new();
        for measurement in &self.measurements {
            processes.extend(measurement.user_processes.iter());
        }
        processes.len()
    }

    /// Reduces the window to a record, `None` when nothing was accumulated.
    pub fn record(&self, hostname: &str) -> Option<SystemRecord> {
        let first = self.measurements.front()?;
        let last = self.measurements.back()?;
        Some(SystemRecord {
            hostname: hostname.to_string(),
            time_start: round_utc(first.time_start),
            time_end: round_utc(last.time_end),
            average_cpu_usage: self.average_cpu_usage(),
            average_mem_usage: self.average_mem_usage(),
            peak_cpu_usage: self.peak_cpu_usage(),
            peak_mem_usage: self.peak_mem_usage(),
            users: self.users() as u64,
            user_processes: self.user_processes() as u64,
        })
    }
}

/// Measurements for one tracked group of a single owner.
///
/// Each tick contributes at most one merged measurement: the owner's
/// processes matching the selector, summed. Ticks where nothing matches
/// contribute nothing, so an idle group stays empty instead of averaging
/// in zeros.
#[derive(Debug)]
pub struct GroupWindow {
    name: Option<String>,
    selector: GroupSelector,
    measurements: VecDeque<MergedMeasurement>,
}

impl GroupWindow {
    pub fn new(name: Option<String>, selector: GroupSelector) -> Self {
        GroupWindow {
            name,
            selector,
            measurements: VecDeque::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Filters one tick's measurements through the selector and appends the
    /// merge of whatever matched.
    pub fn add_measurements(&mut self, measurements: &[&ProcessMeasurement]) {
        let matching: Vec<&ProcessMeasurement> = measurements
            .iter()
            .copied()
            .filter(|m| self.selector.matches(m.command.as_deref()))
            .collect();
        if !matching.is_empty() {
            self.measurements
                .push_back(MergedMeasurement::from_measurements(&matching));
        }
    }

    pub fn reset(&mut self) {
        self.measurements.clear();
    }

    pub fn average_cpu_usage(&self) -> f64 {
        weighted_average(
            self.measurements
                .iter()
                .map(|m| (m.cpu_usage, m.duration())),
        )
    }

    pub fn average_mem_usage(&self) -> f64 {
        weighted_average(
            self.measurements
                .iter()
                .map(|m| (m.mem_usage, m.duration())),
        )
    }

    pub fn peak_cpu_usage(&self) -> f64 {
        peak(self.measurements.iter().map(|m| m.cpu_usage))
    }

    pub fn peak_mem_usage(&self) -> f64 {
        peak(self.measurements.iter().map(|m| m.mem_usage))
    }

    /// Distinct processes seen in the window, counted by stable identity.
    pub fn processes(&self) -> usize {
        let mut processes: HashSet<ProcessId> = HashSet::new();
        for measurement in &self.measurements {
            processes.extend(measurement.processes.iter());
        }
        processes.len()
    }

    /// Reduces the window to a record, `None` when nothing matched during
    /// the whole interval.
    pub fn record(&self, hostname: &str, user: Option<&str>) -> Option<UserRecord> {
        let first = self.measurements.front()?;
        let last = self.measurements.back()?;
        Some(UserRecord {
            hostname: hostname.to_string(),
            user: user.map(str::to_string),
            group: self.name.clone(),
            time_start: round_utc(first.time_start),
            time_end: round_utc(last.time_end),
            average_cpu_usage: self.average_cpu_usage(),
            average_mem_usage: self.average_mem_usage(),
            peak_cpu_usage: self.peak_cpu_usage(),
            peak_mem_usage: self.peak_mem_usage(),
            processes: self.processes() as u64,
        })
    }
}

/// Group windows for every user seen since the last commit.
///
/// Users appear lazily as their processes show up. A named user gets one
/// window per configured group plus the unnamed catch-all covering all of
/// their processes; the anonymous owner (processes below the UID
/// threshold) gets the catch-all only.
#[derive(Debug)]
pub struct UserTable {
    groups: Vec<(String, GroupSelector)>,
    users: BTreeMap<Option<String>, Vec<GroupWindow>>,
}

impl UserTable {
    /// Compiles the configured group filters. A group with no usable rules
    /// is a configuration error.
    pub fn new(groups: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut compiled = Vec::new();
        for (name, rules) in groups {
            let filter = CommandFilter::new(rules)
                .with_context(|| format!("process group {name:?}"))?;
            compiled.push((name.clone(), GroupSelector::Commands(filter)));
        }
        Ok(UserTable {
            groups: compiled,
            users: BTreeMap::new(),
        })
    }

    fn windows_for(groups: &[(String, GroupSelector)], user: &Option<String>) -> Vec<GroupWindow> {
        let mut windows = Vec::new();
        if user.is_some() {
            for (name, selector) in groups {
                windows.push(GroupWindow::new(Some(name.clone()), selector.clone()));
            }
        }
        // The catch-all goes last so per-group records precede it.
        windows.push(GroupWindow::new(None, GroupSelector::AllProcesses));
        windows
    }

    /// Routes one tick's measurements for one owner into that owner's
    /// windows, creating them on first sight.
    pub fn add_measurements(&mut self, user: Option<String>, measurements: &[&ProcessMeasurement]) {
        let groups = &self.groups;
        let windows = self
            .users
            .entry(user)
            .or_insert_with_key(|user| Self::windows_for(groups, user));
        for window in windows {
            window.add_measurements(measurements);
        }
    }

    pub fn reset(&mut self) {
        self.users.clear();
    }

    /// One record per non-empty window, ordered by user and then by group
    /// position. The ordering is stable so identical inputs produce
    /// identical output sequences.
    pub fn records(&self, hostname: &str) -> Vec<UserRecord> {
        let mut records = Vec::new();
        for (user, windows) in &self.users {
            for window in windows {
                if let Some(record) = window.record(hostname, user.as_deref()) {
                    records.push(record);
                }
            }
        }
        records
    }
}
