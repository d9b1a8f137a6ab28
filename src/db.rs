//! SQLite persistence for committed utilization records

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

/// One committed window of host-wide utilization.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemRecord {
    pub hostname: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub average_cpu_usage: f64,
    pub average_mem_usage: f64,
    pub peak_cpu_usage: f64,
    pub peak_mem_usage: f64,
    pub users: u64,
    pub user_processes: u64,
}

/// One committed window for a (user, group) pair. The catch-all group is
/// stored with a NULL group name; the anonymous owner with a NULL user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub hostname: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub average_cpu_usage: f64,
    pub average_mem_usage: f64,
    pub peak_cpu_usage: f64,
    pub peak_mem_usage: f64,
    pub processes: u64,
}

/// Destination for committed records. The monitor loop only talks to this
/// trait, so tests can substitute an in-memory sink for the database.
pub trait UtilizationSink {
    /// Writes one commit's worth of records atomically.
    fn commit(&mut self, system: &SystemRecord, users: &[UserRecord]) -> Result<()>;
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))
    }

    pub fn system_records(&self) -> rusqlite::Result<Vec<SystemRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT hostname, time_start, time_end, average_cpu_usage, average_mem_usage,
                    peak_cpu_usage, peak_mem_usage, users, user_processes
             FROM systemstats ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::map_system)?;
        rows.collect()
    }

    pub fn user_records(&self) -> rusqlite::Result<Vec<UserRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT hostname, user, \"group\", time_start, time_end, average_cpu_usage,
                    average_mem_usage, peak_cpu_usage, peak_mem_usage, processes
             FROM userstats ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::map_user)?;
        rows.collect()
    }

    fn map_system(row: &rusqlite::Row) -> rusqlite::Result<SystemRecord> {
        Ok(SystemRecord {
            hostname: row.get(0)?,
            time_start: Self::map_time(row.get(1)?),
            time_end: Self::map_time(row.get(2)?),
            average_cpu_usage: row.get(3)?,
            average_mem_usage: row.get(4)?,
            peak_cpu_usage: row.get(5)?,
            peak_mem_usage: row.get(6)?,
            users: row.get::<_, i64>(7)? as u64,
            user_processes: row.get::<_, i64>(8)? as u64,
        })
    }

    fn map_user(row: &rusqlite::Row) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            hostname: row.get(0)?,
            user: row.get(1)?,
            group: row.get(2)?,
            time_start: Self::map_time(row.get(3)?),
            time_end: Self::map_time(row.get(4)?),
            average_cpu_usage: row.get(5)?,
            average_mem_usage: row.get(6)?,
            peak_cpu_usage: row.get(7)?,
            peak_mem_usage: row.get(8)?,
            processes: row.get::<_, i64>(9)? as u64,
        })
    }

    fn map_time(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap_or_default()
    }
}

impl UtilizationSink for Database {
    fn commit(&mut self, system: &SystemRecord, users: &[UserRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO systemstats (hostname, time_start, time_end, average_cpu_usage,
                 average_mem_usage, peak_cpu_usage, peak_mem_usage, users, user_processes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                system.hostname,
                system.time_start.timestamp(),
                system.time_end.timestamp(),
                system.average_cpu_usage,
                system.average_mem_usage,
                system.peak_cpu_usage,
                system.peak_mem_usage,
                system.users as i64,
                system.user_processes as i64,
            ],
        )?;
        for record in users {
            tx.execute(
                "INSERT INTO userstats (hostname, user, \"group\", time_start, time_end,
                     average_cpu_usage, average_mem_usage, peak_cpu_usage, peak_mem_usage, processes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.hostname,
                    record.user,
                    record.group,
                    record.time_start.timestamp(),
                    record.time_end.timestamp(),
                    record.average_cpu_usage,
                    record.average_mem_usage,
                    record.peak_cpu_usage,
                    record.peak_mem_usage,
                    record.processes as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
