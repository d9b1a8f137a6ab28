//! Recording and replaying snapshot streams.
//!
//! A replay file holds one JSON snapshot per line. Replaying a file feeds
//! the monitor the exact timestamps and measurements of the original run,
//! so scheduling decisions and committed records come out identical.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::measure::Snapshot;

/// Appends snapshots to a replay file as they are collected. Each line is
/// flushed immediately so an interrupted run still leaves a usable file.
pub struct ReplayWriter {
    out: BufWriter<File>,
}

impl ReplayWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating replay file {}", path.display()))?;
        Ok(ReplayWriter {
            out: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, snapshot: &Snapshot) -> Result<()> {
        serde_json::to_writer(&mut self.out, snapshot).context("encoding snapshot")?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Loads a recorded snapshot sequence. Every non-empty line must parse;
/// a malformed line fails the whole load with its line number.
pub fn load(path: &Path) -> Result<Vec<Snapshot>> {
    let file =
        File::open(path).with_context(|| format!("opening replay file {}", path.display()))?;
    let mut snapshots = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading replay file {}", path.display()))?;
        if line.is_empty() {
            continue;
        }
        let snapshot = serde_json::from_str(&line).with_context(|| {
            format!("{}: invalid snapshot on line {}", path.display(), index + 1)
        })?;
        snapshots.push(snapshot);
    }
    Ok(snapshots)
}
