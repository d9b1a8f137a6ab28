use std::collections::HashSet;
use std::fs;

use tempfile::tempdir;
use usagemon::measure::{ProcessMeasurement, Snapshot, SystemMeasurement};
use usagemon::replay::{load, ReplayWriter};

fn snapshot(timestamp: f64) -> Snapshot {
    let process = ProcessMeasurement {
        pid: 101,
        username: Some("alice".to_string()),
        time_start: timestamp - 5.0,
        time_end: timestamp,
        cpu_usage: 0.5,
        mem_usage: 0.1,
        command: Some(vec!["/usr/bin/vim".to_string(), "notes.txt".to_string()]),
        create_time: Some(50),
    };
    let system = SystemMeasurement {
        time_start: timestamp - 5.0,
        time_end: timestamp,
        cpu_usage: 0.3,
        mem_usage: 0.6,
        users: ["alice".to_string()].into_iter().collect(),
        user_processes: HashSet::new(),
    };
    Snapshot {
        timestamp,
        system,
        processes: vec![process],
    }
}

#[test]
fn test_replay_file_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");

    let first = snapshot(1005.0);
    let second = snapshot(1010.0);
    {
        let mut writer = ReplayWriter::create(&path).unwrap();
        writer.append(&first).unwrap();
        writer.append(&second).unwrap();
    }

    let loaded = load(&path).unwrap();
    assert_eq!(loaded, vec![first, second]);
}

#[test]
fn test_replay_is_one_snapshot_per_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    let mut writer = ReplayWriter::create(&path).unwrap();
    writer.append(&snapshot(1005.0)).unwrap();
    writer.append(&snapshot(1010.0)).unwrap();
    drop(writer);

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);
}

#[test]
fn test_blank_lines_are_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    let mut writer = ReplayWriter::create(&path).unwrap();
    writer.append(&snapshot(1005.0)).unwrap();
    drop(writer);

    let mut content = fs::read_to_string(&path).unwrap();
    content.push('\n');
    fs::write(&path, content).unwrap();

    let loaded = load(&path).unwrap();
    assert_eq!(loaded.len(), 1);
}

#[test]
fn test_malformed_lines_name_their_line_number() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.jsonl");
    let mut writer = ReplayWriter::create(&path).unwrap();
    writer.append(&snapshot(1005.0)).unwrap();
    drop(writer);

    let mut content = fs::read_to_string(&path).unwrap();
    content.push_str("{not json\n");
    fs::write(&path, content).unwrap();

    let error = load(&path).unwrap_err();
    assert!(error.to_string().contains("line 2"), "got: {error}");
}

#[test]
fn test_missing_replay_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.jsonl");
    assert!(load(&path).is_err());
}
