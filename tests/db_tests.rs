use chrono::DateTime;
use tempfile::tempdir;
use usagemon::db::{Database, SystemRecord, UserRecord, UtilizationSink};

fn system_record() -> SystemRecord {
    SystemRecord {
        hostname: "node1".to_string(),
        time_start: DateTime::from_timestamp(1000, 0).unwrap(),
        time_end: DateTime::from_timestamp(1300, 0).unwrap(),
        average_cpu_usage: 0.25,
        average_mem_usage: 0.5,
        peak_cpu_usage: 0.75,
        peak_mem_usage: 0.6,
        users: 2,
        user_processes: 5,
    }
}

fn user_record(user: Option<&str>, group: Option<&str>) -> UserRecord {
    UserRecord {
        hostname: "node1".to_string(),
        user: user.map(str::to_string),
        group: group.map(str::to_string),
        time_start: DateTime::from_timestamp(1000, 0).unwrap(),
        time_end: DateTime::from_timestamp(1300, 0).unwrap(),
        average_cpu_usage: 0.1,
        average_mem_usage: 0.2,
        peak_cpu_usage: 0.3,
        peak_mem_usage: 0.4,
        processes: 3,
    }
}

#[test]
fn test_create_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();
    assert!(db_path.exists());
}

#[test]
fn test_init_schema_is_idempotent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();
    db.init_schema().unwrap();
}

#[test]
fn test_commit_and_query_records() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let mut db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();

    let system = system_record();
    let users = vec![
        user_record(Some("alice"), Some("editors")),
        user_record(Some("alice"), None),
    ];
    db.commit(&system, &users).unwrap();

    let stored_system = db.system_records().unwrap();
    assert_eq!(stored_system, vec![system]);

    let stored_users = db.user_records().unwrap();
    assert_eq!(stored_users, users);
}

#[test]
fn test_null_user_and_group_roundtrip() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let mut db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();

    // The anonymous owner's catch-all record has neither user nor group.
    db.commit(&system_record(), &[user_record(None, None)]).unwrap();

    let stored = db.user_records().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].user, None);
    assert_eq!(stored[0].group, None);
}

#[test]
fn test_commits_accumulate_in_order() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let mut db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();

    let mut second = system_record();
    second.time_start = DateTime::from_timestamp(1300, 0).unwrap();
    second.time_end = DateTime::from_timestamp(1600, 0).unwrap();

    db.commit(&system_record(), &[]).unwrap();
    db.commit(&second, &[]).unwrap();

    let stored = db.system_records().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].time_start.timestamp(), 1000);
    assert_eq!(stored[1].time_start.timestamp(), 1300);
}

#[test]
fn test_open_creates_parent_directories() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested/dir/test.db");
    let db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();
    assert!(db_path.exists());
}
