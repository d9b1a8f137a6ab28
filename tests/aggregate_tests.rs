use std::collections::{BTreeMap, HashSet};

use usagemon::aggregate::{GroupWindow, SystemWindow, UserTable};
use usagemon::filter::GroupSelector;
use usagemon::measure::{ProcessMeasurement, SystemMeasurement};

fn process(
    pid: u32,
    username: Option<&str>,
    command: &[&str],
    cpu: f64,
    mem: f64,
    time_start: f64,
    time_end: f64,
) -> ProcessMeasurement {
    ProcessMeasurement {
        pid,
        username: username.map(str::to_string),
        time_start,
        time_end,
        cpu_usage: cpu,
        mem_usage: mem,
        command: if command.is_empty() {
            None
        } else {
            Some(command.iter().map(|s| s.to_string()).collect())
        },
        create_time: Some(50),
    }
}

fn system(cpu: f64, mem: f64, users: &[&str], time_start: f64, time_end: f64) -> SystemMeasurement {
    SystemMeasurement {
        time_start,
        time_end,
        cpu_usage: cpu,
        mem_usage: mem,
        users: users.iter().map(|s| s.to_string()).collect(),
        user_processes: HashSet::new(),
    }
}

#[test]
fn test_system_average_is_weighted_by_duration() {
    let mut window = SystemWindow::new();
    window.add_measurement(system(1.0, 0.5, &[], 0.0, 10.0));
    window.add_measurement(system(0.0, 0.5, &[], 10.0, 40.0));
    // 1.0 for 10s and 0.0 for 30s averages to 0.25, not 0.5.
    assert!((window.average_cpu_usage() - 0.25).abs() < 1e-9);
    assert!((window.average_mem_usage() - 0.5).abs() < 1e-9);
}

#[test]
fn test_empty_system_window_reads_as_zero() {
    let window = SystemWindow::new();
    assert_eq!(window.average_cpu_usage(), 0.0);
    assert_eq!(window.average_mem_usage(), 0.0);
    assert_eq!(window.peak_cpu_usage(), 0.0);
    assert_eq!(window.users(), 0);
    assert!(window.record("node1").is_none());
}

#[test]
fn test_zero_duration_measurements_average_to_zero() {
    let mut window = SystemWindow::new();
    window.add_measurement(system(0.8, 0.4, &[], 5.0, 5.0));
    // A zero-length span must not divide by zero.
    assert_eq!(window.average_cpu_usage(), 0.0);
}

#[test]
fn test_system_peaks_and_user_union() {
    let mut window = SystemWindow::new();
    window.add_measurement(system(0.2, 0.3, &["alice", "bob"], 0.0, 5.0));
    window.add_measurement(system(0.9, 0.1, &["alice"], 5.0, 10.0));
    assert!((window.peak_cpu_usage() - 0.9).abs() < 1e-9);
    assert!((window.peak_mem_usage() - 0.3).abs() < 1e-9);
    assert_eq!(window.users(), 2);
}

#[test]
fn test_system_record_spans_the_window() {
    let mut window = SystemWindow::new();
    window.add_measurement(system(0.5, 0.5, &[], 1000.0, 1005.0));
    window.add_measurement(system(0.5, 0.5, &[], 1005.0, 1010.0));
    let record = window.record("node1").unwrap();
    assert_eq!(record.hostname, "node1");
    assert_eq!(record.time_start.timestamp(), 1000);
    assert_eq!(record.time_end.timestamp(), 1010);
}

#[test]
fn test_system_window_reset_clears_everything() {
    let mut window = SystemWindow::new();
    window.add_measurement(system(0.5, 0.5, &[], 0.0, 5.0));
    window.reset();
    assert!(window.is_empty());
    assert!(window.record("node1").is_none());
}

#[test]
fn test_group_window_merges_matching_processes_per_tick() {
    let mut window = GroupWindow::new(None, GroupSelector::AllProcesses);
    let a = process(1, Some("alice"), &["vim"], 0.2, 0.1, 0.0, 5.0);
    let b = process(2, Some("alice"), &["make"], 0.3, 0.1, 0.0, 5.0);
    window.add_measurements(&[&a, &b]);
    // One merged measurement per tick, usage summed.
    assert!((window.average_cpu_usage() - 0.5).abs() < 1e-9);
    assert!((window.peak_cpu_usage() - 0.5).abs() < 1e-9);
}

#[test]
fn test_group_window_ignores_ticks_without_matches() {
    let selector = GroupSelector::Commands(
        usagemon::filter::CommandFilter::new(["vim"]).unwrap(),
    );
    let mut window = GroupWindow::new(Some("editors".to_string()), selector);

    let vim = process(1, Some("alice"), &["/usr/bin/vim"], 0.4, 0.1, 0.0, 5.0);
    window.add_measurements(&[&vim]);

    let make = process(2, Some("alice"), &["make"], 0.8, 0.1, 5.0, 10.0);
    window.add_measurements(&[&make]);

    // The second tick matched nothing, so it does not dilute the average.
    assert!((window.average_cpu_usage() - 0.4).abs() < 1e-9);
    let record = window.record("node1", Some("alice")).unwrap();
    assert_eq!(record.time_end.timestamp(), 5);
}

#[test]
fn test_group_window_counts_distinct_identities() {
    let mut window = GroupWindow::new(None, GroupSelector::AllProcesses);

    // The same process over two ticks counts once.
    let first = process(1, Some("alice"), &["vim"], 0.1, 0.1, 0.0, 5.0);
    window.add_measurements(&[&first]);
    let second = process(1, Some("alice"), &["vim"], 0.1, 0.1, 5.0, 10.0);
    window.add_measurements(&[&second]);
    assert_eq!(window.processes(), 1);

    // A recycled pid with a new creation time counts separately.
    let mut recycled = process(1, Some("alice"), &["vim"], 0.1, 0.1, 10.0, 15.0);
    recycled.create_time = Some(99);
    window.add_measurements(&[&recycled]);
    assert_eq!(window.processes(), 2);
}

#[test]
fn test_empty_group_window_produces_no_record() {
    let window = GroupWindow::new(None, GroupSelector::AllProcesses);
    assert!(window.record("node1", Some("alice")).is_none());
    assert_eq!(window.average_cpu_usage(), 0.0);
}

#[test]
fn test_user_table_routes_to_groups_and_catch_all() {
    let mut groups = BTreeMap::new();
    groups.insert("editors".to_string(), vec!["vim".to_string()]);
    let mut table = UserTable::new(&groups).unwrap();

    let vim = process(1, Some("alice"), &["/usr/bin/vim"], 0.2, 0.1, 100.0, 105.0);
    let firefox = process(2, Some("alice"), &["firefox"], 0.4, 0.2, 100.0, 105.0);
    table.add_measurements(Some("alice".to_string()), &[&vim, &firefox]);

    let records = table.records("node1");
    assert_eq!(records.len(), 2);

    let editors = &records[0];
    assert_eq!(editors.user.as_deref(), Some("alice"));
    assert_eq!(editors.group.as_deref(), Some("editors"));
    assert!((editors.average_cpu_usage - 0.2).abs() < 1e-9);

    // The catch-all group has no name and covers both processes.
    let catch_all = &records[1];
    assert_eq!(catch_all.user.as_deref(), Some("alice"));
    assert_eq!(catch_all.group, None);
    assert!((catch_all.average_cpu_usage - 0.6).abs() < 1e-9);
    assert_eq!(catch_all.processes, 2);
}

#[test]
fn test_anonymous_owner_gets_only_the_catch_all() {
    let mut groups = BTreeMap::new();
    groups.insert("editors".to_string(), vec!["vim".to_string()]);
    let mut table = UserTable::new(&groups).unwrap();

    // A below-threshold process, even one matching a group filter.
    let vim = process(1, None, &["/usr/bin/vim"], 0.2, 0.1, 100.0, 105.0);
    table.add_measurements(None, &[&vim]);

    let records = table.records("node1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user, None);
    assert_eq!(records[0].group, None);
}

#[test]
fn test_user_table_orders_records_stably() {
    let mut groups = BTreeMap::new();
    groups.insert("editors".to_string(), vec!["vim".to_string()]);
    let mut table = UserTable::new(&groups).unwrap();

    let anon = process(1, None, &["kworker"], 0.1, 0.1, 100.0, 105.0);
    let bob = process(2, Some("bob"), &["vim"], 0.1, 0.1, 100.0, 105.0);
    let alice = process(3, Some("alice"), &["vim"], 0.1, 0.1, 100.0, 105.0);
    table.add_measurements(None, &[&anon]);
    table.add_measurements(Some("bob".to_string()), &[&bob]);
    table.add_measurements(Some("alice".to_string()), &[&alice]);

    let owners: Vec<Option<String>> = table
        .records("node1")
        .into_iter()
        .map(|r| r.user)
        .collect();
    // Anonymous first, then users alphabetically, groups before catch-all.
    assert_eq!(
        owners,
        vec![
            None,
            Some("alice".to_string()),
            Some("alice".to_string()),
            Some("bob".to_string()),
            Some("bob".to_string()),
        ]
    );
}

#[test]
fn test_user_table_reset_forgets_users() {
    let mut groups = BTreeMap::new();
    groups.insert("editors".to_string(), vec!["vim".to_string()]);
    let mut table = UserTable::new(&groups).unwrap();

    let vim = process(1, Some("alice"), &["vim"], 0.2, 0.1, 100.0, 105.0);
    table.add_measurements(Some("alice".to_string()), &[&vim]);
    table.reset();
    assert!(table.records("node1").is_empty());
}

#[test]
fn test_group_without_rules_is_a_configuration_error() {
    let mut groups = BTreeMap::new();
    groups.insert("broken".to_string(), Vec::new());
    assert!(UserTable::new(&groups).is_err());
}
