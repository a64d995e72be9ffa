use linklock::config::LockConfig;
use linklock::locking::{LockRecord, sweep_stale_peers};
use linklock::Lockfile;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> LockConfig {
    LockConfig::default()
        .with_sleep(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .with_polling(4, Duration::from_millis(5))
        .with_refresh(None)
        .with_max_age(None)
}

fn current_host() -> String {
    LockRecord::for_current_process(None).host
}

/// Spawns and reaps a trivial child so its pid is known to be dead.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

fn plant_staging(dir: &Path, name: &str, record: &LockRecord) {
    fs::write(dir.join(name), record.encode()).unwrap();
}

fn peer_record(host: &str, pid: u32) -> LockRecord {
    LockRecord {
        host: host.to_string(),
        pid,
        ppid: 1,
        tid: 0,
        time: Utc::now(),
        refresh: None,
    }
}

#[test]
fn crashed_peer_debris_is_removed_before_acquiring() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("x.lock");
    let host = current_host();
    let pid = dead_pid();

    // What a peer killed mid-acquire leaves behind: a staging file named
    // by the documented pattern, holding its metadata record.
    let debris = format!("x.lock.{host}.{pid}.7.3.1700000000000000000.deadbeef");
    plant_staging(temp.path(), &debris, &peer_record(&host, pid));

    let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();
    lockfile.lock().unwrap();

    assert!(
        !temp.path().join(&debris).exists(),
        "debris must be gone before the first polling phase"
    );
    lockfile.unlock().unwrap();
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn live_and_foreign_entries_survive_the_sweep() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("x.lock");
    let host = current_host();

    let ours = format!("x.lock.{host}.{pid}.0.1.2.cafe", pid = std::process::id());
    plant_staging(
        temp.path(),
        &ours,
        &peer_record(&host, std::process::id()),
    );

    let foreign = "x.lock.other-host.example.org.12345.0.1.2.beef";
    plant_staging(
        temp.path(),
        foreign,
        &peer_record("other-host.example.org", 12345),
    );

    let report = sweep_stale_peers(&target);
    assert_eq!(report.removed, 0);
    assert!(temp.path().join(&ours).exists());
    assert!(temp.path().join(foreign).exists());
}

#[test]
fn corrupt_records_are_treated_as_hostile() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("x.lock");
    let host = current_host();
    let pid = dead_pid();

    let name = format!("x.lock.{host}.{pid}.0.1.2.feed");
    fs::write(temp.path().join(&name), b"\x00\x01 not a record").unwrap();

    let report = sweep_stale_peers(&target);
    assert_eq!(report.removed, 0);
    assert!(temp.path().join(&name).exists());
}

#[test]
fn sweep_leaves_the_lockfile_alone() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("x.lock");
    fs::write(&target, b"held elsewhere").unwrap();

    let report = sweep_stale_peers(&target);
    assert_eq!(report.removed, 0);
    assert!(target.exists());
}

#[test]
fn dont_sweep_skips_debris_removal() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("x.lock");
    let host = current_host();
    let pid = dead_pid();

    let debris = format!("x.lock.{host}.{pid}.0.1.2.dead");
    plant_staging(temp.path(), &debris, &peer_record(&host, pid));

    let config = fast_config().with_dont_sweep(true);
    let mut lockfile = Lockfile::new(&target, config).unwrap();
    lockfile.lock().unwrap();
    assert!(temp.path().join(&debris).exists());
    lockfile.unlock().unwrap();
}
