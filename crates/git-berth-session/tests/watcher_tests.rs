#![allow(missing_docs, clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use git_berth_core::ChangeEvent;
use git_berth_session::{ChangeWatcher, FileMonitor, WatchError};
use tempfile::TempDir;

/// Short coalescing window so tests settle quickly.
const WINDOW: Duration = Duration::from_millis(100);
/// Generous upper bound for one delivery on a loaded machine.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Long enough for a delivery that is never supposed to happen.
const QUIET_PERIOD: Duration = Duration::from_millis(600);

fn watch(root: &Path, excluded: Vec<PathBuf>) -> Result<(ChangeWatcher, Receiver<ChangeEvent>)> {
    let (tx, rx) = mpsc::channel();
    let watcher = ChangeWatcher::new(root, excluded, WINDOW, move |event| {
        let _ = tx.send(event);
    })?;
    Ok((watcher, rx))
}

/// Receives events until `name` shows up in one, or the deadline passes.
fn wait_for_path(rx: &Receiver<ChangeEvent>, name: &str) -> Result<ChangeEvent> {
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        ensure!(!remaining.is_zero(), "no delivery mentioning {name}");
        let event = rx.recv_timeout(remaining)?;
        if event.paths.iter().any(|path| path.ends_with(name)) {
            return Ok(event);
        }
    }
}

#[test]
fn test_reports_a_created_file() -> Result<()> {
    let dir = TempDir::new()?;
    let (watcher, rx) = watch(dir.path(), Vec::new())?;
    assert_eq!(watcher.root(), dir.path().canonicalize()?);

    fs::write(dir.path().join("created.txt"), "hello")?;
    let event = wait_for_path(&rx, "created.txt")?;
    assert!(!event.rescan);

    watcher.stop();
    Ok(())
}

#[test]
fn test_burst_of_writes_all_surface() -> Result<()> {
    let dir = TempDir::new()?;
    let (watcher, rx) = watch(dir.path(), Vec::new())?;

    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(dir.path().join(name), name)?;
    }

    // The burst may land in one batch or several; every file must be
    // reported eventually.
    let mut missing: Vec<&str> = vec!["a.txt", "b.txt", "c.txt"];
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    while !missing.is_empty() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        ensure!(!remaining.is_zero(), "still missing: {missing:?}");
        let event = rx.recv_timeout(remaining)?;
        missing.retain(|name| !event.paths.iter().any(|path| path.ends_with(name)));
    }

    watcher.stop();
    Ok(())
}

#[test]
fn test_excluded_subtree_stays_silent() -> Result<()> {
    let dir = TempDir::new()?;
    fs::create_dir(dir.path().join("skip"))?;
    let skipped = dir.path().join("skip").canonicalize()?;
    let (watcher, rx) = watch(dir.path(), vec![skipped.clone()])?;

    fs::write(skipped.join("inside.txt"), "ignored")?;
    assert!(
        rx.recv_timeout(QUIET_PERIOD).is_err(),
        "excluded-only changes must not produce a callback"
    );

    // The watch is still live for everything else.
    fs::write(dir.path().join("seen.txt"), "reported")?;
    let event = wait_for_path(&rx, "seen.txt")?;
    assert!(event.paths.iter().all(|path| !path.starts_with(&skipped)));

    watcher.stop();
    Ok(())
}

#[test]
fn test_stop_is_idempotent_and_final() -> Result<()> {
    let dir = TempDir::new()?;
    let (watcher, rx) = watch(dir.path(), Vec::new())?;

    watcher.stop();
    watcher.stop();

    fs::write(dir.path().join("late.txt"), "after stop")?;
    assert!(
        rx.recv_timeout(QUIET_PERIOD).is_err(),
        "no callback may run after stop returns"
    );
    Ok(())
}

#[test]
fn test_missing_root_is_reported_at_construction() {
    let Ok(dir) = TempDir::new() else {
        panic!("tempdir");
    };
    let result = ChangeWatcher::new(
        dir.path().join("does-not-exist"),
        Vec::new(),
        WINDOW,
        |_event| {},
    );
    assert!(matches!(result, Err(WatchError::RootAccess { .. })));
}

#[test]
fn test_file_monitor_follows_atomic_replacement() -> Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("packed-refs");
    fs::write(&target, "original")?;

    let (tx, rx) = mpsc::channel();
    let monitor = FileMonitor::new(&target, WINDOW, move || {
        let _ = tx.send(());
    })?;
    assert_eq!(monitor.path(), target);

    // Replace-by-rename, the way git rewrites this file.
    let staging = dir.path().join("packed-refs.lock");
    fs::write(&staging, "rewritten")?;
    fs::rename(&staging, &target)?;
    rx.recv_timeout(DELIVERY_TIMEOUT)?;

    // A direct rewrite of the same path still fires.
    fs::write(&target, "rewritten again")?;
    rx.recv_timeout(DELIVERY_TIMEOUT)?;

    monitor.stop();
    Ok(())
}

#[test]
fn test_file_monitor_ignores_sibling_files() -> Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("watched.txt");
    fs::write(&target, "original")?;

    let (tx, rx) = mpsc::channel();
    let monitor = FileMonitor::new(&target, WINDOW, move || {
        let _ = tx.send(());
    })?;

    fs::write(dir.path().join("unrelated.txt"), "noise")?;
    assert!(
        rx.recv_timeout(QUIET_PERIOD).is_err(),
        "sibling files must not trigger the callback"
    );

    fs::write(&target, "changed")?;
    rx.recv_timeout(DELIVERY_TIMEOUT)?;

    monitor.stop();
    Ok(())
}
