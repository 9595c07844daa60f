//! Data-retention manager.
//!
//! Bounds the on-disk footprint of the detection database and snapshot
//! directory. Each artifact family is cleaned in three steps: by age,
//! then by count, then by cumulative size with a 10 % hysteresis so the
//! size step does not thrash around the limit. Deletion failures are
//! logged and the loop proceeds.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

use crate::cloud::heartbeat::sleep_while_running;
use crate::config::DataRetentionConfig;
use crate::storage::database::DetectionDatabase;

/// How often the worker re-checks the per-artifact intervals.
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of the size limit targeted when trimming by size.
const SIZE_HYSTERESIS: f64 = 0.9;

/// Age/count/size limits for one snapshot family.
#[derive(Clone, Copy, Debug)]
pub struct FilePolicy {
    pub max_count: usize,
    pub max_size_mb: f64,
    pub retention_days: u32,
}

pub struct RetentionManager {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionManager {
    pub fn spawn(
        config: DataRetentionConfig,
        database: Option<Arc<DetectionDatabase>>,
        snapshot_dir: PathBuf,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let handle = std::thread::spawn(move || {
            run_loop(&config, database.as_deref(), &snapshot_dir, &worker_running);
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    config: &DataRetentionConfig,
    database: Option<&DetectionDatabase>,
    snapshot_dir: &Path,
    running: &Arc<AtomicBool>,
) {
    let db_interval = Duration::from_secs_f64(config.database.cleanup_interval_hours * 3600.0);
    let snap_interval = Duration::from_secs_f64(config.snapshots.cleanup_interval_hours * 3600.0);
    let mon_interval =
        Duration::from_secs_f64(config.monitoring_snapshots.cleanup_interval_hours * 3600.0);

    // Epoch start so each artifact gets one cleanup shortly after boot.
    let mut last_db: Option<Instant> = None;
    let mut last_snap: Option<Instant> = None;
    let mut last_mon: Option<Instant> = None;

    while running.load(Ordering::Relaxed) {
        let due = |last: &Option<Instant>, interval: Duration| {
            last.map_or(true, |t| t.elapsed() >= interval)
        };

        if due(&last_db, db_interval) {
            if let Some(db) = database {
                cleanup_database(db, config.database.retention_days, config.database.max_records);
            }
            last_db = Some(Instant::now());
        }
        if due(&last_snap, snap_interval) {
            let policy = FilePolicy {
                max_count: config.snapshots.max_count,
                max_size_mb: config.snapshots.max_size_mb,
                retention_days: config.snapshots.retention_days,
            };
            cleanup_event_snapshots(snapshot_dir, &policy);
            last_snap = Some(Instant::now());
        }
        if due(&last_mon, mon_interval) {
            let policy = FilePolicy {
                max_count: config.monitoring_snapshots.max_count,
                max_size_mb: config.monitoring_snapshots.max_size_mb,
                retention_days: config.monitoring_snapshots.retention_days,
            };
            cleanup_monitoring_snapshots(snapshot_dir, &policy);
            last_mon = Some(Instant::now());
        }

        sleep_while_running(CHECK_INTERVAL, running);
    }
}

/// Age cleanup, then count cleanup, then VACUUM if anything went.
pub fn cleanup_database(db: &DetectionDatabase, retention_days: u32, max_records: u64) -> u64 {
    let mut deleted = 0;
    if retention_days > 0 {
        match db.cleanup_old_records(retention_days) {
            Ok(n) => deleted += n,
            Err(e) => warn!("database age cleanup failed: {e}"),
        }
    }
    if max_records > 0 {
        match db.cleanup_excess_records(max_records) {
            Ok(n) => deleted += n,
            Err(e) => warn!("database count cleanup failed: {e}"),
        }
    }
    if deleted > 0 {
        info!("database cleanup deleted {deleted} records");
        if let Err(e) = db.vacuum() {
            warn!("database vacuum failed: {e}");
        }
    }
    deleted
}

/// Cleans event snapshots (`snapshot_*.jpg`, excluding monitoring ones).
pub fn cleanup_event_snapshots(dir: &Path, policy: &FilePolicy) -> usize {
    cleanup_files(dir, policy, "event snapshots", |name| {
        name.starts_with("snapshot_") && name.ends_with(".jpg")
    })
}

/// Cleans monitoring snapshots (`monitoring_snapshot_*.jpg`) with their
/// own limits. Event snapshots in the same directory are not touched.
pub fn cleanup_monitoring_snapshots(dir: &Path, policy: &FilePolicy) -> usize {
    cleanup_files(dir, policy, "monitoring snapshots", |name| {
        name.starts_with("monitoring_snapshot_") && name.ends_with(".jpg")
    })
}

fn cleanup_files(
    dir: &Path,
    policy: &FilePolicy,
    label: &str,
    matches: impl Fn(&str) -> bool,
) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("retention skipped, cannot read {}: {e}", dir.display());
            return 0;
        }
    };

    // (path, mtime, size), oldest first.
    let mut files: Vec<(PathBuf, SystemTime, u64)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            if !matches(&name) {
                return None;
            }
            let meta = e.metadata().ok()?;
            let mtime = meta.modified().ok()?;
            Some((e.path(), mtime, meta.len()))
        })
        .collect();
    files.sort_by_key(|(_, mtime, _)| *mtime);

    let mut deleted = 0;

    // 1. By age.
    if policy.retention_days > 0 {
        let cutoff = SystemTime::now() - Duration::from_secs(policy.retention_days as u64 * 86400);
        files.retain(|(path, mtime, _)| {
            if *mtime >= cutoff {
                return true;
            }
            if remove(path) {
                deleted += 1;
                false
            } else {
                true
            }
        });
    }

    // 2. By count.
    if policy.max_count > 0 && files.len() > policy.max_count {
        let excess = files.len() - policy.max_count;
        let victims: Vec<PathBuf> = files
            .drain(..excess)
            .map(|(path, _, _)| path)
            .collect();
        for path in victims {
            if remove(&path) {
                deleted += 1;
            }
        }
    }

    // 3. By cumulative size, trimming down to 90 % of the limit.
    if policy.max_size_mb > 0.0 {
        let limit = (policy.max_size_mb * 1024.0 * 1024.0) as u64;
        let mut total: u64 = files.iter().map(|(_, _, size)| size).sum();
        if total > limit {
            let target = (limit as f64 * SIZE_HYSTERESIS) as u64;
            let mut index = 0;
            while total > target && index < files.len() {
                let (path, _, size) = &files[index];
                if remove(path) {
                    total = total.saturating_sub(*size);
                    deleted += 1;
                }
                index += 1;
            }
        }
    }

    if deleted > 0 {
        info!("retention deleted {deleted} {label} in {}", dir.display());
    }
    deleted
}

fn remove(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to delete {}: {e}", path.display());
            false
        }
    }
}
