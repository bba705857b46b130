//! Periodic maintenance workers: scheduled flushing of all sets and
//! unmapping of cold sets.
//!
//! Both workers tick every 250 ms and checkpoint with the manager on
//! every tick so the vacuum thread can make progress even while a sweep
//! is idle, re-checkpointing every 64 sets during long sweeps. Errors
//! from individual sets are ignored; a set may legitimately disappear
//! mid-sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::manager::SetManager;

const PERIODIC_TICK: Duration = Duration::from_millis(250);
const TICKS_PER_SEC: u64 = 4;

/// Force a checkpoint after this many per-set operations.
const PERIODIC_CHECKPOINT: usize = 64;

/// Starts the scheduled flush worker, or returns `None` when
/// `flush_interval` is 0.
pub fn start_flush_worker(
    mgr: Arc<SetManager>,
    should_run: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let interval = mgr.config().flush_interval;
    if interval == 0 {
        return None;
    }

    let handle = thread::Builder::new()
        .name("hlld-flush".to_string())
        .spawn(move || flush_main(mgr, should_run, interval))
        .expect("failed to spawn flush thread");
    Some(handle)
}

/// Starts the cold unmap worker, or returns `None` when
/// `cold_interval` is 0.
pub fn start_cold_unmap_worker(
    mgr: Arc<SetManager>,
    should_run: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let interval = mgr.config().cold_interval;
    if interval == 0 {
        return None;
    }

    let handle = thread::Builder::new()
        .name("hlld-cold".to_string())
        .spawn(move || cold_unmap_main(mgr, should_run, interval))
        .expect("failed to spawn cold unmap thread");
    Some(handle)
}

fn flush_main(mgr: Arc<SetManager>, should_run: Arc<AtomicBool>, interval: u64) {
    mgr.client_checkpoint();
    info!(interval_secs = interval, "Flush thread started");

    let mut ticks: u64 = 0;
    while should_run.load(Ordering::Relaxed) {
        thread::sleep(PERIODIC_TICK);
        mgr.client_checkpoint();
        ticks += 1;
        if ticks % (interval * TICKS_PER_SEC) != 0 || !should_run.load(Ordering::Relaxed) {
            continue;
        }

        let start = Instant::now();
        info!("Scheduled flush started");

        let names = mgr.list_sets(None);
        for (i, name) in names.iter().enumerate() {
            // Ignore errors: sets may get dropped mid-sweep.
            let _ = mgr.flush_set(name);
            if (i + 1) % PERIODIC_CHECKPOINT == 0 {
                mgr.client_checkpoint();
            }
        }

        info!(
            sets = names.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Scheduled flush finished"
        );
    }
    mgr.client_leave();
}

fn cold_unmap_main(mgr: Arc<SetManager>, should_run: Arc<AtomicBool>, interval: u64) {
    mgr.client_checkpoint();
    info!(interval_secs = interval, "Cold unmap thread started");

    let mut ticks: u64 = 0;
    while should_run.load(Ordering::Relaxed) {
        thread::sleep(PERIODIC_TICK);
        mgr.client_checkpoint();
        ticks += 1;
        if ticks % (interval * TICKS_PER_SEC) != 0 || !should_run.load(Ordering::Relaxed) {
            continue;
        }

        let start = Instant::now();
        info!("Cold unmap started");

        let names = mgr.list_cold_sets();
        for (i, name) in names.iter().enumerate() {
            debug!(set = %name, "Unmapping cold set");
            let _ = mgr.unmap_set(name);
            if (i + 1) % PERIODIC_CHECKPOINT == 0 {
                mgr.client_checkpoint();
            }
        }

        info!(
            sets = names.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cold unmap finished"
        );
    }
    mgr.client_leave();
}
