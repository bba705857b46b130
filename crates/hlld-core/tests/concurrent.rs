//! Concurrency tests: parallel writers against one set, and the full
//! create/drop/vacuum cycle with the background vacuum thread running.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hlld_core::{GlobalConfig, HlldError, SetManager};

fn manager_at(dir: &Path, vacuum: bool) -> Arc<SetManager> {
    let config = Arc::new(GlobalConfig {
        data_dir: dir.to_path_buf(),
        ..GlobalConfig::default()
    });
    SetManager::new(config, vacuum).unwrap()
}

#[test]
fn test_concurrent_adds_count_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager_at(dir.path(), false);
    mgr.create_set("conc", None).unwrap();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 2000;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let mgr = mgr.clone();
        handles.push(std::thread::spawn(move || {
            mgr.client_checkpoint();
            let keys: Vec<String> = (0..PER_THREAD).map(|i| format!("t{t}-k{i}")).collect();
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            for chunk in refs.chunks(100) {
                mgr.add_keys("conc", chunk).unwrap();
                mgr.client_checkpoint();
            }
            mgr.client_leave();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Every successful add is counted exactly once.
    let counters = mgr.with_set("conc", |s| s.counters()).unwrap();
    assert_eq!(counters.sets, (THREADS * PER_THREAD) as u64);

    // 8000 distinct keys at the default precision sit in the
    // small-range correction zone, which is accurate well inside the
    // configured error bound.
    let size = mgr.set_size("conc").unwrap() as f64;
    let n = (THREADS * PER_THREAD) as f64;
    assert!((size - n).abs() / n <= 0.02, "estimate {size}");
}

#[test]
fn test_drop_and_recreate_with_vacuum_thread() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager_at(dir.path(), true);
    mgr.client_checkpoint();

    mgr.create_set("cycle", None).unwrap();
    mgr.add_keys("cycle", &["a", "b"]).unwrap();
    mgr.drop_set("cycle").unwrap();

    // Recreation is refused until the vacuum thread has reclaimed the
    // dropped wrapper; keep checkpointing so it can.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        mgr.client_checkpoint();
        match mgr.create_set("cycle", None) {
            Ok(()) => break,
            Err(HlldError::DeleteInProgress) => {
                assert!(Instant::now() < deadline, "vacuum never reclaimed the set");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // The old disk state was removed with the drop.
    assert_eq!(mgr.set_size("cycle").unwrap(), 0);
    mgr.client_leave();
}

#[test]
fn test_readers_race_writer_churn() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager_at(dir.path(), true);

    for i in 0..8 {
        mgr.create_set(&format!("base{i}"), None).unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut handles = Vec::new();

    // Readers hammer find/list while the writer churns the directory.
    for _ in 0..3 {
        let mgr = mgr.clone();
        let stop = stop.clone();
        handles.push(std::thread::spawn(move || {
            mgr.client_checkpoint();
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                for i in 0..8 {
                    let _ = mgr.set_size(&format!("base{i}"));
                }
                let _ = mgr.list_sets(Some("base"));
                mgr.client_checkpoint();
            }
            mgr.client_leave();
        }));
    }

    {
        let mgr = mgr.clone();
        let stop = stop.clone();
        handles.push(std::thread::spawn(move || {
            mgr.client_checkpoint();
            for round in 0..20 {
                let name = format!("churn{}", round % 4);
                match mgr.create_set(&name, None) {
                    Ok(()) | Err(HlldError::AlreadyExists) | Err(HlldError::DeleteInProgress) => {}
                    Err(e) => panic!("create failed: {e}"),
                }
                let _ = mgr.add_keys(&name, &["x", "y"]);
                match mgr.drop_set(&name) {
                    Ok(()) | Err(HlldError::NotFound) => {}
                    Err(e) => panic!("drop failed: {e}"),
                }
                mgr.client_checkpoint();
                std::thread::sleep(Duration::from_millis(50));
            }
            mgr.client_leave();
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    // The base population survived the churn.
    let names = mgr.list_sets(Some("base"));
    assert_eq!(names.len(), 8);
}
