//! A named set: a lazily-faulted HLL sketch plus its persisted per-set
//! configuration and counters.
//!
//! A set is either *proxied* (known, nothing resident; size queries are
//! served from the last flushed estimate) or *resident* (live sketch).
//! The first `add` after open faults the registers in; `close` pages
//! them back out. Each set owns a directory `hlld.<name>/` under the
//! data dir holding `config.ini` and, unless in-memory, `registers.mmap`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bitmap::{Bitmap, BitmapMode};
use crate::config::{GlobalConfig, SetConfig};
use crate::hll::{self, Hll};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::{HlldError, Result};

/// Every set directory under the data dir carries this prefix.
pub const SET_FOLDER_PREFIX: &str = "hlld.";

const DATA_FILE_NAME: &str = "registers.mmap";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Directory for a set of the given name.
pub fn set_dir(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{SET_FOLDER_PREFIX}{name}"))
}

/// Point-in-time snapshot of a set's counters. May be internally
/// inconsistent under concurrent mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetCounters {
    /// Successful adds over the set's lifetime in this process.
    pub sets: u64,
    pub page_ins: u64,
    pub page_outs: u64,
}

#[derive(Default)]
struct Counters {
    sets: AtomicU64,
    page_ins: AtomicU64,
    page_outs: AtomicU64,
}

pub struct Set {
    name: String,
    full_path: PathBuf,
    global: Arc<GlobalConfig>,
    /// Settings snapshotted at creation; precision is immutable for the
    /// set's lifetime.
    set_config: SetConfig,
    /// Last flushed estimate, serving size queries while proxied.
    size_estimate: AtomicU64,
    dirty: AtomicBool,
    counters: Counters,
    /// Resident state. Register updates happen under this lock.
    hll: SpinLock<Option<Hll>>,
    /// Serializes fault-in and page-out, keeping their I/O out of the
    /// spin sections.
    fault_lock: Mutex<()>,
}

impl Set {
    /// Opens a set, creating its directory and `config.ini` on first
    /// instantiation. With `discover` the registers are faulted in
    /// immediately; otherwise the set starts proxied.
    pub fn open(
        global: Arc<GlobalConfig>,
        custom: Option<SetConfig>,
        name: &str,
        discover: bool,
    ) -> Result<Set> {
        let mut set_config = custom.unwrap_or_else(|| SetConfig::from_global(&global));
        let full_path = set_dir(&global.data_dir, name);
        fs::create_dir_all(&full_path)?;

        let config_path = full_path.join(CONFIG_FILE_NAME);
        let mut first_instance = false;
        match set_config.merge_from_file(&config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => first_instance = true,
            Err(e) => {
                error!(set = name, error = %e, "Failed to read set configuration");
                return Err(e.into());
            }
        }

        let set = Set {
            name: name.to_string(),
            full_path,
            global,
            size_estimate: AtomicU64::new(set_config.size),
            set_config,
            dirty: AtomicBool::new(true),
            counters: Counters::default(),
            hll: SpinLock::new(None),
            fault_lock: Mutex::new(()),
        };

        if discover {
            if let Err(e) = set.fault_in() {
                error!(set = name, error = %e, "Failed to fault in set");
                return Err(e);
            }
            set.flush()?;
        } else if first_instance {
            // Write the config now so a later discovery pass finds it.
            set.write_config(set.set_config.size)?;
        }

        Ok(set)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn config(&self) -> &SetConfig {
        &self.set_config
    }

    pub fn in_memory(&self) -> bool {
        self.set_config.in_memory
    }

    pub fn counters(&self) -> SetCounters {
        SetCounters {
            sets: self.counters.sets.load(Ordering::Relaxed),
            page_ins: self.counters.page_ins.load(Ordering::Relaxed),
            page_outs: self.counters.page_outs.load(Ordering::Relaxed),
        }
    }

    pub fn is_proxied(&self) -> bool {
        self.hll.lock().is_none()
    }

    /// Adds a key, faulting the set in first if needed. The hash is
    /// computed before any lock is taken.
    pub fn add(&self, key: &str) -> Result<()> {
        let hash = hll::hash_key(key.as_bytes());
        let mut guard = self.resident_guard()?;
        guard
            .as_mut()
            .expect("resident guard holds a sketch")
            .add_hash(hash);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Estimated cardinality. Never faults the set in.
    pub fn size(&self) -> u64 {
        match &*self.hll.lock() {
            Some(hll) => hll.estimate() as u64,
            None => self.size_estimate.load(Ordering::Relaxed),
        }
    }

    /// Bytes consumed by the register bitmap (or that it would consume
    /// once faulted in).
    pub fn byte_size(&self) -> u64 {
        match &*self.hll.lock() {
            Some(hll) => hll.byte_size(),
            None => hll::bytes_for_precision(self.set_config.default_precision),
        }
    }

    /// Persists the estimate and the registers. No-op while proxied or
    /// clean.
    pub fn flush(&self) -> Result<()> {
        let guard = self.hll.lock();
        let Some(hll) = &*guard else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.flush_resident(hll)
    }

    /// Pages the set out: flush, drop the sketch, release the bitmap.
    pub fn close(&self) -> Result<()> {
        let _fault = self.fault_lock.lock().unwrap();
        let Some(hll) = self.hll.lock().take() else {
            return Ok(());
        };

        if self.dirty.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.flush_resident(&hll) {
                warn!(set = %self.name, error = %e, "Failed to flush set during close");
            }
        }
        let res = hll.into_bitmap().close();
        self.counters.page_outs.fetch_add(1, Ordering::Relaxed);
        res
    }

    /// Closes the set and removes its on-disk state. Individual unlink
    /// failures are logged, not fatal.
    pub fn delete(&self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!(set = %self.name, error = %e, "Failed to close set before delete");
        }

        match fs::read_dir(&self.full_path) {
            Ok(entries) => {
                let entries: Vec<_> = entries.flatten().collect();
                info!(set = %self.name, files = entries.len(), "Deleting set files");
                for entry in entries {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        error!(path = %entry.path().display(), error = %e, "Failed to delete");
                    }
                }
            }
            Err(e) => error!(set = %self.name, error = %e, "Failed to scan set directory"),
        }

        if let Err(e) = fs::remove_dir(&self.full_path) {
            error!(path = %self.full_path.display(), error = %e, "Failed to delete");
        }
        Ok(())
    }

    /// Faults the registers in if proxied.
    pub fn fault_in(&self) -> Result<()> {
        self.resident_guard().map(drop)
    }

    /// Returns the register lock with the sketch guaranteed resident,
    /// faulting it in (outside the spin section) when needed.
    fn resident_guard(&self) -> Result<SpinLockGuard<'_, Option<Hll>>> {
        let guard = self.hll.lock();
        if guard.is_some() {
            return Ok(guard);
        }
        drop(guard);

        let _fault = self.fault_lock.lock().unwrap();
        let guard = self.hll.lock();
        if guard.is_some() {
            // Another thread faulted in while we waited.
            return Ok(guard);
        }
        drop(guard);

        let (hll, paged_in) = self.build_hll()?;
        let mut guard = self.hll.lock();
        *guard = Some(hll);
        if paged_in {
            self.counters.page_ins.fetch_add(1, Ordering::Relaxed);
        }
        Ok(guard)
    }

    /// Builds the sketch per the configured backing mode. Returns the
    /// sketch and whether an existing register file was paged in.
    fn build_hll(&self) -> Result<(Hll, bool)> {
        let precision = self.set_config.default_precision;
        let bytes = hll::bytes_for_precision(precision);
        if bytes == 0 {
            return Err(HlldError::InvalidArgument(format!(
                "precision {precision} out of range"
            )));
        }

        if self.set_config.in_memory {
            return Ok((Hll::from_bitmap(precision, Bitmap::anonymous(bytes)?)?, false));
        }

        let mode = if self.global.use_mmap {
            BitmapMode::Shared
        } else {
            BitmapMode::Persistent
        };
        let path = self.full_path.join(DATA_FILE_NAME);

        let (bitmap, paged_in) = match fs::metadata(&path) {
            Ok(md) => {
                info!(path = %path.display(), "Discovered HLL register file");
                (Bitmap::open_path(&path, md.len(), false, mode)?, true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "Creating HLL register file");
                (Bitmap::open_path(&path, bytes, true, mode)?, false)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to stat register file");
                return Err(e.into());
            }
        };

        Ok((Hll::from_bitmap(precision, bitmap)?, paged_in))
    }

    /// Writes the estimate into `config.ini` and syncs the registers.
    /// Caller holds the register lock (or owns the sketch).
    fn flush_resident(&self, hll: &Hll) -> Result<()> {
        let start = Instant::now();

        let estimate = hll.estimate() as u64;
        self.size_estimate.store(estimate, Ordering::Relaxed);
        if let Err(e) = self.write_config(estimate) {
            warn!(set = %self.name, error = %e, "Failed to write set configuration");
        }

        hll.bitmap().flush()?;
        debug!(
            set = %self.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flushed set"
        );
        Ok(())
    }

    fn write_config(&self, size: u64) -> Result<()> {
        let mut config = self.set_config.clone();
        config.size = size;
        config
            .write_to_file(&self.full_path.join(CONFIG_FILE_NAME))
            .map_err(HlldError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_global(dir: &Path) -> Arc<GlobalConfig> {
        Arc::new(GlobalConfig {
            data_dir: dir.to_path_buf(),
            ..GlobalConfig::default()
        })
    }

    #[test]
    fn test_open_proxied_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global, None, "foo", false).unwrap();
        assert!(set.is_proxied());
        assert!(set_dir(dir.path(), "foo").join("config.ini").is_file());
        assert!(!set_dir(dir.path(), "foo").join("registers.mmap").exists());
    }

    #[test]
    fn test_open_discover_creates_registers() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global, None, "foo", true).unwrap();
        assert!(!set.is_proxied());

        let registers = set_dir(dir.path(), "foo").join("registers.mmap");
        assert_eq!(
            fs::metadata(&registers).unwrap().len(),
            hll::bytes_for_precision(12)
        );
        assert_eq!(set.byte_size(), hll::bytes_for_precision(12));
    }

    #[test]
    fn test_add_faults_in() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global, None, "foo", false).unwrap();
        assert!(set.is_proxied());

        set.add("a").unwrap();
        set.add("b").unwrap();
        set.add("c").unwrap();
        assert!(!set.is_proxied());
        assert_eq!(set.size(), 3);
        assert_eq!(set.counters().sets, 3);
        assert_eq!(set.counters().page_ins, 0);
    }

    #[test]
    fn test_flush_persists_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global.clone(), None, "foo", true).unwrap();
        for i in 0..1000 {
            set.add(&format!("key{i}")).unwrap();
        }
        set.flush().unwrap();

        let mut on_disk = SetConfig::from_global(&global);
        on_disk
            .merge_from_file(&set_dir(dir.path(), "foo").join("config.ini"))
            .unwrap();
        assert_eq!(on_disk.size, set.size());
    }

    #[test]
    fn test_close_then_reopen_preserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global.clone(), None, "foo", true).unwrap();
        for i in 0..1000 {
            set.add(&format!("key{i}")).unwrap();
        }
        let live = set.size();
        set.close().unwrap();
        assert!(set.is_proxied());
        assert_eq!(set.counters().page_outs, 1);
        // Proxied queries serve the flushed estimate.
        assert_eq!(set.size(), live);

        let set = Set::open(global, None, "foo", true).unwrap();
        assert_eq!(set.size(), live);
        assert_eq!(set.counters().page_ins, 1);
    }

    #[test]
    fn test_reopen_shared_mode() {
        let dir = tempfile::tempdir().unwrap();
        let global = Arc::new(GlobalConfig {
            data_dir: dir.path().to_path_buf(),
            use_mmap: true,
            ..GlobalConfig::default()
        });

        let set = Set::open(global.clone(), None, "foo", true).unwrap();
        for i in 0..500 {
            set.add(&format!("key{i}")).unwrap();
        }
        let live = set.size();
        set.close().unwrap();

        let set = Set::open(global, None, "foo", true).unwrap();
        assert_eq!(set.size(), live);
    }

    #[test]
    fn test_register_file_identical_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());
        let registers = set_dir(dir.path(), "foo").join("registers.mmap");

        let set = Set::open(global.clone(), None, "foo", true).unwrap();
        for i in 0..2000 {
            set.add(&format!("key{i}")).unwrap();
        }
        set.flush().unwrap();
        let before = fs::read(&registers).unwrap();

        set.close().unwrap();
        let set = Set::open(global, None, "foo", true).unwrap();
        set.flush().unwrap();
        drop(set);
        let after = fs::read(&registers).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_in_memory_set_has_no_registers_file() {
        let dir = tempfile::tempdir().unwrap();
        let global = Arc::new(GlobalConfig {
            data_dir: dir.path().to_path_buf(),
            in_memory: true,
            ..GlobalConfig::default()
        });

        let set = Set::open(global, None, "mem", true).unwrap();
        set.add("a").unwrap();
        set.add("b").unwrap();
        set.add("c").unwrap();
        assert_eq!(set.size(), 3);
        assert!(!set_dir(dir.path(), "mem").join("registers.mmap").exists());

        // Close flushes the estimate into config.ini; the registers are
        // gone but the size survives.
        set.close().unwrap();
        assert!(set.is_proxied());
        assert_eq!(set.size(), 3);
    }

    #[test]
    fn test_custom_config_precision() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());
        let custom = SetConfig {
            size: 0,
            default_eps: hll::error_for_precision(10).unwrap(),
            default_precision: 10,
            in_memory: false,
        };

        let set = Set::open(global.clone(), Some(custom), "small", true).unwrap();
        assert_eq!(set.byte_size(), 820);
        drop(set);

        // Reopened without the custom config, the persisted precision
        // still governs the set.
        let set = Set::open(global, None, "small", true).unwrap();
        assert_eq!(set.config().default_precision, 10);
        assert_eq!(set.byte_size(), 820);
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set = Set::open(global, None, "doomed", true).unwrap();
        set.add("a").unwrap();
        set.delete().unwrap();
        assert!(!set_dir(dir.path(), "doomed").exists());
    }

    #[test]
    fn test_mismatched_register_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());

        let set_path = set_dir(dir.path(), "bad");
        fs::create_dir_all(&set_path).unwrap();
        fs::write(set_path.join("registers.mmap"), vec![0u8; 100]).unwrap();

        let res = Set::open(global, None, "bad", true);
        assert!(matches!(res, Err(HlldError::SizeMismatch { .. })));
    }
}
