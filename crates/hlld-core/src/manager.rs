//! MVCC directory of named sets.
//!
//! Two directory snapshots (primary and alternate) map names to set
//! wrappers. Mutations never touch the primary in place: `create`,
//! `drop` and `clear` append entries to a singly-linked delta log under
//! the writer mutex, and readers resolve a name against the delta log
//! (newest first) before falling back to the primary snapshot, so reads
//! take no locks.
//!
//! The vacuum worker reconciles applied deltas into the alternate
//! snapshot, swaps it in, and then issues a version barrier: clients
//! publish the version they have observed at every checkpoint, and no
//! retired snapshot or delta node is reclaimed until every client has
//! checkpointed past the barrier. That fence is what makes the
//! lock-free walk of the primary and the delta log sound.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use walkdir::WalkDir;

use crate::config::{GlobalConfig, SetConfig};
use crate::set::{Set, SET_FOLDER_PREFIX};
use crate::{HlldError, Result};

/// Warn when this many versions cannot be vacuumed.
const WARN_THRESHOLD: u64 = 32;

/// Cadence of the vacuum thread's idle poll.
const VACUUM_POLL: Duration = Duration::from_secs(1);

/// Sleep while waiting for clients to cross a version barrier.
const BARRIER_POLL: Duration = Duration::from_millis(500);

/// Wraps a set with the directory-level state: visibility, the cold
/// sweep hint, the reclamation policy, and the lock that serializes
/// page-outs against readers.
pub struct SetWrapper {
    set: Set,
    /// Cleared when a delete or clear is pending; inactive wrappers are
    /// still discoverable so callers can distinguish "delete in
    /// progress" from "not found".
    active: AtomicBool,
    /// Touched since the last cold sweep.
    hot: AtomicBool,
    /// Whether reclamation removes the on-disk state.
    should_delete: AtomicBool,
    rwlock: RwLock<()>,
}

impl SetWrapper {
    fn new(set: Set, hot: bool) -> Self {
        Self {
            set,
            active: AtomicBool::new(true),
            hot: AtomicBool::new(hot),
            should_delete: AtomicBool::new(false),
            rwlock: RwLock::new(()),
        }
    }

    pub fn set(&self) -> &Set {
        &self.set
    }

    /// Close or delete the underlying set per the reclamation policy.
    fn cleanup(&self) {
        let res = if self.should_delete.load(Ordering::Relaxed) {
            self.set.delete()
        } else {
            self.set.close()
        };
        if let Err(e) = res {
            error!(set = self.set.name(), error = %e, "Failed to reclaim set");
        }
    }
}

type SetMap = BTreeMap<String, Arc<SetWrapper>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaKind {
    Create,
    Delete,
    Barrier,
}

/// Delta log node. `next` points at the next-older entry; it is written
/// when the node is pushed and again only when the vacuum thread cuts a
/// reclaimed tail.
struct DeltaNode {
    vsn: u64,
    kind: DeltaKind,
    name: String,
    wrapper: Option<Arc<SetWrapper>>,
    next: AtomicPtr<DeltaNode>,
}

struct ClientSlot {
    thread: ThreadId,
    /// Written only by the owning thread, read by the vacuum thread as
    /// a lower bound.
    vsn: AtomicU64,
}

pub struct SetManager {
    config: Arc<GlobalConfig>,

    /// The two directory snapshots. `maps[primary_idx]` is read-only
    /// for everyone; the other slot belongs to the vacuum thread
    /// between barrier points.
    maps: [UnsafeCell<SetMap>; 2],
    primary_idx: AtomicUsize,

    current_vsn: AtomicU64,
    /// Largest version reflected in the primary snapshot.
    primary_vsn: AtomicU64,

    /// Newest-first log of unapplied deltas.
    delta_head: AtomicPtr<DeltaNode>,

    /// Serializes create/drop/clear and delta pushes.
    write_lock: Mutex<()>,
    /// Serializes vacuum cycles (worker vs. forced).
    vacuum_lock: Mutex<()>,

    /// Names with a delete applied to the primary but not yet
    /// reclaimed; creates are refused for these.
    pending_deletes: Mutex<HashSet<String>>,

    clients: crate::sync::SpinLock<Vec<Arc<ClientSlot>>>,

    should_run: AtomicBool,
    vacuum_thread: Mutex<Option<JoinHandle<()>>>,
}

// The UnsafeCell snapshots are governed by the version barrier: all
// threads read only the primary slot, and the vacuum thread mutates a
// slot only after every client has checkpointed past the swap that
// retired it.
unsafe impl Sync for SetManager {}
unsafe impl Send for SetManager {}

impl SetManager {
    /// Builds the manager, discovering existing set directories under
    /// the data dir. `vacuum` starts the background vacuum thread;
    /// disable it only in tests or embeddings driving [`Self::vacuum`]
    /// by hand.
    pub fn new(config: Arc<GlobalConfig>, vacuum: bool) -> Result<Arc<SetManager>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let primary = load_existing_sets(&config);
        info!(sets = primary.len(), "Found existing sets");

        let mgr = Arc::new(SetManager {
            maps: [
                UnsafeCell::new(primary.clone()),
                UnsafeCell::new(primary),
            ],
            primary_idx: AtomicUsize::new(0),
            current_vsn: AtomicU64::new(0),
            primary_vsn: AtomicU64::new(0),
            delta_head: AtomicPtr::new(ptr::null_mut()),
            write_lock: Mutex::new(()),
            vacuum_lock: Mutex::new(()),
            pending_deletes: Mutex::new(HashSet::new()),
            clients: crate::sync::SpinLock::new(Vec::new()),
            should_run: AtomicBool::new(true),
            vacuum_thread: Mutex::new(None),
            config,
        });

        if vacuum {
            let weak = Arc::downgrade(&mgr);
            let handle = thread::Builder::new()
                .name("hlld-vacuum".to_string())
                .spawn(move || vacuum_main(weak))
                .map_err(|e| HlldError::Internal(format!("failed to start vacuum thread: {e}")))?;
            *mgr.vacuum_thread.lock().unwrap() = Some(handle);
        }

        Ok(mgr)
    }

    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// Publishes the caller's observed version so the vacuum thread can
    /// advance its horizon. Call periodically, and before other calls.
    pub fn client_checkpoint(&self) {
        let id = thread::current().id();
        let vsn = self.current_vsn.load(Ordering::Acquire);

        let mut clients = self.clients.lock();
        if let Some(slot) = clients.iter().find(|c| c.thread == id) {
            slot.vsn.store(vsn, Ordering::Release);
            return;
        }
        clients.push(Arc::new(ClientSlot {
            thread: id,
            vsn: AtomicU64::new(vsn),
        }));
    }

    /// Deregisters the calling thread from the client registry.
    pub fn client_leave(&self) {
        let id = thread::current().id();
        self.clients.lock().retain(|c| c.thread != id);
    }

    /// Creates a new set. Fails while a delete of the same name is
    /// still pending.
    pub fn create_set(&self, name: &str, custom: Option<SetConfig>) -> Result<()> {
        let _write = self.write_lock.lock().unwrap();

        if let Some(wrapper) = self.find(name) {
            return Err(if wrapper.active.load(Ordering::Relaxed) {
                HlldError::AlreadyExists
            } else {
                HlldError::DeleteInProgress
            });
        }
        if self.pending_deletes.lock().unwrap().contains(name) {
            warn!(set = name, "Tried to create set with a pending delete");
            return Err(HlldError::DeleteInProgress);
        }

        let set = Set::open(self.config.clone(), custom, name, true)
            .map_err(|e| HlldError::Internal(format!("failed to initialize set '{name}': {e}")))?;
        let wrapper = Arc::new(SetWrapper::new(set, true));
        self.push_delta(DeltaKind::Create, name.to_string(), Some(wrapper));
        Ok(())
    }

    /// Removes the set from the directory and, once reclaimed, from
    /// disk.
    pub fn drop_set(&self, name: &str) -> Result<()> {
        let _write = self.write_lock.lock().unwrap();

        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        wrapper.active.store(false, Ordering::Relaxed);
        wrapper.should_delete.store(true, Ordering::Relaxed);
        self.push_delta(DeltaKind::Delete, name.to_string(), Some(wrapper));
        Ok(())
    }

    /// Forgets a proxied set without touching its on-disk state, so a
    /// later create rediscovers it. Refused while resident.
    pub fn clear_set(&self, name: &str) -> Result<()> {
        let _write = self.write_lock.lock().unwrap();

        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        if !wrapper.set.is_proxied() {
            return Err(HlldError::NotProxied);
        }
        wrapper.active.store(false, Ordering::Relaxed);
        wrapper.should_delete.store(false, Ordering::Relaxed);
        self.push_delta(DeltaKind::Delete, name.to_string(), Some(wrapper));
        Ok(())
    }

    pub fn flush_set(&self, name: &str) -> Result<()> {
        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        let _read = wrapper.rwlock.read().unwrap();
        wrapper.set.flush()
    }

    /// Estimated cardinality of the set.
    pub fn set_size(&self, name: &str) -> Result<u64> {
        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        let _read = wrapper.rwlock.read().unwrap();
        wrapper.hot.store(true, Ordering::Relaxed);
        Ok(wrapper.set.size())
    }

    /// Adds keys to the set, stopping at the first failure.
    pub fn add_keys(&self, name: &str, keys: &[&str]) -> Result<()> {
        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        let _read = wrapper.rwlock.read().unwrap();

        for key in keys {
            wrapper
                .set
                .add(key)
                .map_err(|e| HlldError::Internal(format!("add to set '{name}' failed: {e}")))?;
        }
        wrapper.hot.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Pages the set out of memory. It stays registered and faults back
    /// in on the next add.
    pub fn unmap_set(&self, name: &str) -> Result<()> {
        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        let _write = wrapper.rwlock.write().unwrap();
        wrapper.set.close()
    }

    /// Runs a callback against the set, protected from deletion for the
    /// duration. Intended for reading counters and metadata.
    pub fn with_set<F, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Set) -> T,
    {
        let wrapper = self.take(name).ok_or(HlldError::NotFound)?;
        let _read = wrapper.rwlock.read().unwrap();
        Ok(f(&wrapper.set))
    }

    /// Names of all visible sets, optionally filtered by prefix.
    /// Sorted.
    pub fn list_sets(&self, prefix: Option<&str>) -> Vec<String> {
        let matches = |name: &str| prefix.map_or(true, |p| name.starts_with(p));
        let mut out = BTreeSet::new();

        // Unapplied deltas decide first: the newest entry per name wins.
        let mut decided = HashSet::new();
        self.walk_delta(|node| {
            if node.kind == DeltaKind::Barrier || !decided.insert(node.name.clone()) {
                return false;
            }
            if node.kind == DeltaKind::Create && matches(&node.name) {
                out.insert(node.name.clone());
            }
            false
        });

        for (name, wrapper) in self.primary() {
            if wrapper.active.load(Ordering::Relaxed) && matches(name) && !decided.contains(name) {
                out.insert(name.clone());
            }
        }
        out.into_iter().collect()
    }

    /// Names of resident sets untouched since the previous sweep.
    /// Check-and-clear: a hot set is skipped and becomes eligible for
    /// the next sweep. Unapplied deltas are ignored (new creates are
    /// hot, pending deletes are irrelevant).
    pub fn list_cold_sets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, wrapper) in self.primary() {
            if wrapper.hot.swap(false, Ordering::Relaxed) {
                continue;
            }
            if wrapper.set.is_proxied() {
                continue;
            }
            out.push(name.clone());
        }
        out
    }

    /// Forces a full vacuum up to the current version, skipping the
    /// client barrier. Only safe when no other threads are using the
    /// manager; meant for tests and embeddings.
    pub fn vacuum(&self) {
        self.vacuum_cycle(true);
    }

    /// Resolves a name to its wrapper, inactive wrappers included.
    fn find(&self, name: &str) -> Option<Arc<SetWrapper>> {
        let mut found = None;
        self.walk_delta(|node| {
            if node.kind != DeltaKind::Barrier && node.name == name {
                found = node.wrapper.clone();
                return true;
            }
            false
        });
        if found.is_some() {
            return found;
        }
        self.primary().get(name).cloned()
    }

    /// As [`Self::find`], hiding inactive wrappers.
    fn take(&self, name: &str) -> Option<Arc<SetWrapper>> {
        self.find(name)
            .filter(|w| w.active.load(Ordering::Relaxed))
    }

    /// The primary snapshot. Sound to read without locks: the slot is
    /// only mutated by the vacuum thread after a barrier has proven no
    /// client can still be reading it.
    fn primary(&self) -> &SetMap {
        let idx = self.primary_idx.load(Ordering::Acquire);
        unsafe { &*self.maps[idx].get() }
    }

    /// Walks unapplied delta entries newest-first, calling `f` until it
    /// returns true. The head pointer is snapshotted once; the walk
    /// stops at the boundary entry (`vsn == primary_vsn + 1`) without
    /// ever dereferencing past it, because older nodes may already be
    /// reclaimed.
    fn walk_delta<F: FnMut(&DeltaNode) -> bool>(&self, mut f: F) {
        let primary_vsn = self.primary_vsn.load(Ordering::Acquire);
        let mut cur = self.delta_head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.vsn <= primary_vsn || f(node) || node.vsn == primary_vsn + 1 {
                break;
            }
            cur = node.next.load(Ordering::Acquire);
        }
    }

    /// Appends a delta entry at the next version. Caller holds
    /// `write_lock`.
    fn push_delta(&self, kind: DeltaKind, name: String, wrapper: Option<Arc<SetWrapper>>) {
        let vsn = self.current_vsn.load(Ordering::Relaxed) + 1;
        let node = Box::into_raw(Box::new(DeltaNode {
            vsn,
            kind,
            name,
            wrapper,
            next: AtomicPtr::new(self.delta_head.load(Ordering::Relaxed)),
        }));
        self.delta_head.store(node, Ordering::Release);
        self.current_vsn.store(vsn, Ordering::Release);
        debug!(vsn, ?kind, "Appended delta");
    }

    fn min_client_vsn(&self) -> Option<u64> {
        self.clients
            .lock()
            .iter()
            .map(|c| c.vsn.load(Ordering::Acquire))
            .min()
    }

    /// One reconciliation cycle. `forced` applies everything up to the
    /// current version and skips the barrier wait.
    fn vacuum_cycle(&self, forced: bool) {
        let _vacuum = self.vacuum_lock.lock().unwrap();

        let primary_vsn = self.primary_vsn.load(Ordering::Acquire);
        let current_vsn = self.current_vsn.load(Ordering::Acquire);
        if current_vsn == primary_vsn {
            return;
        }

        // A lone barrier needs no reconciliation.
        if current_vsn - primary_vsn == 1 {
            let head = self.delta_head.load(Ordering::Acquire);
            let node = unsafe { head.as_ref() };
            if node.map_or(false, |n| n.vsn == current_vsn && n.kind == DeltaKind::Barrier) {
                self.primary_vsn.store(current_vsn, Ordering::Release);
                return;
            }
        }

        let min_vsn = if forced {
            current_vsn
        } else {
            self.min_client_vsn()
                .unwrap_or(current_vsn)
                .min(current_vsn)
        };
        if current_vsn - min_vsn > WARN_THRESHOLD {
            warn!(
                current = current_vsn,
                minimum = min_vsn,
                "Many concurrent versions detected! Either slow clients or too many changes"
            );
        }
        if min_vsn <= primary_vsn {
            return;
        }

        // Collect the applicable window, newest first.
        let mut window: Vec<*const DeltaNode> = Vec::new();
        self.walk_delta(|node| {
            if node.vsn <= min_vsn {
                window.push(node as *const DeltaNode);
            }
            false
        });

        // Reconcile the alternate snapshot.
        let primary_idx = self.primary_idx.load(Ordering::Acquire);
        let alt_idx = 1 - primary_idx;
        // The alternate slot is exclusively ours between barriers.
        apply_window(&window, unsafe { &mut *self.maps[alt_idx].get() });

        // Block re-creates of names whose delete is applied but whose
        // wrapper is not yet reclaimed.
        let mut reclaim = Vec::new();
        {
            let mut pending = self.pending_deletes.lock().unwrap();
            for &ptr in &window {
                let node = unsafe { &*ptr };
                if node.kind == DeltaKind::Delete {
                    pending.insert(node.name.clone());
                    reclaim.push(node.wrapper.clone().expect("delete delta has a wrapper"));
                }
            }
        }

        // Swap the reconciled snapshot in.
        self.primary_idx.store(alt_idx, Ordering::Release);
        self.primary_vsn.store(min_vsn, Ordering::Release);
        debug!(vsn = min_vsn, "Installed primary snapshot");

        // Fence: no memory behind the old primary may be reclaimed
        // until every client has observed a version past the swap.
        let barrier_vsn = {
            let _write = self.write_lock.lock().unwrap();
            self.push_delta(DeltaKind::Barrier, String::new(), None);
            self.current_vsn.load(Ordering::Acquire)
        };
        if !forced {
            loop {
                match self.min_client_vsn() {
                    None => break,
                    Some(v) if v >= barrier_vsn => break,
                    Some(_) => {}
                }
                if !self.should_run.load(Ordering::Relaxed) {
                    // Shutting down; leave reclamation to Drop.
                    return;
                }
                thread::sleep(BARRIER_POLL);
            }
        }

        // Converge the retired snapshot and reclaim.
        apply_window(&window, unsafe { &mut *self.maps[primary_idx].get() });
        for wrapper in reclaim {
            wrapper.cleanup();
        }
        self.pending_deletes.lock().unwrap().clear();
        self.free_applied_deltas(min_vsn);
    }

    /// Unlinks and frees delta nodes with `vsn <= min_vsn`. Runs after
    /// barrier convergence; readers provably stop at the boundary node
    /// and never reach the freed tail.
    fn free_applied_deltas(&self, min_vsn: u64) {
        let mut cur = self.delta_head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.vsn == min_vsn + 1 {
                let mut dead = node.next.swap(ptr::null_mut(), Ordering::AcqRel);
                while !dead.is_null() {
                    let boxed = unsafe { Box::from_raw(dead) };
                    dead = boxed.next.load(Ordering::Relaxed);
                }
                return;
            }
            cur = node.next.load(Ordering::Acquire);
        }
    }
}

impl Drop for SetManager {
    fn drop(&mut self) {
        self.should_run.store(false, Ordering::Relaxed);
        if let Some(handle) = self.vacuum_thread.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        // Exclusive access from here on. Walk the delta log first: a
        // pending delete still removes its disk state, a pending create
        // is merely closed.
        let mut processed = HashSet::new();
        let mut cur = *self.delta_head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
            if let Some(wrapper) = node.wrapper {
                if processed.insert(Arc::as_ptr(&wrapper)) {
                    wrapper.cleanup();
                }
            }
        }

        // Close every remaining set; never delete from disk. Both
        // snapshots are swept since either may be the fresher one.
        for map in &self.maps {
            for wrapper in unsafe { &*map.get() }.values() {
                if processed.insert(Arc::as_ptr(wrapper)) {
                    if let Err(e) = wrapper.set.close() {
                        error!(set = wrapper.set.name(), error = %e, "Failed to close set");
                    }
                }
            }
        }
    }
}

/// Applies a delta window (newest first) to a snapshot. The newest
/// entry per name wins, so a create/delete pair collapses to its final
/// state.
fn apply_window(window: &[*const DeltaNode], map: &mut SetMap) {
    let mut decided = HashSet::new();
    for &ptr in window {
        let node = unsafe { &*ptr };
        if node.kind == DeltaKind::Barrier || !decided.insert(node.name.as_str()) {
            continue;
        }
        match node.kind {
            DeltaKind::Create => {
                let wrapper = node.wrapper.clone().expect("create delta has a wrapper");
                map.insert(node.name.clone(), wrapper);
            }
            DeltaKind::Delete => {
                map.remove(&node.name);
            }
            DeltaKind::Barrier => unreachable!(),
        }
    }
}

/// Boot-time discovery: open every `hlld.*` directory as a cold,
/// proxied set. Failures are logged and skipped so one bad set never
/// prevents startup.
fn load_existing_sets(config: &Arc<GlobalConfig>) -> SetMap {
    let mut map = SetMap::new();
    for entry in WalkDir::new(&config.data_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let folder = entry.file_name().to_string_lossy();
        if folder.len() <= SET_FOLDER_PREFIX.len() || !folder.starts_with(SET_FOLDER_PREFIX) {
            continue;
        }
        let name = &folder[SET_FOLDER_PREFIX.len()..];
        match Set::open(config.clone(), None, name, false) {
            Ok(set) => {
                map.insert(name.to_string(), Arc::new(SetWrapper::new(set, false)));
            }
            Err(e) => error!(set = name, error = %e, "Failed to load set"),
        }
    }
    map
}

/// Vacuum thread: reconcile whenever the primary lags the current
/// version. Holds only a weak handle so shutdown does not depend on it.
fn vacuum_main(mgr: Weak<SetManager>) {
    loop {
        thread::sleep(VACUUM_POLL);
        let Some(mgr) = mgr.upgrade() else {
            break;
        };
        if !mgr.should_run.load(Ordering::Relaxed) {
            break;
        }
        if mgr.current_vsn.load(Ordering::Acquire) != mgr.primary_vsn.load(Ordering::Acquire) {
            mgr.vacuum_cycle(false);
        }
    }
}
