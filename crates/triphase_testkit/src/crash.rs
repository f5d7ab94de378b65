//! Crash simulation for durable stores.
//!
//! [`CrashableStore`] wraps a [`MemoryStore`] and stops working after a
//! chosen number of appends, the way a process dies between two log
//! writes. Everything synced before that point survives; a
//! [`CrashableStore::reboot`] hands back a fresh store over the surviving
//! bytes.
//!
//! Logs append exactly one frame per record, so "crash after `n` appends"
//! means "crash after `n` log records".
//!
//! ## Usage
//!
//! ```rust
//! use triphase_storage::DurableStore;
//! use triphase_testkit::CrashableStore;
//!
//! let mut store = CrashableStore::new();
//! store.crash_after_appends(1);
//!
//! store.append(b"first").unwrap();
//! store.sync().unwrap();
//! assert!(store.append(b"second").is_err());
//! assert!(store.has_crashed());
//!
//! let rebooted = store.reboot();
//! assert_eq!(rebooted.len().unwrap(), 5);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use triphase_storage::{DurableStore, MemoryStore, StorageError, StorageResult};

#[derive(Debug)]
struct CrashSwitch {
    /// Appends allowed before the crash; `usize::MAX` means never.
    crash_after: AtomicUsize,
    appends: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl Default for CrashSwitch {
    fn default() -> Self {
        Self {
            crash_after: AtomicUsize::new(usize::MAX),
            appends: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }
}

/// A store that can be made to crash at a chosen point.
///
/// Clones share both the image and the crash switch, so a test can keep a
/// handle while the log owns another.
#[derive(Debug, Clone, Default)]
pub struct CrashableStore {
    inner: MemoryStore,
    switch: Arc<CrashSwitch>,
}

impl CrashableStore {
    /// Creates an empty store that never crashes until told to.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing image.
    #[must_use]
    pub fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            switch: Arc::default(),
        }
    }

    /// Lets `n` more appends through, then crashes on the next one.
    pub fn crash_after_appends(&self, n: usize) {
        let done = self.switch.appends.load(Ordering::SeqCst);
        self.switch
            .crash_after
            .store(done.saturating_add(n), Ordering::SeqCst);
    }

    /// Makes every later `sync` crash the store.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.switch.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Crashes the store right now.
    pub fn crash_now(&self) {
        self.switch.crashed.store(true, Ordering::SeqCst);
    }

    /// Returns true once the store has crashed.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.switch.crashed.load(Ordering::SeqCst)
    }

    /// Returns how many appends have succeeded.
    #[must_use]
    pub fn appends(&self) -> usize {
        self.switch
            .appends
            .load(Ordering::SeqCst)
            .min(self.switch.crash_after.load(Ordering::SeqCst))
    }

    /// Returns the underlying image.
    #[must_use]
    pub fn image(&self) -> &MemoryStore {
        &self.inner
    }

    /// Drops unsynced bytes and returns a healthy store over what survived.
    ///
    /// The returned store has its own crash switch; this one stays crashed.
    #[must_use]
    pub fn reboot(&self) -> Self {
        self.crash_now();
        self.inner.simulate_crash();
        Self::wrap(self.inner.clone())
    }

    fn check(&self) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(StorageError::Unavailable("store has crashed".into()));
        }
        Ok(())
    }
}

impl DurableStore for CrashableStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check()?;
        let n = self.switch.appends.fetch_add(1, Ordering::SeqCst);
        if n >= self.switch.crash_after.load(Ordering::SeqCst) {
            self.crash_now();
            return Err(StorageError::Unavailable("simulated crash before append".into()));
        }
        self.inner.append(data)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check()?;
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            self.crash_now();
            return Err(StorageError::Unavailable("simulated crash during sync".into()));
        }
        self.inner.sync()
    }

    fn len(&self) -> StorageResult<u64> {
        self.inner.len()
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        self.check()?;
        self.inner.truncate(new_len)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.check()?;
        self.inner.replace(data)
    }
}
