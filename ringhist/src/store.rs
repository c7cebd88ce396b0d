//! Series store for the ringhist metrics history engine.
//!
//! This module provides the top-level handle that ties series state, the
//! binary codec and a persistence [`Backend`] together.
//!
//! # Design
//!
//! The store acts as the central coordinator:
//! - Caches the last committed state of every series it has touched as an
//!   `Arc<Series>` snapshot
//! - Serializes writers per series with a dedicated mutex, while readers
//!   clone the current snapshot and never wait on an in-flight write
//! - Applies a sample to a private copy and swaps it in only after it has
//!   been persisted, so readers never observe a torn write
//! - Resolves create-if-absent races by re-opening on "already exists"
//! - Runs create, cold load and delete of a name under a per-name slot lock,
//!   never under the name map lock, so backend I/O on one series does not
//!   stall another
//! - Persists on every write (write-through), or marks the series dirty and
//!   flushes on [`SeriesStore::sync`] when a sync period is set (write-back)
//!
//! Operations on different series only contend on the short critical
//! sections of the name map. [`SeriesStore::delete_all`] is the exception:
//! it holds off creates and cold loads until the backend is cleared.
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use ringhist::backend::MemoryBackend;
//! use ringhist::schema::{DatasourceDef, SeriesDefinition};
//! use ringhist::store::SeriesStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SeriesStore::new(Arc::new(MemoryBackend::new()));
//!
//! let def = SeriesDefinition::new(60, 1_700_000_000)
//!     .with_datasource(DatasourceDef::gauge("memory.heap.used", 120))
//!     .with_default_archives();
//! store.create("solr.jvm", def)?;
//!
//! store.sample("solr.jvm", 1_700_000_060, [("memory.heap.used", 512.0)])?;
//! assert_eq!(store.last_update("solr.jvm")?, 1_700_000_060);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::codec;
use crate::error::{HistoryError, Result, StoreError};
use crate::schema::SeriesDefinition;
use crate::series::Series;

/// How many open/create rounds `open_or_create` tries before giving up.
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Default limit for [`SeriesStore::list`] callers that do not pass one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// One cached series.
#[derive(Debug)]
struct SeriesCell {
    /// Held for the whole read-modify-persist cycle of a write.
    writer: Mutex<()>,
    /// Last committed state.
    committed: RwLock<Arc<Series>>,
    /// Committed state not yet persisted (write-back mode only).
    dirty: AtomicBool,
    /// Set once the series has been deleted; the cell is then unreachable
    /// from the map but may still be held by in-flight callers.
    deleted: AtomicBool,
}

impl SeriesCell {
    fn new(series: Series) -> Self {
        Self {
            writer: Mutex::new(()),
            committed: RwLock::new(Arc::new(series)),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    fn snapshot(&self, name: &str) -> Result<Arc<Series>> {
        let series = Arc::clone(&*self.committed.read());
        if self.deleted.load(Ordering::Acquire) {
            return Err(not_found(name));
        }
        Ok(series)
    }
}

/// Thread-safe store of named series.
///
/// Share it behind an `Arc` between the collection scheduler and the admin
/// layer.
pub struct SeriesStore {
    backend: Arc<dyn Backend>,
    cells: RwLock<HashMap<String, Arc<SeriesCell>>>,
    /// Per-name locks for create, cold load and delete.
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Shared by slot holders, exclusive for `delete_all`.
    clearing: RwLock<()>,
    /// Seconds between write-back flushes; 0 means write-through.
    sync_period: u64,
    last_sync: Mutex<u64>,
}

impl std::fmt::Debug for SeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesStore")
            .field("cached", &self.cells.read().len())
            .field("sync_period", &self.sync_period)
            .finish_non_exhaustive()
    }
}

impl SeriesStore {
    /// Creates a write-through store over `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cells: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            clearing: RwLock::new(()),
            sync_period: 0,
            last_sync: Mutex::new(0),
        }
    }

    /// Switches to write-back mode: samples are persisted by
    /// [`sync`](Self::sync) / [`sync_if_due`](Self::sync_if_due) at most
    /// `seconds` apart instead of on every write. `0` keeps write-through.
    #[must_use]
    pub fn with_sync_period(mut self, seconds: u64) -> Self {
        self.sync_period = seconds;
        self
    }

    /// Creates a new series and persists it.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyExists`] if the name is cached or persisted
    /// - [`crate::error::DefinitionError`] if the definition is invalid
    /// - [`crate::error::BackendError`] if the backend fails
    pub fn create(&self, name: &str, def: SeriesDefinition) -> Result<Arc<Series>> {
        let series = Series::create(name, def)?;
        let bytes = codec::encode(&series);

        self.with_slot(name, || {
            if self.cells.read().contains_key(name) || self.backend.exists(name)? {
                return Err(StoreError::AlreadyExists {
                    name: name.to_string(),
                }
                .into());
            }
            self.backend.save(name, &bytes)?;

            let cell = Arc::new(SeriesCell::new(series));
            let snapshot = Arc::clone(&*cell.committed.read());
            self.cells.write().insert(name.to_string(), cell);
            info!(series = %name, "created series");
            Ok(snapshot)
        })
    }

    /// Opens an existing series and returns its committed state.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no such series exists
    /// - [`crate::error::CodecError`] if the persisted blob is corrupt
    /// - [`crate::error::BackendError`] if the backend fails
    pub fn open(&self, name: &str) -> Result<Arc<Series>> {
        self.cell(name)?.snapshot(name)
    }

    /// Opens `name`, creating it from `def()` if it does not exist.
    ///
    /// A concurrent creator winning the race is not an error: the store
    /// re-opens and returns the winner's series.
    ///
    /// # Errors
    ///
    /// - [`StoreError::CreateContended`] if the series kept appearing and
    ///   vanishing across three open/create rounds
    /// - any error from [`open`](Self::open) or [`create`](Self::create)
    ///   other than not-found / already-exists
    pub fn open_or_create<F>(&self, name: &str, def: F) -> Result<Arc<Series>>
    where
        F: Fn() -> SeriesDefinition,
    {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            match self.open(name) {
                Err(e) if e.is_not_found() => {}
                other => return other,
            }
            match self.create(name, def()) {
                Err(e) if e.is_already_exists() => {
                    debug!(series = %name, attempt, "lost create race, re-opening");
                }
                other => return other,
            }
        }
        Err(StoreError::CreateContended {
            name: name.to_string(),
            attempts: MAX_CREATE_ATTEMPTS,
        }
        .into())
    }

    /// Applies one sample to `name`.
    ///
    /// The sample is applied to a copy of the committed state, persisted
    /// (write-through) and only then made visible. On any error the
    /// committed state is unchanged.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the series does not exist or was deleted
    /// - [`crate::error::SampleError`] if the sample is rejected
    /// - [`crate::error::BackendError`] if persisting fails
    pub fn sample<'a, I>(&self, name: &str, timestamp: u64, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let cell = self.cell(name)?;
        let _writer = cell.writer.lock();
        if cell.deleted.load(Ordering::Acquire) {
            return Err(not_found(name));
        }

        let mut next = Series::clone(&cell.committed.read());
        next.sample(timestamp, values)?;

        if self.sync_period == 0 {
            self.backend.save(name, &codec::encode(&next))?;
        } else {
            cell.dirty.store(true, Ordering::Release);
        }
        *cell.committed.write() = Arc::new(next);
        Ok(())
    }

    /// Returns the last update time of `name`.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn last_update(&self, name: &str) -> Result<u64> {
        Ok(self.open(name)?.last_update())
    }

    /// Returns `true` if `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BackendError`] if the backend fails.
    pub fn exists(&self, name: &str) -> Result<bool> {
        if self.cells.read().contains_key(name) {
            return Ok(true);
        }
        self.backend.exists(name)
    }

    /// Returns up to `limit` series names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BackendError`] if the backend fails.
    pub fn list(&self, limit: usize) -> Result<Vec<String>> {
        self.backend.list(limit)
    }

    /// Deletes `name`.
    ///
    /// Waits for an in-flight write on the series to finish; readers that
    /// race with the delete get [`StoreError::NotFound`].
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the series does not exist
    /// - [`crate::error::BackendError`] if the backend fails
    pub fn delete(&self, name: &str) -> Result<()> {
        self.with_slot(name, || {
            // Flag first so readers get NotFound without waiting on the writer
            let cached = self.cells.read().get(name).map(Arc::clone);
            if let Some(cell) = &cached {
                cell.deleted.store(true, Ordering::Release);
                drop(cell.writer.lock());
            }
            let removed = self.backend.delete(name);
            self.cells.write().remove(name);
            let removed = removed?;

            if cached.is_none() && !removed {
                return Err(not_found(name));
            }
            info!(series = %name, "deleted series");
            Ok(())
        })
    }

    /// Deletes every series.
    ///
    /// Creates and cold loads wait until the backend has been cleared.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BackendError`] if the backend fails.
    pub fn delete_all(&self) -> Result<()> {
        let _clearing = self.clearing.write();
        let cached: Vec<Arc<SeriesCell>> = self.cells.read().values().map(Arc::clone).collect();
        for cell in &cached {
            cell.deleted.store(true, Ordering::Release);
        }
        for cell in &cached {
            drop(cell.writer.lock());
        }
        let result = self.backend.delete_all();
        self.cells.write().clear();
        result?;
        info!(cached = cached.len(), "deleted all series");
        Ok(())
    }

    /// Persists every series with unsaved samples.
    ///
    /// Every dirty series is attempted even if some fail.
    ///
    /// # Errors
    ///
    /// Returns the first [`crate::error::BackendError`] encountered; series
    /// that failed stay dirty and are retried by the next sync.
    pub fn sync(&self) -> Result<usize> {
        let cells: Vec<(String, Arc<SeriesCell>)> = self
            .cells
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), Arc::clone(cell)))
            .collect();

        let mut synced = 0;
        let mut first_error = None;
        for (name, cell) in cells {
            let _writer = cell.writer.lock();
            if cell.deleted.load(Ordering::Acquire) || !cell.dirty.load(Ordering::Acquire) {
                continue;
            }
            let bytes = codec::encode(&cell.committed.read());
            match self.backend.save(&name, &bytes) {
                Ok(()) => {
                    cell.dirty.store(false, Ordering::Release);
                    synced += 1;
                }
                Err(e) => {
                    warn!(series = %name, error = %e, "failed to sync series");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                if synced > 0 {
                    debug!(synced, "synced dirty series");
                }
                Ok(synced)
            }
        }
    }

    /// Runs [`sync`](Self::sync) if write-back is enabled and at least one
    /// sync period has passed since the last sync at `now`.
    ///
    /// # Errors
    ///
    /// Same as [`sync`](Self::sync).
    pub fn sync_if_due(&self, now: u64) -> Result<usize> {
        if self.sync_period == 0 {
            return Ok(0);
        }
        {
            let mut last_sync = self.last_sync.lock();
            if *last_sync != 0 && now.saturating_sub(*last_sync) < self.sync_period {
                return Ok(0);
            }
            *last_sync = now;
        }
        self.sync()
    }

    /// Returns the cached cell for `name`, loading it from the backend on a
    /// miss.
    fn cell(&self, name: &str) -> Result<Arc<SeriesCell>> {
        if let Some(cell) = self.cells.read().get(name) {
            return Ok(Arc::clone(cell));
        }

        // The slot keeps a concurrent delete from being undone by a load
        // that started before it.
        self.with_slot(name, || {
            if let Some(cell) = self.cells.read().get(name) {
                return Ok(Arc::clone(cell));
            }
            let bytes = self.backend.load(name)?.ok_or_else(|| not_found(name))?;
            let series = codec::decode(&bytes)?;
            let cell = Arc::new(SeriesCell::new(series));
            self.cells.write().insert(name.to_string(), Arc::clone(&cell));
            debug!(series = %name, "loaded series");
            Ok(cell)
        })
    }

    /// Runs `f` holding the slot lock of `name`.
    fn with_slot<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let _clearing = self.clearing.read();
        let slot = Arc::clone(self.slots.lock().entry(name.to_string()).or_default());
        let result = {
            let _slot = slot.lock();
            f()
        };

        let mut slots = self.slots.lock();
        drop(slot);
        if slots.get(name).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(name);
        }
        result
    }
}

fn not_found(name: &str) -> HistoryError {
    StoreError::NotFound {
        name: name.to_string(),
    }
    .into()
}
