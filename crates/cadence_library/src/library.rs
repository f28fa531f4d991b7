//! redb-backed media library
//!
//! Records are stored as JSON bytes in a single table keyed by the record id
//! in hyphenated form, which sorts the same way as the id itself. Enumeration
//! resumes strictly after the last key seen, so records that stop matching a
//! filter mid-run never shift later records out of reach.
//!
//! Jobs don't write directly: they stage updates and removals, and the batch
//! completion hook flushes everything in one write transaction.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use cadence_runtime::{RecordStore, StoreError, StoreResult};
use parking_lot::Mutex;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use uuid::Uuid;

use crate::error::{LibraryResult, db};
use crate::record::{MediaRecord, RecordFilter, RecordPatch};

// Key is the hyphenated record id, value is the JSON-encoded record
const MEDIA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media");

/// Writes waiting for the next commit
#[derive(Debug, Default)]
struct Staged {
    patches: BTreeMap<Uuid, RecordPatch>,
    removals: BTreeSet<Uuid>,
}

impl Staged {
    fn len(&self) -> usize {
        self.patches.len() + self.removals.len()
    }

    fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.removals.is_empty()
    }

    fn patch(&mut self, id: Uuid, patch: RecordPatch) {
        if patch.is_empty() || self.removals.contains(&id) {
            return;
        }
        match self.patches.entry(id) {
            Entry::Occupied(mut staged) => staged.get_mut().merge(patch),
            Entry::Vacant(slot) => {
                slot.insert(patch);
            }
        }
    }

    fn remove(&mut self, id: Uuid) {
        self.patches.remove(&id);
        self.removals.insert(id);
    }

    /// Put back writes from a failed commit underneath newer ones
    fn restore(&mut self, older: Staged) {
        for id in older.removals {
            self.remove(id);
        }
        for (id, mut patch) in older.patches {
            if self.removals.contains(&id) {
                continue;
            }
            if let Some(newer) = self.patches.remove(&id) {
                patch.merge(newer);
            }
            self.patches.insert(id, patch);
        }
    }
}

/// Persisted media collection
pub struct MediaLibrary {
    db: Database,
    path: Option<PathBuf>,
    staged: Mutex<Staged>,
}

impl MediaLibrary {
    /// Open (or create) the library at `path`
    pub fn open(path: impl AsRef<Path>) -> LibraryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database = Database::create(path).map_err(db)?;
        let library = Self::with_database(database, Some(path.to_path_buf()))?;

        let records = library.len()?;
        tracing::info!(path = %path.display(), records, "Opened media library");
        Ok(library)
    }

    /// A library that lives only as long as this value
    pub fn open_in_memory() -> LibraryResult<Self> {
        let database = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(db)?;
        Self::with_database(database, None)
    }

    fn with_database(database: Database, path: Option<PathBuf>) -> LibraryResult<Self> {
        // Ensure the table exists so read transactions can open it
        let txn = database.begin_write().map_err(db)?;
        txn.open_table(MEDIA_TABLE).map_err(db)?;
        txn.commit().map_err(db)?;

        Ok(Self {
            db: database,
            path,
            staged: Mutex::new(Staged::default()),
        })
    }

    /// Database file, if not in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or overwrite a record immediately
    pub fn insert(&self, record: &MediaRecord) -> LibraryResult<()> {
        self.insert_many(std::iter::once(record)).map(drop)
    }

    /// Insert records in one write transaction
    pub fn insert_many<'a>(&self, records: impl IntoIterator<Item = &'a MediaRecord>) -> LibraryResult<usize> {
        let txn = self.db.begin_write().map_err(db)?;
        let mut written = 0;
        {
            let mut table = txn.open_table(MEDIA_TABLE).map_err(db)?;
            for record in records {
                let bytes = serde_json::to_vec(record)?;
                table
                    .insert(record.id.to_string().as_str(), bytes.as_slice())
                    .map_err(db)?;
                written += 1;
            }
        }
        txn.commit().map_err(db)?;
        Ok(written)
    }

    /// Fetch a committed record
    pub fn get(&self, id: Uuid) -> LibraryResult<Option<MediaRecord>> {
        let txn = self.db.begin_read().map_err(db)?;
        let table = txn.open_table(MEDIA_TABLE).map_err(db)?;

        let key = id.to_string();
        let record = match table.get(key.as_str()).map_err(db)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Remove a record immediately; returns whether it existed
    pub fn remove(&self, id: Uuid) -> LibraryResult<bool> {
        let txn = self.db.begin_write().map_err(db)?;
        let existed = {
            let mut table = txn.open_table(MEDIA_TABLE).map_err(db)?;
            let key = id.to_string();
            table.remove(key.as_str()).map_err(db)?.is_some()
        };
        txn.commit().map_err(db)?;
        Ok(existed)
    }

    /// Number of committed records
    pub fn len(&self) -> LibraryResult<usize> {
        let txn = self.db.begin_read().map_err(db)?;
        let table = txn.open_table(MEDIA_TABLE).map_err(db)?;
        Ok(table.len().map_err(db)? as usize)
    }

    pub fn is_empty(&self) -> LibraryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// All committed records matching `filter`, in key order
    pub fn records(&self, filter: &RecordFilter) -> LibraryResult<Vec<MediaRecord>> {
        let mut out = Vec::new();
        self.scan(None, |record| {
            if filter.matches(&record) {
                out.push(record);
            }
            true
        })?;
        Ok(out)
    }

    /// Paths of every committed record
    pub fn known_paths(&self) -> LibraryResult<HashSet<PathBuf>> {
        let mut paths = HashSet::new();
        self.scan(None, |record| {
            paths.insert(record.path);
            true
        })?;
        Ok(paths)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Staged writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue field changes for the next `commit`
    ///
    /// Patches for the same record merge. A record already staged for
    /// removal stays removed.
    pub fn stage_update(&self, id: Uuid, patch: RecordPatch) {
        self.staged.lock().patch(id, patch);
    }

    /// Queue a removal for the next `commit`
    pub fn stage_remove(&self, id: Uuid) {
        self.staged.lock().remove(id);
    }

    /// Writes waiting for `commit`
    pub fn pending_writes(&self) -> usize {
        self.staged.lock().len()
    }

    /// Flush staged writes in one transaction
    ///
    /// Patches are applied to the record as stored at commit time; patches
    /// for records that no longer exist are dropped. Returns the number of
    /// records written or removed. On failure the writes stay staged.
    pub fn commit(&self) -> LibraryResult<usize> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return Ok(0);
        }

        match self.apply(&staged) {
            Ok(applied) => {
                tracing::debug!(applied, "Committed staged library writes");
                Ok(applied)
            }
            Err(e) => {
                tracing::error!(error = %e, pending = staged.len(), "Failed to commit library writes");
                self.staged.lock().restore(staged);
                Err(e)
            }
        }
    }

    fn apply(&self, staged: &Staged) -> LibraryResult<usize> {
        let txn = self.db.begin_write().map_err(db)?;
        let mut applied = 0;
        {
            let mut table = txn.open_table(MEDIA_TABLE).map_err(db)?;
            for (id, patch) in &staged.patches {
                let key = id.to_string();
                let stored = table
                    .get(key.as_str())
                    .map_err(db)?
                    .map(|value| serde_json::from_slice::<MediaRecord>(value.value()))
                    .transpose()?;

                let Some(mut record) = stored else {
                    tracing::debug!(id = %id, "Dropping patch for removed record");
                    continue;
                };
                patch.apply(&mut record);
                let bytes = serde_json::to_vec(&record)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(db)?;
                applied += 1;
            }
            for id in &staged.removals {
                if table.remove(id.to_string().as_str()).map_err(db)?.is_some() {
                    applied += 1;
                }
            }
        }
        txn.commit().map_err(db)?;
        Ok(applied)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enumeration
    // ─────────────────────────────────────────────────────────────────────────

    /// Visit committed records with keys after `after`, in key order, until
    /// `visit` returns false
    ///
    /// Rows that fail to decode are logged and skipped, so one bad row never
    /// hides the rest of the library.
    fn scan<F>(&self, after: Option<Uuid>, mut visit: F) -> LibraryResult<()>
    where
        F: FnMut(MediaRecord) -> bool,
    {
        let txn = self.db.begin_read().map_err(db)?;
        let table = txn.open_table(MEDIA_TABLE).map_err(db)?;

        let after_key = after.map(|id| id.to_string());
        let start = match &after_key {
            Some(key) => Bound::Excluded(key.as_str()),
            None => Bound::Unbounded,
        };

        for entry in table.range::<&str>((start, Bound::Unbounded)).map_err(db)? {
            let (key, value) = entry.map_err(db)?;
            let record: MediaRecord = match serde_json::from_slice(value.value()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = key.value(), error = %e, "Skipping undecodable library record");
                    continue;
                }
            };
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MediaLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLibrary")
            .field("path", &self.path)
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

impl RecordStore for MediaLibrary {
    type Record = MediaRecord;
    type Filter = RecordFilter;

    fn count(&self, filter: &RecordFilter) -> StoreResult<usize> {
        let mut count = 0;
        self.scan(None, |record| {
            if filter.matches(&record) {
                count += 1;
            }
            true
        })?;
        Ok(count)
    }

    fn fetch_batch(&self, filter: &RecordFilter, after: Option<&Uuid>, limit: usize) -> StoreResult<Vec<MediaRecord>> {
        let mut batch = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(batch);
        }

        self.scan(after.copied(), |record| {
            if filter.matches(&record) {
                batch.push(record);
            }
            batch.len() < limit
        })?;
        Ok(batch)
    }

    fn commit(&self) -> StoreResult<()> {
        MediaLibrary::commit(self).map(drop).map_err(StoreError::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
