//! Durable, per-collection record storage.
//!
//! Each collection is one append-only [`Segment`] plus an in-memory catalog
//! of its live records (offset, insertion sequence, vector, metadata). The
//! catalog is only ever changed under the collection's write lock and only
//! after the matching frame is on disk, so it is the materialized state of
//! the log rather than a cache of it. Documents stay on disk and are read
//! back per query.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, ValidationError};
use crate::filter::UserBloom;
use crate::index::TopK;
use crate::config::Manifest;
use crate::model::{CollectionKind, Filter, Metadata, Record};
use crate::storage::{LogEntry, Segment};
use crate::vector::Metric;

const EXPECTED_USERS: usize = 100_000;
const BLOOM_FP_RATE: f64 = 0.01;

#[derive(Debug)]
struct Slot {
    offset: u64,
    seq: u64,
    vector: Vec<f32>,
    metadata: Metadata,
}

/// Live records of one collection, rebuilt from the log on open.
#[derive(Debug)]
struct Catalog {
    slots: HashMap<String, Slot>,
    next_seq: u64,
    users: UserBloom,
    /// Frames in the log that no longer back a live record.
    dead_frames: u64,
    observed_dim: Option<usize>,
}

impl Catalog {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_seq: 0,
            users: UserBloom::new(EXPECTED_USERS, BLOOM_FP_RATE),
            dead_frames: 0,
            observed_dim: None,
        }
    }

    fn put(&mut self, offset: u64, record: Record) {
        // An overwrite keeps the original insertion position for tie-breaking.
        let seq = match self.slots.get(&record.id) {
            Some(prev) => {
                self.dead_frames += 1;
                prev.seq
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        if let Some(user_id) = record.metadata.user_id() {
            self.users.insert(user_id);
        }
        self.observed_dim.get_or_insert(record.vector.len());
        self.slots.insert(
            record.id,
            Slot {
                offset,
                seq,
                vector: record.vector,
                metadata: record.metadata,
            },
        );
    }

    fn remove(&mut self, ids: &[String]) {
        for id in ids {
            if self.slots.remove(id).is_some() {
                self.dead_frames += 1;
            }
        }
        self.dead_frames += 1;
    }

    fn clear(&mut self) {
        self.dead_frames += self.slots.len() as u64 + 1;
        self.slots.clear();
        self.users.reset();
    }

    /// `None` is an exact "no record of this user here".
    fn candidates<'a>(&'a self, filter: &'a Filter) -> Option<impl Iterator<Item = (&'a String, &'a Slot)> + 'a> {
        if let Some(user_id) = filter.user_id() {
            if !self.users.may_contain(user_id) {
                return None;
            }
        }
        Some(
            self.slots
                .iter()
                .filter(move |(_, slot)| filter.matches(&slot.metadata)),
        )
    }

    fn apply(&mut self, offset: u64, entry: LogEntry, segment: &Path) -> std::result::Result<(), StorageError> {
        match entry {
            LogEntry::Put(record) => {
                if let Some(dim) = self.observed_dim {
                    if record.vector.len() != dim {
                        return Err(StorageError::Corrupt {
                            segment: segment.display().to_string(),
                            offset,
                            reason: format!(
                                "record {} has dimension {}, segment uses {}",
                                record.id,
                                record.vector.len(),
                                dim
                            ),
                        });
                    }
                }
                self.put(offset, record);
            }
            LogEntry::Delete { ids } => self.remove(&ids),
            LogEntry::Clear => self.clear(),
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CollectionState {
    segment: Segment,
    catalog: Catalog,
}

#[derive(Debug)]
pub struct Collection {
    path: PathBuf,
    strict_durability: bool,
    state: RwLock<CollectionState>,
    #[cfg(test)]
    fail_deletes: AtomicBool,
}

/// Outcome of compacting one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub collection: CollectionKind,
    pub live_records: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl Collection {
    fn open(root: &Path, kind: CollectionKind, strict_durability: bool) -> Result<Self> {
        let path = root.join(format!("{}.seg", kind.name()));
        let mut catalog = Catalog::new();
        let segment = Segment::open(&path, strict_durability, |offset, entry| {
            catalog.apply(offset, entry, &path)
        })?;

        debug!(
            collection = %kind,
            live = catalog.slots.len(),
            dead_frames = catalog.dead_frames,
            "collection replayed"
        );

        Ok(Self {
            path,
            strict_durability,
            state: RwLock::new(CollectionState { segment, catalog }),
            #[cfg(test)]
            fail_deletes: AtomicBool::new(false),
        })
    }

    fn observed_dim(&self) -> Result<Option<usize>> {
        Ok(self.state.read().map_err(StorageError::from)?.catalog.observed_dim)
    }
}

/// The five collections of one deployment root.
#[derive(Debug)]
pub struct CollectionStore {
    root: PathBuf,
    metric: Metric,
    collections: Vec<Collection>,
    /// Deployment dimensionality, fixed by the first successful write.
    dimension: RwLock<Option<usize>>,
    manifest: RwLock<Manifest>,
}

impl CollectionStore {
    pub fn open(root: &Path, metric: Metric, strict_durability: bool) -> Result<Self> {
        fs::create_dir_all(root).map_err(StorageError::from)?;
        let mut manifest = Manifest::load_or_init(root, metric)?;
        let mut dimension = manifest.dimension;

        let mut collections = Vec::with_capacity(CollectionKind::ALL.len());
        for kind in CollectionKind::ALL {
            let collection = Collection::open(root, kind, strict_durability)?;
            if let Some(observed) = collection.observed_dim()? {
                match dimension {
                    None => dimension = Some(observed),
                    Some(expected) if expected != observed => {
                        return Err(StorageError::DimensionMismatch {
                            expected,
                            actual: observed,
                        }
                        .into())
                    }
                    Some(_) => {}
                }
            }
            collections.push(collection);
        }

        if manifest.dimension != dimension {
            manifest.dimension = dimension;
            manifest.store(root)?;
        }

        info!(
            root = %root.display(),
            %metric,
            dimension = ?dimension,
            "collection store opened"
        );

        Ok(Self {
            root: root.to_path_buf(),
            metric,
            collections,
            dimension: RwLock::new(dimension),
            manifest: RwLock::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> Result<Option<usize>> {
        Ok(*self.dimension.read().map_err(StorageError::from)?)
    }

    fn collection(&self, kind: CollectionKind) -> Result<&Collection> {
        self.collections
            .get(kind.slot())
            .ok_or_else(|| StorageError::CollectionNotFound(kind.name().to_string()).into())
    }

    /// Writes or overwrites `record` in `kind`.
    ///
    /// The first successful write of a deployment fixes its dimensionality;
    /// a mismatching vector afterwards fails and leaves the collection as it was.
    /// An overwrite must come from the record's current owner.
    pub fn upsert(&self, kind: CollectionKind, record: Record) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id").into());
        }
        if record.metadata.user_id().is_none() {
            return Err(ValidationError::MissingField("user_id").into());
        }
        if record.vector.is_empty() {
            return Err(ValidationError::MissingField("vector").into());
        }

        let collection = self.collection(kind)?;
        let mut state = collection.state.write().map_err(StorageError::from)?;

        if let Some(existing) = state.catalog.slots.get(&record.id) {
            if existing.metadata.user_id() != record.metadata.user_id() {
                return Err(ValidationError::OwnerMismatch { id: record.id }.into());
            }
        }

        if let Some(expected) = self.dimension()? {
            check_dim(expected, record.vector.len())?;
            return append_put(&mut state, record);
        }

        // First write of the deployment: serialize with other first writers.
        let mut dim = self.dimension.write().map_err(StorageError::from)?;
        if let Some(expected) = *dim {
            check_dim(expected, record.vector.len())?;
            return append_put(&mut state, record);
        }
        let actual = record.vector.len();
        append_put(&mut state, record)?;
        *dim = Some(actual);
        drop(dim);
        self.persist_dimension(actual);
        Ok(())
    }

    fn persist_dimension(&self, dimension: usize) {
        let Ok(mut manifest) = self.manifest.write() else {
            return;
        };
        manifest.dimension = Some(dimension);
        // The segments carry the dimension too, so a lost manifest update is recoverable.
        if let Err(e) = manifest.store(&self.root) {
            warn!(error = %e, "could not record dimension in manifest");
        }
    }

    pub fn get(&self, kind: CollectionKind, id: &str) -> Result<Option<Record>> {
        let state = self.collection(kind)?.state.read().map_err(StorageError::from)?;
        match state.catalog.slots.get(id) {
            Some(slot) => Ok(Some(state.segment.read_record(slot.offset)?)),
            None => Ok(None),
        }
    }

    /// Up to `k` records matching `filter`, nearest first, with their distance.
    pub fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<(Record, f32)>> {
        filter.validate()?;
        let Some(expected) = self.dimension()? else {
            return Ok(Vec::new());
        };
        check_dim(expected, vector.len())?;

        let state = self.collection(kind)?.state.read().map_err(StorageError::from)?;
        let Some(candidates) = state.catalog.candidates(filter) else {
            return Ok(Vec::new());
        };

        let mut top = TopK::new(k, self.metric);
        for (_, slot) in candidates {
            top.offer(vector, slot.seq, &slot.vector, slot.offset);
        }

        let mut hits = Vec::new();
        for (offset, distance) in top.into_sorted() {
            hits.push((state.segment.read_record(offset)?, distance));
        }
        Ok(hits)
    }

    /// Removes every record matching `filter` with a single log frame.
    pub fn delete_where(&self, kind: CollectionKind, filter: &Filter) -> Result<usize> {
        filter.validate()?;
        let collection = self.collection(kind)?;
        let mut state = collection.state.write().map_err(StorageError::from)?;

        #[cfg(test)]
        if collection.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected delete failure",
            ))
            .into());
        }

        let mut doomed: Vec<(u64, String)> = match state.catalog.candidates(filter) {
            Some(hits) => hits.map(|(id, slot)| (slot.seq, id.clone())).collect(),
            None => return Ok(0),
        };
        if doomed.is_empty() {
            return Ok(0);
        }
        doomed.sort_unstable();
        let ids: Vec<String> = doomed.into_iter().map(|(_, id)| id).collect();

        let entry = LogEntry::Delete { ids };
        state.segment.append(&entry)?;
        let LogEntry::Delete { ids } = entry else {
            return Ok(0);
        };
        state.catalog.remove(&ids);

        debug!(collection = %kind, removed = ids.len(), "delete_where");
        Ok(ids.len())
    }

    pub fn count(&self, kind: CollectionKind) -> Result<usize> {
        let state = self.collection(kind)?.state.read().map_err(StorageError::from)?;
        Ok(state.catalog.slots.len())
    }

    pub fn count_where(&self, kind: CollectionKind, filter: &Filter) -> Result<usize> {
        filter.validate()?;
        let state = self.collection(kind)?.state.read().map_err(StorageError::from)?;
        Ok(state.catalog.candidates(filter).map_or(0, Iterator::count))
    }

    pub fn clear(&self, kind: CollectionKind) -> Result<usize> {
        let mut state = self.collection(kind)?.state.write().map_err(StorageError::from)?;
        let removed = state.catalog.slots.len();
        state.segment.append(&LogEntry::Clear)?;
        state.catalog.clear();
        info!(collection = %kind, removed, "collection cleared");
        Ok(removed)
    }

    /// Rewrites the live records of `kind` into a fresh segment, in insertion
    /// order, and swaps it in atomically. Readers wait; other collections don't.
    pub fn compact(&self, kind: CollectionKind) -> Result<CompactionReport> {
        let collection = self.collection(kind)?;
        let mut state = collection.state.write().map_err(StorageError::from)?;
        let bytes_before = state.segment.len_bytes();

        let tmp_path = collection.path.with_extension("seg.compact");
        let rewritten = rewrite_live(&state, &tmp_path, collection.strict_durability);
        let (fresh, moved) = match rewritten {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        let fresh = fresh.persist_as(&collection.path)?;

        let state = &mut *state;
        state.catalog.users.reset();
        for (id, offset) in moved {
            if let Some(slot) = state.catalog.slots.get_mut(&id) {
                slot.offset = offset;
                if let Some(user_id) = slot.metadata.user_id() {
                    state.catalog.users.insert(user_id);
                }
            }
        }
        state.catalog.dead_frames = 0;
        state.segment = fresh;

        let report = CompactionReport {
            collection: kind,
            live_records: state.catalog.slots.len(),
            bytes_before,
            bytes_after: state.segment.len_bytes(),
        };
        info!(
            collection = %kind,
            live = report.live_records,
            before = report.bytes_before,
            after = report.bytes_after,
            "compaction complete"
        );
        Ok(report)
    }

    /// Frames superseded by later writes, per collection.
    pub fn dead_frames(&self, kind: CollectionKind) -> Result<u64> {
        let state = self.collection(kind)?.state.read().map_err(StorageError::from)?;
        Ok(state.catalog.dead_frames)
    }

    pub fn flush(&self) -> Result<()> {
        for collection in &self.collections {
            collection
                .state
                .read()
                .map_err(StorageError::from)?
                .segment
                .sync()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_deletes(&self, kind: CollectionKind, fail: bool) {
        if let Ok(collection) = self.collection(kind) {
            collection.fail_deletes.store(fail, Ordering::SeqCst);
        }
    }
}

fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(StorageError::DimensionMismatch { expected, actual }.into());
    }
    Ok(())
}

fn append_put(state: &mut CollectionState, record: Record) -> Result<()> {
    let entry = LogEntry::Put(record);
    let offset = state.segment.append(&entry)?;
    if let LogEntry::Put(record) = entry {
        state.catalog.put(offset, record);
    }
    Ok(())
}

fn rewrite_live(
    state: &CollectionState,
    tmp_path: &Path,
    strict_durability: bool,
) -> Result<(Segment, Vec<(String, u64)>)> {
    let mut fresh = Segment::create(tmp_path, strict_durability)?;
    let mut live: Vec<(&String, &Slot)> = state.catalog.slots.iter().collect();
    live.sort_unstable_by_key(|(_, slot)| slot.seq);

    let mut moved = Vec::with_capacity(live.len());
    for (id, slot) in live {
        let record = state.segment.read_record(slot.offset)?;
        let offset = fresh.append(&LogEntry::Put(record))?;
        moved.push((id.clone(), offset));
    }
    Ok((fresh, moved))
}
