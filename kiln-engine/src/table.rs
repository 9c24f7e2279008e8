//! Correlation table
//!
//! The single owner of every [`JobRecord`]. Writes go through `&mut self`
//! on the tick thread; readers on any thread load the last published
//! [`TableSnapshot`] through a [`SnapshotReader`].
//!
//! Both maps are persistent (`im::HashMap`): publishing shares their
//! structure with the snapshot instead of copying it, and a later write
//! copies only the path to the entry it touches. Records sit behind `Arc`,
//! so that path copy never clones a record either.

use std::ops::Index;
use std::sync::{Arc, PoisonError, RwLock};

use im::HashMap;
use kiln_core::{Batch, BatchCounts, BatchId, JobId, JobRecord, JobStatus};

type JobMap = HashMap<JobId, Arc<JobRecord>>;
type BatchMap = HashMap<BatchId, Arc<Batch>>;

/// Immutable view of the table at one point in time
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    jobs: JobMap,
    batches: BatchMap,
    version: u64,
}

impl TableSnapshot {
    pub fn get(&self, id: &JobId) -> Option<&JobRecord> {
        self.jobs.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Every record, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn batch(&self, id: &BatchId) -> Option<&Batch> {
        self.batches.get(id).map(Arc::as_ref)
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values().map(Arc::as_ref)
    }

    /// Records of a batch in submission order
    pub fn batch_jobs(&self, id: &BatchId) -> Vec<&JobRecord> {
        batch_jobs(&self.jobs, &self.batches, id)
    }

    pub fn batch_counts(&self, id: &BatchId) -> Option<BatchCounts> {
        batch_counts(&self.jobs, &self.batches, id)
    }

    /// Incremented every time the table publishes a change
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Index<&JobId> for TableSnapshot {
    type Output = JobRecord;

    /// Panics if the job is not in the snapshot
    fn index(&self, id: &JobId) -> &JobRecord {
        &self.jobs[id]
    }
}

/// Cloneable, thread-safe access to the latest published snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    published: Arc<RwLock<Arc<TableSnapshot>>>,
}

impl SnapshotReader {
    /// Loads the latest snapshot. The lock is held only for an `Arc` clone.
    pub fn load(&self) -> Arc<TableSnapshot> {
        let guard = self.published.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }
}

/// Mapping from job id to its record, plus the batches grouping them
#[derive(Debug)]
pub struct CorrelationTable {
    jobs: JobMap,
    batches: BatchMap,
    version: u64,
    dirty: bool,
    published: Arc<RwLock<Arc<TableSnapshot>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            batches: HashMap::new(),
            version: 0,
            dirty: false,
            published: Arc::new(RwLock::new(Arc::new(TableSnapshot::default()))),
        }
    }

    /// Inserts a freshly submitted record
    ///
    /// Returns `false` and leaves the table untouched if the id is already
    /// tracked; an id owns exactly one record for the life of the process.
    pub fn insert(&mut self, record: JobRecord) -> bool {
        if self.jobs.contains_key(&record.id) {
            return false;
        }
        self.jobs.insert(record.id, Arc::new(record));
        self.dirty = true;
        true
    }

    /// Inserts a batch and its records together
    pub fn insert_batch(&mut self, batch: Batch, records: Vec<JobRecord>) {
        for record in records {
            self.insert(record);
        }
        self.batches.insert(batch.id, Arc::new(batch));
        self.dirty = true;
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&JobRecord> {
        self.jobs.get(id).map(Arc::as_ref)
    }

    /// Mutates one record in place, copying it first if a snapshot still
    /// shares it
    pub fn update<R>(&mut self, id: &JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let record = self.jobs.get_mut(id)?;
        self.dirty = true;
        Some(f(Arc::make_mut(record)))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().map(Arc::as_ref)
    }

    /// Ids of every job whose status matches `predicate`
    pub fn ids_where(&self, predicate: impl Fn(&JobStatus) -> bool) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|record| predicate(&record.status))
            .map(|record| record.id)
            .collect()
    }

    pub fn batch(&self, id: &BatchId) -> Option<&Batch> {
        self.batches.get(id).map(Arc::as_ref)
    }

    pub fn batch_jobs(&self, id: &BatchId) -> Vec<&JobRecord> {
        batch_jobs(&self.jobs, &self.batches, id)
    }

    pub fn batch_counts(&self, id: &BatchId) -> Option<BatchCounts> {
        batch_counts(&self.jobs, &self.batches, id)
    }

    /// True when something changed since the last publish
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Publishes a new snapshot if anything changed and returns the latest one
    pub fn publish(&mut self) -> Arc<TableSnapshot> {
        if !self.dirty {
            return self.snapshot();
        }

        self.version += 1;
        self.dirty = false;
        let snapshot = Arc::new(TableSnapshot {
            jobs: self.jobs.clone(),
            batches: self.batches.clone(),
            version: self.version,
        });

        let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
        *published = Arc::clone(&snapshot);
        snapshot
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.reader().load()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            published: Arc::clone(&self.published),
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

fn batch_jobs<'a>(jobs: &'a JobMap, batches: &BatchMap, id: &BatchId) -> Vec<&'a JobRecord> {
    batches
        .get(id)
        .map(|batch| {
            batch
                .job_ids
                .iter()
                .filter_map(|job_id| jobs.get(job_id).map(Arc::as_ref))
                .collect()
        })
        .unwrap_or_default()
}

fn batch_counts(jobs: &JobMap, batches: &BatchMap, id: &BatchId) -> Option<BatchCounts> {
    let batch = batches.get(id)?;
    Some(BatchCounts::tally(
        batch
            .job_ids
            .iter()
            .filter_map(|job_id| jobs.get(job_id))
            .map(|record| &record.status),
    ))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kiln_core::JobRequest;

    use super::*;

    fn record(batch_id: Option<BatchId>) -> JobRecord {
        JobRecord::new(JobId::new(), JobRequest::new("castle tile"), batch_id, Utc::now())
    }

    #[test]
    fn test_insert_is_once_per_id() {
        let mut table = CorrelationTable::new();
        let first = record(None);
        let id = first.id;

        assert!(table.insert(first.clone()));
        let mut impostor = first;
        impostor.attempt_count = 9;
        assert!(!table.insert(impostor));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().attempt_count, 0);
    }

    #[test]
    fn test_snapshots_are_isolated_from_later_writes() {
        let mut table = CorrelationTable::new();
        let rec = record(None);
        let id = rec.id;
        table.insert(rec);

        let before = table.publish();
        assert_eq!(before.version(), 1);

        table.update(&id, |r| r.status = JobStatus::Accepted);
        assert_eq!(before[&id].status, JobStatus::Queued);
        assert_eq!(table.snapshot().version(), 1);

        let after = table.publish();
        assert_eq!(after.version(), 2);
        assert_eq!(after[&id].status, JobStatus::Accepted);
        assert_eq!(before[&id].status, JobStatus::Queued);
    }

    #[test]
    fn test_publish_without_changes_keeps_version() {
        let mut table = CorrelationTable::new();
        table.insert(record(None));
        let first = table.publish();
        let second = table.publish();
        assert_eq!(first.version(), second.version());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reader_sees_latest_publish_from_another_thread() {
        let mut table = CorrelationTable::new();
        let reader = table.reader();
        table.insert(record(None));
        table.publish();

        let len = std::thread::spawn(move || reader.load().len()).join().unwrap();
        assert_eq!(len, 1);
    }

    #[test]
    fn test_batch_views_follow_order_and_status() {
        let mut table = CorrelationTable::new();
        let batch_id = BatchId::new();
        let records: Vec<JobRecord> = (0..3).map(|_| record(Some(batch_id))).collect();
        let ids: Vec<JobId> = records.iter().map(|r| r.id).collect();
        let batch = Batch {
            id: batch_id,
            name: "tiles".to_string(),
            job_ids: ids.clone(),
            created_at: Utc::now(),
        };
        table.insert_batch(batch, records);

        table.update(&ids[1], |r| {
            r.status = JobStatus::Complete {
                output_path: "b.png".to_string(),
                duration_seconds: 3.0,
            }
        });
        table.update(&ids[2], |r| r.status = JobStatus::Cancelled);

        let ordered: Vec<JobId> = table.batch_jobs(&batch_id).iter().map(|r| r.id).collect();
        assert_eq!(ordered, ids);

        let counts = table.batch_counts(&batch_id).unwrap();
        assert_eq!((counts.successful, counts.failed, counts.pending), (1, 1, 1));
        assert!(table.batch_counts(&BatchId::new()).is_none());
        assert!(table.batch_jobs(&BatchId::new()).is_empty());
    }

    #[test]
    fn test_publish_shares_structure_with_the_table() {
        let mut table = CorrelationTable::new();
        let ids: Vec<JobId> = (0..10_000)
            .map(|_| {
                let rec = record(None);
                let id = rec.id;
                table.insert(rec);
                id
            })
            .collect();

        let first = table.publish();
        // the snapshot holds the same map nodes, not copies of the entries
        assert!(table.jobs.values().all(|rec| Arc::strong_count(rec) == 1));

        table.update(&ids[0], |r| r.status = JobStatus::Accepted);
        let second = table.publish();

        // one write copies one path of nodes, not the whole map
        let shared = table
            .jobs
            .values()
            .filter(|rec| Arc::strong_count(rec) > 1)
            .count();
        assert!(shared < 1_000, "{shared} records copied for one write");

        assert_eq!(first[&ids[0]].status, JobStatus::Queued);
        assert_eq!(second[&ids[0]].status, JobStatus::Accepted);
        assert_eq!(second.len(), 10_000);
    }

    #[test]
    fn test_ids_where() {
        let mut table = CorrelationTable::new();
        let a = record(None);
        let b = record(None);
        let a_id = a.id;
        table.insert(a);
        table.insert(b);
        table.update(&a_id, |r| r.status = JobStatus::Accepted);

        assert_eq!(table.ids_where(|s| *s == JobStatus::Accepted), vec![a_id]);
        assert_eq!(table.ids_where(JobStatus::is_pending).len(), 2);
    }
}
