use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::cache::{CacheStore, DatasetKey};
use crate::categorize::Categorizer;
use crate::error::{ExpensortError, Result};
use crate::models::{CategorizedTransaction, TransactionRecord};

#[derive(Clone)]
enum ChunkState {
    Pending,
    Running,
    Ready(Vec<CategorizedTransaction>),
}

/// Which chunks are claimed, shared by the foreground and the prefetch thread.
struct ChunkBoard {
    states: Mutex<Vec<ChunkState>>,
    changed: Condvar,
}

impl ChunkBoard {
    fn new(chunks: usize) -> Self {
        Self {
            states: Mutex::new(vec![ChunkState::Pending; chunks]),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChunkState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: usize, state: ChunkState) {
        self.lock()[index] = state;
        self.changed.notify_all();
    }
}

/// Marks a chunk `Running` while held. Dropped without [`Claim::finish`]
/// (an error or a panic), it puts the chunk back to `Pending`.
struct Claim<'a> {
    board: &'a ChunkBoard,
    index: usize,
    done: bool,
}

impl Claim<'_> {
    fn finish(mut self, results: &[CategorizedTransaction]) {
        self.done = true;
        self.board.publish(self.index, ChunkState::Ready(results.to_vec()));
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.board.publish(self.index, ChunkState::Pending);
        }
    }
}

/// Fixed-size chunks of one dataset, each categorized independently and
/// cached under the dataset id.
///
/// A chunk is computed by whoever claims it first. The other side waits for
/// it instead of classifying it again.
#[derive(Clone)]
pub struct ChunkPipeline {
    categorizer: Categorizer,
    store: CacheStore,
    key: DatasetKey,
    records: Arc<Vec<TransactionRecord>>,
    chunk_size: usize,
    board: Arc<ChunkBoard>,
}

impl ChunkPipeline {
    pub fn new(
        categorizer: Categorizer,
        store: CacheStore,
        key: DatasetKey,
        records: Vec<TransactionRecord>,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ExpensortError::InvalidArgument(
                "chunk_size must be a positive integer".to_string(),
            ));
        }
        let board = Arc::new(ChunkBoard::new(records.len().div_ceil(chunk_size)));
        Ok(Self {
            categorizer,
            store,
            key,
            records: Arc::new(records),
            chunk_size,
            board,
        })
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn chunk_count(&self) -> usize {
        self.records.len().div_ceil(self.chunk_size)
    }

    /// `[base, end)` of chunk `index`.
    pub fn chunk_bounds(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.chunk_count() {
            return None;
        }
        let base = index * self.chunk_size;
        Some((base, (base + self.chunk_size).min(self.records.len())))
    }

    /// Results for the chunk. Waits while the prefetch thread is working on
    /// it; otherwise reads the cache or categorizes now.
    pub fn get_or_compute(&self, index: usize) -> Result<Vec<CategorizedTransaction>> {
        if self.chunk_bounds(index).is_none() {
            return Err(ExpensortError::InvalidArgument(format!(
                "chunk {index} out of range ({} chunks)",
                self.chunk_count()
            )));
        }
        let mut states = self.board.lock();
        loop {
            if let ChunkState::Ready(results) = &states[index] {
                return Ok(results.clone());
            }
            if matches!(states[index], ChunkState::Pending) {
                states[index] = ChunkState::Running;
                break;
            }
            debug!(chunk_index = index, "waiting for prefetch");
            states = self.board.changed.wait(states).unwrap_or_else(PoisonError::into_inner);
        }
        drop(states);
        self.compute(Claim {
            board: &self.board,
            index,
            done: false,
        })
    }

    /// Claim the chunk only if nobody has started it.
    fn try_claim(&self, index: usize) -> Option<Claim<'_>> {
        let mut states = self.board.lock();
        if !matches!(states.get(index), Some(ChunkState::Pending)) {
            return None;
        }
        states[index] = ChunkState::Running;
        Some(Claim {
            board: &self.board,
            index,
            done: false,
        })
    }

    fn compute(&self, claim: Claim<'_>) -> Result<Vec<CategorizedTransaction>> {
        let index = claim.index;
        let (base, end) = self.chunk_bounds(index).ok_or_else(|| {
            ExpensortError::Internal(format!("claimed chunk {index} is out of range"))
        })?;
        let slice = &self.records[base..end];
        let results = match self.store.read_chunk(&self.key, index, base, slice) {
            Some(hit) => hit,
            None => {
                let fresh = self.categorizer.categorize(slice)?;
                if let Err(e) = self.store.write_chunk(&self.key, index, base, &fresh) {
                    warn!(chunk_index = index, error = %e, "could not write chunk cache");
                }
                fresh
            }
        };
        claim.finish(&results);
        Ok(results)
    }

    /// Compute chunks `from..` one after another on a background thread,
    /// skipping any the foreground already claimed. A failed chunk goes back
    /// to pending so the foreground can try it again on demand.
    pub fn spawn_prefetch(&self, from: usize) -> Result<PrefetchHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = self.clone();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("expensort-prefetch".to_string())
            .spawn(move || {
                for index in from..worker.chunk_count() {
                    if flag.load(Ordering::Acquire) {
                        debug!(chunk_index = index, "prefetch stopped");
                        return;
                    }
                    let Some(claim) = worker.try_claim(index) else {
                        continue;
                    };
                    match worker.compute(claim) {
                        Ok(results) => debug!(chunk_index = index, count = results.len(), "prefetched chunk"),
                        Err(e) => warn!(chunk_index = index, error = %e, "prefetch failed; will retry on demand"),
                    }
                }
            })?;
        Ok(PrefetchHandle {
            stop,
            handle: Some(handle),
        })
    }
}

/// Dropping the handle asks the worker to stop after its current chunk.
pub struct PrefetchHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker to finish.
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("prefetch thread panicked");
            }
        }
    }
}

impl Drop for PrefetchHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorize::CategorizeOptions;
    use crate::classifier::testing::{EchoClassifier, ScriptedClassifier};
    use crate::classifier::Classifier;
    use crate::retry::RetryPolicy;
    use crate::taxonomy::{Taxonomy, TaxonomyEntry};

    fn taxonomy() -> Arc<Taxonomy> {
        Arc::new(
            Taxonomy::new(vec![TaxonomyEntry {
                code: "Food".into(),
                parent_code: None,
                display_name: "Food".into(),
            }])
            .unwrap(),
        )
    }

    fn records(n: usize) -> Vec<TransactionRecord> {
        (0..n)
            .map(|i| TransactionRecord {
                id: Some(format!("t{i}")),
                description: Some(format!("Shop {i}")),
                merchant: Some(format!("Shop {i}")),
                ..Default::default()
            })
            .collect()
    }

    fn pipeline(classifier: Arc<dyn Classifier>, dir: &std::path::Path, n: usize) -> ChunkPipeline {
        let opts = CategorizeOptions {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        };
        pipeline_with(classifier, dir, n, opts)
    }

    fn pipeline_with(
        classifier: Arc<dyn Classifier>,
        dir: &std::path::Path,
        n: usize,
        opts: CategorizeOptions,
    ) -> ChunkPipeline {
        let tax = taxonomy();
        let recs = records(n);
        let key = DatasetKey::new("amex", &recs, classifier.model(), &tax, opts.invalid_category).unwrap();
        let categorizer = Categorizer::new(classifier, tax, opts).unwrap();
        ChunkPipeline::new(categorizer, CacheStore::new(dir), key, recs, 2).unwrap()
    }

    #[test]
    fn test_chunk_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(ScriptedClassifier::new(vec![])), dir.path(), 5);
        assert_eq!(p.chunk_count(), 3);
        assert_eq!(p.chunk_bounds(0), Some((0, 2)));
        assert_eq!(p.chunk_bounds(2), Some((4, 5)));
        assert_eq!(p.chunk_bounds(3), None);
    }

    #[test]
    fn test_prefetched_chunks_are_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(EchoClassifier::new(|_: &serde_json::Value| "Food".to_string()));
        let p = pipeline(stub.clone(), dir.path(), 5);

        let first = p.get_or_compute(0).unwrap();
        assert_eq!(first.len(), 2);
        p.spawn_prefetch(1).unwrap().join();
        assert_eq!(stub.call_sizes().len(), 3);

        let last = p.get_or_compute(2).unwrap();
        assert_eq!(last[0].transaction.id.as_deref(), Some("t4"));
        assert_eq!(stub.call_sizes().len(), 3);
    }

    #[test]
    fn test_foreground_and_prefetch_share_cap_and_never_repeat_a_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(
            EchoClassifier::new(|_: &serde_json::Value| "Food".to_string())
                .with_delay(std::time::Duration::from_millis(200)),
        );
        let opts = CategorizeOptions {
            page_size: 2,
            concurrency: 1,
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        };
        let p = pipeline_with(stub.clone(), dir.path(), 4, opts);

        let prefetch = p.spawn_prefetch(1).unwrap();
        assert_eq!(p.get_or_compute(0).unwrap().len(), 2);
        let second = p.get_or_compute(1).unwrap();
        assert_eq!(second[1].transaction.id.as_deref(), Some("t3"));
        prefetch.join();

        assert_eq!(stub.call_sizes(), vec![2, 2]);
        assert_eq!(stub.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chunk_claimed_by_prefetch_is_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(
            EchoClassifier::new(|_: &serde_json::Value| "Food".to_string())
                .with_delay(std::time::Duration::from_millis(50)),
        );
        let p = pipeline(stub.clone(), dir.path(), 2);
        let prefetch = p.spawn_prefetch(0).unwrap();
        let out = p.get_or_compute(0).unwrap();
        prefetch.join();
        assert_eq!(out.len(), 2);
        assert_eq!(stub.call_sizes(), vec![2]);
    }

    #[test]
    fn test_prefetch_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(ScriptedClassifier::new(vec![Err(ExpensortError::Transient {
            status: 500,
            message: "down".into(),
        })]));
        let p = pipeline(stub.clone(), dir.path(), 4);
        p.spawn_prefetch(0).unwrap().join();
        assert_eq!(stub.calls(), 2);
        // Nothing was cached, so the foreground has to ask again.
        assert!(p.get_or_compute(0).is_err());
        assert_eq!(stub.calls(), 3);
    }

    #[test]
    fn test_out_of_range_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(ScriptedClassifier::new(vec![])), dir.path(), 2);
        assert!(matches!(p.get_or_compute(5), Err(ExpensortError::InvalidArgument(_))));
    }
}
