use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::classifier::InvalidCategoryPolicy;
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::models::{CategorizedTransaction, TransactionRecord};
use crate::prompting::{build_response_format, build_system_instructions, FIELD_ORDER};
use crate::taxonomy::Taxonomy;

pub const SCHEMA_VERSION: u32 = 2;
pub const CACHE_DIR_VAR: &str = "EXPENSORT_CACHE_DIR";

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of everything that shapes a stored answer besides the records:
/// model, taxonomy, instructions, schema, payload field order, and how
/// out-of-taxonomy labels were handled.
pub fn settings_hash(model: &str, taxonomy: &Taxonomy, invalid_category: InvalidCategoryPolicy) -> Result<String> {
    let payload = json!({
        "model": model,
        "invalid_category": invalid_category,
        "response_format": build_response_format(taxonomy)?,
        "system_instructions": build_system_instructions(taxonomy),
        "ctv_fields": FIELD_ORDER,
        "taxonomy": taxonomy.sorted_for_hash(),
    });
    Ok(sha256_hex(&serde_json::to_string(&payload)?))
}

/// Identity of one run: ordered record fingerprints plus settings.
pub fn dataset_id(provider: &str, records: &[TransactionRecord], settings_hash: &str) -> Result<String> {
    let fps: Vec<String> = records.iter().map(|r| fingerprint(provider, r)).collect();
    let payload = json!({ "fps": fps, "settings": settings_hash });
    Ok(sha256_hex(&serde_json::to_string(&payload)?))
}

/// Everything needed to address and validate cache entries for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetKey {
    pub provider: String,
    pub settings_hash: String,
    pub dataset_id: String,
}

impl DatasetKey {
    pub fn new(
        provider: &str,
        records: &[TransactionRecord],
        model: &str,
        taxonomy: &Taxonomy,
        invalid_category: InvalidCategoryPolicy,
    ) -> Result<Self> {
        let settings_hash = settings_hash(model, taxonomy, invalid_category)?;
        let dataset_id = dataset_id(provider, records, &settings_hash)?;
        Ok(Self {
            provider: provider.to_string(),
            settings_hash,
            dataset_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmDetails {
    pub rationale: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    pub fp: String,
    pub category: String,
    pub llm: LlmDetails,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetCacheFile {
    schema_version: u32,
    dataset_id: String,
    count: usize,
    settings_hash: String,
    items: Vec<CacheItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkCacheFile {
    schema_version: u32,
    dataset_id: String,
    chunk_index: usize,
    base: usize,
    end: usize,
    settings_hash: String,
    items: Vec<CacheItem>,
}

fn to_item(provider: &str, ct: &CategorizedTransaction) -> CacheItem {
    CacheItem {
        fp: fingerprint(provider, &ct.transaction),
        category: ct.category.clone(),
        llm: LlmDetails {
            rationale: ct.rationale.clone(),
            score: ct.score,
            revised_category: ct.revised_category.clone(),
            revised_rationale: ct.revised_rationale.clone(),
            revised_score: ct.revised_score,
            citations: ct.citations.clone(),
        },
    }
}

/// Rebuild results against the live records. Any fingerprint mismatch
/// rejects the whole entry.
fn restore(provider: &str, items: Vec<CacheItem>, records: &[TransactionRecord]) -> Option<Vec<CategorizedTransaction>> {
    if items.len() != records.len() {
        return None;
    }
    items
        .into_iter()
        .zip(records)
        .map(|(item, record)| {
            if item.fp != fingerprint(provider, record) {
                return None;
            }
            Some(CategorizedTransaction {
                transaction: record.clone(),
                category: item.category,
                rationale: item.llm.rationale,
                score: item.llm.score,
                revised_category: item.llm.revised_category,
                revised_rationale: item.llm.revised_rationale,
                revised_score: item.llm.revised_score,
                citations: item.llm.citations,
            })
        })
        .collect()
}

/// Serialize next to `path` and rename into place.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable cache file; ignoring");
            None
        }
    }
}

/// On-disk cache rooted at one directory, shared across runs.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `EXPENSORT_CACHE_DIR` when set, else `./.cache`.
    pub fn from_env() -> Self {
        match std::env::var(CACHE_DIR_VAR) {
            Ok(dir) if !dir.trim().is_empty() => Self::new(dir.trim()),
            _ => Self::new(Path::new(".").join(".cache")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id).join("dataset.json")
    }

    pub fn chunk_path(&self, dataset_id: &str, chunk_index: usize) -> PathBuf {
        self.root
            .join(dataset_id)
            .join("chunks")
            .join(format!("batch-{chunk_index:05}.json"))
    }

    pub fn read_dataset(&self, key: &DatasetKey, records: &[TransactionRecord]) -> Option<Vec<CategorizedTransaction>> {
        let path = self.dataset_path(&key.dataset_id);
        let file: DatasetCacheFile = read_json(&path)?;
        let valid = file.schema_version == SCHEMA_VERSION
            && file.dataset_id == key.dataset_id
            && file.count == records.len()
            && file.settings_hash == key.settings_hash;
        let restored = if valid {
            restore(&key.provider, file.items, records)
        } else {
            None
        };
        match &restored {
            Some(_) => info!(dataset_id = %key.dataset_id, count = records.len(), "dataset cache hit"),
            None => info!(dataset_id = %key.dataset_id, "dataset cache invalid; recomputing"),
        }
        restored
    }

    pub fn write_dataset(&self, key: &DatasetKey, results: &[CategorizedTransaction]) -> Result<()> {
        let file = DatasetCacheFile {
            schema_version: SCHEMA_VERSION,
            dataset_id: key.dataset_id.clone(),
            count: results.len(),
            settings_hash: key.settings_hash.clone(),
            items: results.iter().map(|ct| to_item(&key.provider, ct)).collect(),
        };
        write_atomic(&self.dataset_path(&key.dataset_id), &file)?;
        debug!(dataset_id = %key.dataset_id, count = results.len(), "dataset cache written");
        Ok(())
    }

    /// `records` is the chunk slice `[base, base + records.len())`.
    pub fn read_chunk(
        &self,
        key: &DatasetKey,
        chunk_index: usize,
        base: usize,
        records: &[TransactionRecord],
    ) -> Option<Vec<CategorizedTransaction>> {
        let path = self.chunk_path(&key.dataset_id, chunk_index);
        let file: ChunkCacheFile = read_json(&path)?;
        let valid = file.schema_version == SCHEMA_VERSION
            && file.dataset_id == key.dataset_id
            && file.chunk_index == chunk_index
            && file.base == base
            && file.end == base + records.len()
            && file.settings_hash == key.settings_hash;
        let restored = if valid {
            restore(&key.provider, file.items, records)
        } else {
            None
        };
        match &restored {
            Some(_) => debug!(chunk_index, base, "chunk cache hit"),
            None => info!(chunk_index, base, "chunk cache invalid; recomputing"),
        }
        restored
    }

    pub fn write_chunk(
        &self,
        key: &DatasetKey,
        chunk_index: usize,
        base: usize,
        results: &[CategorizedTransaction],
    ) -> Result<()> {
        let file = ChunkCacheFile {
            schema_version: SCHEMA_VERSION,
            dataset_id: key.dataset_id.clone(),
            chunk_index,
            base,
            end: base + results.len(),
            settings_hash: key.settings_hash.clone(),
            items: results.iter().map(|ct| to_item(&key.provider, ct)).collect(),
        };
        write_atomic(&self.chunk_path(&key.dataset_id, chunk_index), &file)
    }

    /// Whole-dataset read-through: a valid entry short-circuits `compute`.
    /// A failed write is logged and the fresh results are still returned.
    pub fn get_or_compute_all(
        &self,
        key: &DatasetKey,
        records: &[TransactionRecord],
        compute: impl FnOnce(&[TransactionRecord]) -> Result<Vec<CategorizedTransaction>>,
    ) -> Result<Vec<CategorizedTransaction>> {
        if let Some(hit) = self.read_dataset(key, records) {
            return Ok(hit);
        }
        let results = compute(records)?;
        if let Err(e) = self.write_dataset(key, &results) {
            warn!(dataset_id = %key.dataset_id, error = %e, "could not write dataset cache");
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExpensortError;
    use crate::taxonomy::TaxonomyEntry;

    fn taxonomy(extra: Option<&str>) -> Taxonomy {
        let mut codes = vec!["Food", "Other"];
        codes.extend(extra);
        Taxonomy::new(
            codes
                .into_iter()
                .map(|c| TaxonomyEntry {
                    code: c.into(),
                    parent_code: None,
                    display_name: c.into(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn records() -> Vec<TransactionRecord> {
        (0..3)
            .map(|i| TransactionRecord {
                id: Some(format!("t{i}")),
                description: Some(format!("Shop {i}")),
                amount: Some(format!("-{i}.50")),
                date: Some("2025-08-01".into()),
                merchant: Some(format!("Shop {i}")),
                memo: None,
            })
            .collect()
    }

    fn results(records: &[TransactionRecord]) -> Vec<CategorizedTransaction> {
        records
            .iter()
            .map(|r| CategorizedTransaction {
                transaction: r.clone(),
                category: "Food".into(),
                rationale: "groceries".into(),
                score: 0.8,
                revised_category: None,
                revised_rationale: None,
                revised_score: None,
                citations: Some(vec!["https://example.com".into()]),
            })
            .collect()
    }

    fn key(records: &[TransactionRecord]) -> DatasetKey {
        DatasetKey::new("amex", records, "gpt-5", &taxonomy(None), InvalidCategoryPolicy::Fail).unwrap()
    }

    #[test]
    fn test_settings_hash_tracks_model_and_taxonomy() {
        let fail = InvalidCategoryPolicy::Fail;
        let base = settings_hash("gpt-5", &taxonomy(None), fail).unwrap();
        assert_eq!(base, settings_hash("gpt-5", &taxonomy(None), fail).unwrap());
        assert_ne!(base, settings_hash("gpt-4o", &taxonomy(None), fail).unwrap());
        assert_ne!(base, settings_hash("gpt-5", &taxonomy(Some("Travel")), fail).unwrap());
    }

    #[test]
    fn test_fallback_results_are_not_served_to_fail_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let records = records();
        let lenient =
            DatasetKey::new("amex", &records, "gpt-5", &taxonomy(None), InvalidCategoryPolicy::Fallback).unwrap();
        store.write_dataset(&lenient, &results(&records)).unwrap();

        let strict = key(&records);
        assert_ne!(strict.settings_hash, lenient.settings_hash);
        assert_ne!(strict.dataset_id, lenient.dataset_id);
        assert!(store.read_dataset(&strict, &records).is_none());
        assert!(store.read_dataset(&lenient, &records).is_some());
    }

    #[test]
    fn test_dataset_id_is_order_sensitive() {
        let recs = records();
        let mut reversed = recs.clone();
        reversed.reverse();
        assert_ne!(dataset_id("amex", &recs, "s").unwrap(), dataset_id("amex", &reversed, "s").unwrap());
        assert_eq!(dataset_id("amex", &recs, "s").unwrap(), dataset_id("AMEX", &recs, "s").unwrap());
    }

    #[test]
    fn test_dataset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        let computed = results(&recs);
        store.write_dataset(&k, &computed).unwrap();
        assert_eq!(store.read_dataset(&k, &recs), Some(computed));
    }

    #[test]
    fn test_mutated_record_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        store.write_dataset(&k, &results(&recs)).unwrap();

        let mut changed = recs.clone();
        changed[2].amount = Some("-99.00".into());
        assert_eq!(store.read_dataset(&k, &changed), None);
        assert_eq!(store.read_dataset(&k, &recs[..2]), None);
    }

    #[test]
    fn test_settings_mismatch_and_corruption_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        store.write_dataset(&k, &results(&recs)).unwrap();

        let other = DatasetKey {
            settings_hash: "different".into(),
            ..k.clone()
        };
        assert_eq!(store.read_dataset(&other, &recs), None);

        std::fs::write(store.dataset_path(&k.dataset_id), "{not json").unwrap();
        assert_eq!(store.read_dataset(&k, &recs), None);
    }

    #[test]
    fn test_chunk_round_trip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        let chunk = &recs[1..3];
        store.write_chunk(&k, 1, 1, &results(chunk)).unwrap();

        let path = store.chunk_path(&k.dataset_id, 1);
        assert!(path.ends_with(format!("{}/chunks/batch-00001.json", k.dataset_id)));
        assert_eq!(store.read_chunk(&k, 1, 1, chunk), Some(results(chunk)));
        assert_eq!(store.read_chunk(&k, 1, 0, &recs[0..2]), None);
        assert_eq!(store.read_chunk(&k, 2, 1, chunk), None);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        store.write_dataset(&k, &results(&recs)).unwrap();
        store.write_dataset(&k, &results(&recs)).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(&k.dataset_id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["dataset.json".to_string()]);
    }

    #[test]
    fn test_get_or_compute_all_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let recs = records();
        let k = key(&recs);
        let first = store.get_or_compute_all(&k, &recs, |r| Ok(results(r))).unwrap();
        let second = store
            .get_or_compute_all(&k, &recs, |_| Err(ExpensortError::Internal("should not run".into())))
            .unwrap();
        assert_eq!(first, second);
    }
}
