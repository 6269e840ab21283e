use colored::Colorize;
use rusqlite::Connection;
use tracing::info;

use crate::cache::{CacheStore, DatasetKey};
use crate::categorize::{merge_prefilled, Categorizer};
use crate::classifier::openai::OpenAiClassifier;
use crate::cli::{build_categorizer, open_db, PipelineArgs, SourceArgs};
use crate::error::{ExpensortError, Result};
use crate::models::{CategorizedTransaction, TransactionRecord};
use crate::persistence::{auto_persist_high_confidence, prefill_unanimous_groups, PrefillResult};
use crate::settings::load_settings;

/// Records still needing the classifier after prefill, with their input positions.
pub(crate) fn unresolved(prefill: &PrefillResult, records: &[TransactionRecord]) -> (Vec<usize>, Vec<TransactionRecord>) {
    let positions = prefill.unresolved(records.len());
    let subset = positions.iter().map(|&p| records[p].clone()).collect();
    (positions, subset)
}

pub struct Suggestions {
    /// One entry per input record, in input order.
    pub results: Vec<CategorizedTransaction>,
    /// Classifier suggestions only, keyed by input position.
    pub classified: Vec<(usize, CategorizedTransaction)>,
    pub prefilled: usize,
}

/// Prefill from stored duplicates, classify the rest (through the dataset
/// cache unless `use_cache` is off) and merge back into input order.
pub(crate) fn suggest(
    conn: &Connection,
    categorizer: &Categorizer,
    provider: &str,
    account: Option<&str>,
    records: &[TransactionRecord],
    persist_prefill: bool,
    use_cache: bool,
) -> Result<Suggestions> {
    let prefill = prefill_unanimous_groups(conn, provider, account, records, persist_prefill)?;
    let (positions, subset) = unresolved(&prefill, records);

    let fresh = if subset.is_empty() {
        Vec::new()
    } else if use_cache {
        let key = DatasetKey::new(
            provider,
            &subset,
            categorizer.model(),
            categorizer.taxonomy(),
            categorizer.invalid_category(),
        )?;
        CacheStore::from_env().get_or_compute_all(&key, &subset, |r| categorizer.categorize(r))?
    } else {
        categorizer.categorize(&subset)?
    };
    if fresh.len() != positions.len() {
        return Err(ExpensortError::Internal(format!(
            "{} results for {} unresolved records",
            fresh.len(),
            positions.len()
        )));
    }

    let classified: Vec<(usize, CategorizedTransaction)> = positions.into_iter().zip(fresh).collect();
    let results = merge_prefilled(records.len(), prefill.to_results(records), classified.clone())?;
    Ok(Suggestions {
        results,
        classified,
        prefilled: prefill.category_by_pos.len(),
    })
}

pub fn run(source: &SourceArgs, pipeline: &PipelineArgs, persist: bool) -> Result<()> {
    let settings = load_settings();
    let classifier = OpenAiClassifier::from_env(&settings.model)?;
    let records = source.load()?;
    if records.is_empty() {
        eprintln!("{}", "No transactions found.".yellow());
        return Ok(());
    }

    let provider = source.provider(&settings);
    let account = source.account.as_deref();
    let conn = open_db(&settings)?;
    let categorizer = build_categorizer(classifier, &conn, pipeline.options(&settings))?;

    let suggestions = suggest(&conn, &categorizer, &provider, account, &records, persist, !pipeline.no_cache)?;

    if persist {
        let fresh: Vec<CategorizedTransaction> = suggestions.classified.iter().map(|(_, ct)| ct.clone()).collect();
        let applied = auto_persist_high_confidence(&conn, &provider, account, &fresh, settings.min_confidence)?;
        info!(applied, prefilled = suggestions.prefilled, "persisted categories");
        eprintln!(
            "{}",
            format!(
                "Stored {} prefilled and {applied} confident (> {}) categories.",
                suggestions.prefilled, settings.min_confidence
            )
            .green()
        );
    }

    for ct in &suggestions.results {
        println!("{}\t{}", ct.transaction.id.as_deref().unwrap_or_default(), ct.category);
    }
    Ok(())
}
