use colored::Colorize;
use tracing::warn;

use crate::cache::{CacheStore, DatasetKey};
use crate::classifier::openai::OpenAiClassifier;
use crate::cli::categorize::unresolved;
use crate::cli::{build_categorizer, open_db, PipelineArgs, SourceArgs};
use crate::error::Result;
use crate::models::CategorizedTransaction;
use crate::persistence::{auto_persist_high_confidence, prefill_unanimous_groups};
use crate::prefetch::ChunkPipeline;
use crate::reviewer::{review_transaction_categories, ReviewOptions, TerminalPrompt};
use crate::settings::load_settings;
use crate::taxonomy::load_taxonomy;

pub fn run(source: &SourceArgs, pipeline: &PipelineArgs, exemplars: usize) -> Result<()> {
    let settings = load_settings();
    let classifier = OpenAiClassifier::from_env(&settings.model)?;
    let records = source.load()?;
    if records.is_empty() {
        println!("{}", "No transactions to review.".green());
        return Ok(());
    }

    let provider = source.provider(&settings);
    let account = source.account.as_deref();
    let conn = open_db(&settings)?;
    let categorizer = build_categorizer(classifier, &conn, pipeline.options(&settings))?;

    let prefill = prefill_unanimous_groups(&conn, &provider, account, &records, false)?;
    if prefill.groups > 0 {
        println!(
            "Resolved {} transaction(s) in {} group(s) from stored categories.",
            prefill.category_by_pos.len(),
            prefill.groups
        );
    }
    let (positions, subset) = unresolved(&prefill, &records);
    if subset.is_empty() {
        println!("{}", "Nothing left to review.".green());
        return Ok(());
    }

    // Chunk results are still written as they finish; --no-cache keeps them
    // in a scratch directory that goes away with the run.
    let scratch = if pipeline.no_cache { Some(tempfile::tempdir()?) } else { None };
    let store = match &scratch {
        Some(dir) => CacheStore::new(dir.path()),
        None => CacheStore::from_env(),
    };
    let key = DatasetKey::new(
        &provider,
        &subset,
        categorizer.model(),
        categorizer.taxonomy(),
        categorizer.invalid_category(),
    )?;
    let taxonomy = load_taxonomy(&conn)?;
    let chunks = ChunkPipeline::new(categorizer, store, key, subset, settings.chunk_size)?;
    let options = ReviewOptions {
        exemplars,
        min_confidence: settings.min_confidence,
    };

    println!("Categorizing {} unresolved transaction(s)...", chunks.records().len());
    let prefetch = chunks.spawn_prefetch(1)?;
    let mut prompt = TerminalPrompt;
    let mut stdout = std::io::stdout();

    for index in 0..chunks.chunk_count() {
        let suggestions: Vec<CategorizedTransaction> = chunks.get_or_compute(index)?;
        if let Some((base, end)) = chunks.chunk_bounds(index) {
            println!(
                "{}",
                format!("Chunk {}/{} (rows {}..{})", index + 1, chunks.chunk_count(), positions[base], positions[end - 1])
                    .bold()
            );
        }

        match auto_persist_high_confidence(&conn, &provider, account, &suggestions, settings.min_confidence) {
            Ok(0) => {}
            Ok(applied) => println!("Auto-applied {applied} suggestion(s) above {}.", settings.min_confidence),
            Err(e) => warn!(error = %e, "could not auto-apply confident suggestions"),
        }

        let outcome = review_transaction_categories(
            &conn,
            &provider,
            account,
            &suggestions,
            &taxonomy,
            &mut prompt,
            &options,
            &mut stdout,
        )?;
        if outcome.quit {
            prefetch.stop();
            return Ok(());
        }
    }

    prefetch.join();
    println!("{}", "Review complete!".green());
    Ok(())
}
