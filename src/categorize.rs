use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};

use crate::classifier::{decode_body, parse_and_align, Classifier, ClassifierRequest, InvalidCategoryPolicy};
use crate::error::{ExpensortError, Result};
use crate::fanout::fan_out;
use crate::grouping::group_by_merchant;
use crate::models::{CategorizedTransaction, Decision, TransactionRecord};
use crate::paginate::{paginate, Page};
use crate::pool::{run_bounded, Permits};
use crate::prompting::{build_response_format, build_system_instructions, build_user_content, serialize_page};
use crate::retry::RetryPolicy;
use crate::taxonomy::Taxonomy;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Per-run knobs, resolved from settings and CLI flags by the caller.
#[derive(Debug, Clone)]
pub struct CategorizeOptions {
    pub page_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub invalid_category: InvalidCategoryPolicy,
}

impl Default for CategorizeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            invalid_category: InvalidCategoryPolicy::default(),
        }
    }
}

/// Every record needs a non-blank description before anything is sent.
pub fn validate_records(records: &[TransactionRecord]) -> Result<()> {
    for (pos, r) in records.iter().enumerate() {
        let blank = r.description.as_deref().map_or(true, |d| d.trim().is_empty());
        if blank {
            return Err(ExpensortError::Validation(format!(
                "description missing or empty for record {pos} (id={:?})",
                r.id
            )));
        }
    }
    Ok(())
}

/// Grouped, paginated, concurrent categorization against one taxonomy.
///
/// Clones share one budget of `concurrency` classifier calls, so a clone
/// working on another thread never pushes the total past the cap.
#[derive(Clone)]
pub struct Categorizer {
    classifier: Arc<dyn Classifier>,
    taxonomy: Arc<Taxonomy>,
    options: CategorizeOptions,
    permits: Permits,
    instructions: String,
    response_format: Value,
}

impl Categorizer {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        taxonomy: Arc<Taxonomy>,
        options: CategorizeOptions,
    ) -> Result<Self> {
        let instructions = build_system_instructions(&taxonomy);
        let response_format = build_response_format(&taxonomy)?;
        let permits = Permits::new(options.concurrency);
        Ok(Self {
            classifier,
            taxonomy,
            options,
            permits,
            instructions,
            response_format,
        })
    }

    pub fn model(&self) -> &str {
        self.classifier.model()
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn invalid_category(&self) -> InvalidCategoryPolicy {
        self.options.invalid_category
    }

    /// One result per input record, in input order. Any page failure aborts
    /// the whole call.
    pub fn categorize(&self, records: &[TransactionRecord]) -> Result<Vec<CategorizedTransaction>> {
        let started = Instant::now();
        if self.options.page_size == 0 {
            return Err(ExpensortError::InvalidArgument(
                "page_size must be a positive integer".to_string(),
            ));
        }
        if self.options.concurrency == 0 {
            return Err(ExpensortError::InvalidArgument(
                "concurrency must be a positive integer".to_string(),
            ));
        }
        validate_records(records)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let groups = group_by_merchant(records);
        let exemplars = groups.exemplars();
        let pages = paginate(exemplars.len(), self.options.page_size)?;
        info!(
            records = records.len(),
            exemplars = exemplars.len(),
            pages = pages.len(),
            page_size = self.options.page_size,
            concurrency = self.options.concurrency,
            "categorizing"
        );

        let page_results = run_bounded(pages, self.options.concurrency, |page| {
            self.classify_page(records, &exemplars, page)
        })?;

        let mut decisions: HashMap<usize, Decision> = HashMap::with_capacity(exemplars.len());
        for (abs, decision) in page_results.into_iter().flatten() {
            if decisions.insert(abs, decision).is_some() {
                return Err(ExpensortError::Internal(format!(
                    "exemplar {abs} was decided by more than one page"
                )));
            }
        }
        if let Some(hole) = exemplars.iter().find(|e| !decisions.contains_key(e)) {
            return Err(ExpensortError::Internal(format!("exemplar {hole} has no decision")));
        }

        let out = fan_out(records, &groups, &decisions)?;
        info!(
            records = out.len(),
            calls = exemplars.len().div_ceil(self.options.page_size),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "categorization complete"
        );
        Ok(out)
    }

    /// Classify one page of exemplars; returns `(absolute index, decision)` pairs.
    fn classify_page(
        &self,
        records: &[TransactionRecord],
        exemplars: &[usize],
        page: Page,
    ) -> Result<Vec<(usize, Decision)>> {
        let abs: &[usize] = &exemplars[page.base..page.end];
        let page_records: Vec<&TransactionRecord> = abs.iter().map(|&i| &records[i]).collect();
        let request = ClassifierRequest {
            instructions: self.instructions.clone(),
            input: build_user_content(&serialize_page(&page_records)?, &self.taxonomy),
            response_format: self.response_format.clone(),
        };

        let decisions = self.options.retry.run(&page, |attempt| {
            let started = Instant::now();
            debug!(page_index = page.index, base = page.base, count = page.len(), attempt, "page attempt");
            let raw = {
                let _permit = self.permits.acquire()?;
                self.classifier.classify(&request)?
            };
            let body = decode_body(&raw)?;
            let decisions = parse_and_align(&body, page.len(), &self.taxonomy, self.options.invalid_category)?;
            debug!(
                page_index = page.index,
                attempt,
                latency_ms = started.elapsed().as_millis() as u64,
                "page done"
            );
            Ok(decisions)
        })?;

        Ok(abs.iter().copied().zip(decisions).collect())
    }
}

/// Combine rows resolved without the classifier and classifier suggestions
/// into one list covering positions `0..total`.
pub fn merge_prefilled(
    total: usize,
    prefilled: HashMap<usize, CategorizedTransaction>,
    suggested: Vec<(usize, CategorizedTransaction)>,
) -> Result<Vec<CategorizedTransaction>> {
    let mut slots: Vec<Option<CategorizedTransaction>> = vec![None; total];
    for (pos, ct) in prefilled.into_iter().chain(suggested) {
        let slot = slots
            .get_mut(pos)
            .ok_or_else(|| ExpensortError::Internal(format!("position {pos} out of range ({total})")))?;
        if slot.is_some() {
            return Err(ExpensortError::Internal(format!("position {pos} filled twice")));
        }
        *slot = Some(ct);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| ExpensortError::Internal(format!("position {i} has no result"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::classifier::testing::{envelope, EchoClassifier, ScriptedClassifier};
    use crate::taxonomy::TaxonomyEntry;

    fn taxonomy() -> Arc<Taxonomy> {
        let e = |code: &str, parent: Option<&str>| TaxonomyEntry {
            code: code.into(),
            parent_code: parent.map(str::to_string),
            display_name: code.into(),
        };
        Arc::new(
            Taxonomy::new(vec![
                e("Transportation", None),
                e("Rideshare", Some("Transportation")),
                e("Food", None),
                e("Other", None),
            ])
            .unwrap(),
        )
    }

    fn rec(i: usize, merchant: &str) -> TransactionRecord {
        TransactionRecord {
            id: Some(format!("t{i}")),
            description: Some(format!("{merchant} purchase")),
            amount: Some("-10.00".into()),
            date: Some("2025-08-01".into()),
            merchant: Some(merchant.into()),
            memo: None,
        }
    }

    fn by_merchant(item: &Value) -> String {
        let m = item["merchant"].as_str().unwrap_or("").to_lowercase();
        if m.contains("uber") {
            "Rideshare".into()
        } else {
            "Food".into()
        }
    }

    fn options() -> CategorizeOptions {
        CategorizeOptions {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    fn categorizer(classifier: Arc<dyn Classifier>, options: CategorizeOptions) -> Categorizer {
        Categorizer::new(classifier, taxonomy(), options).unwrap()
    }

    fn one_result(category: &str) -> Value {
        envelope(json!({"results": [{
            "idx": 0, "id": null, "category": category, "rationale": "r", "score": 0.5,
            "revised_category": null, "revised_rationale": null, "revised_score": null, "citations": null
        }]}))
    }

    #[test]
    fn test_250_distinct_records_make_three_calls() {
        let stub = Arc::new(EchoClassifier::new(by_merchant));
        let records: Vec<_> = (0..250).map(|i| rec(i, &format!("Shop {i}"))).collect();
        let out = categorizer(stub.clone(), options()).categorize(&records).unwrap();

        assert_eq!(out.len(), 250);
        for (i, ct) in out.iter().enumerate() {
            assert_eq!(ct.transaction, records[i]);
        }
        let mut sizes = stub.call_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 100, 100]);
    }

    #[test]
    fn test_duplicates_query_only_the_exemplar() {
        let stub = Arc::new(EchoClassifier::new(by_merchant));
        let records = vec![rec(0, "Uber"), rec(1, "Bakery"), rec(2, "  UBER ")];
        let out = categorizer(stub.clone(), options()).categorize(&records).unwrap();

        assert_eq!(stub.call_sizes(), vec![2]);
        assert_eq!(out[0].category, "Rideshare");
        assert_eq!(out[2].category, "Rideshare");
        assert_eq!(out[2].transaction.id.as_deref(), Some("t2"));
        assert_eq!(out[1].category, "Food");
    }

    #[test]
    fn test_concurrency_cap_is_respected() {
        let stub = Arc::new(EchoClassifier::new(by_merchant).with_delay(Duration::from_millis(10)));
        let records: Vec<_> = (0..40).map(|i| rec(i, &format!("Shop {i}"))).collect();
        let opts = CategorizeOptions {
            page_size: 2,
            concurrency: 3,
            ..options()
        };
        categorizer(stub.clone(), opts).categorize(&records).unwrap();
        assert_eq!(stub.call_sizes().len(), 20);
        assert!(stub.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_clones_share_the_concurrency_cap() {
        let stub = Arc::new(EchoClassifier::new(by_merchant).with_delay(Duration::from_millis(20)));
        let opts = CategorizeOptions {
            page_size: 1,
            concurrency: 2,
            ..options()
        };
        let first = categorizer(stub.clone(), opts);
        let second = first.clone();
        let left: Vec<_> = (0..6).map(|i| rec(i, &format!("Left {i}"))).collect();
        let right: Vec<_> = (0..6).map(|i| rec(i, &format!("Right {i}"))).collect();
        std::thread::scope(|scope| {
            scope.spawn(|| first.categorize(&left).unwrap());
            scope.spawn(|| second.categorize(&right).unwrap());
        });
        assert_eq!(stub.call_sizes().len(), 12);
        assert!(stub.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_validation_fails_before_any_call() {
        let stub = Arc::new(ScriptedClassifier::new(vec![]));
        let mut records = vec![rec(0, "Uber"), rec(1, "Cafe")];
        records[1].description = Some("   ".into());
        let err = categorizer(stub.clone(), options()).categorize(&records).unwrap_err();
        assert!(matches!(err, ExpensortError::Validation(_)));
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let stub = Arc::new(ScriptedClassifier::new(vec![]));
        let opts = CategorizeOptions {
            page_size: 0,
            ..options()
        };
        let err = categorizer(stub.clone(), opts).categorize(&[rec(0, "Uber")]).unwrap_err();
        assert!(matches!(err, ExpensortError::InvalidArgument(_)));
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_transient_error_is_retried() {
        let stub = Arc::new(ScriptedClassifier::new(vec![
            Err(ExpensortError::Transient {
                status: 429,
                message: "rate limited".into(),
            }),
            Ok(one_result("Food")),
        ]));
        let out = categorizer(stub.clone(), options()).categorize(&[rec(0, "Cafe")]).unwrap();
        assert_eq!(stub.calls(), 2);
        assert_eq!(out[0].category, "Food");
    }

    #[test]
    fn test_malformed_response_fails_without_retry() {
        let stub = Arc::new(ScriptedClassifier::new(vec![
            Ok(envelope(json!({"results": []}))),
            Ok(one_result("Food")),
        ]));
        let err = categorizer(stub.clone(), options()).categorize(&[rec(0, "Cafe")]).unwrap_err();
        assert!(matches!(err, ExpensortError::MalformedResponse(_)));
        assert_eq!(stub.calls(), 1);
    }

    #[test]
    fn test_exhausted_retries_report_page() {
        let busy = || {
            Err(ExpensortError::Transient {
                status: 502,
                message: "bad gateway".into(),
            })
        };
        let stub = Arc::new(ScriptedClassifier::new(vec![busy(), busy(), busy()]));
        let err = categorizer(stub.clone(), options()).categorize(&[rec(0, "Cafe")]).unwrap_err();
        assert!(matches!(err, ExpensortError::PageFailed { page_index: 0, attempts: 3, .. }));
        assert_eq!(stub.calls(), 3);
    }

    #[test]
    fn test_invalid_category_policy_applies() {
        let stub = Arc::new(ScriptedClassifier::new(vec![Ok(one_result("Crypto"))]));
        let err = categorizer(stub, options()).categorize(&[rec(0, "Cafe")]).unwrap_err();
        assert!(matches!(err, ExpensortError::MalformedResponse(_)));

        let stub = Arc::new(ScriptedClassifier::new(vec![Ok(one_result("Crypto"))]));
        let opts = CategorizeOptions {
            invalid_category: InvalidCategoryPolicy::Fallback,
            ..options()
        };
        let out = categorizer(stub, opts).categorize(&[rec(0, "Cafe")]).unwrap();
        assert_eq!(out[0].category, "Other");
    }

    #[test]
    fn test_empty_input_makes_no_calls() {
        let stub = Arc::new(ScriptedClassifier::new(vec![]));
        let out = categorizer(stub.clone(), options()).categorize(&[]).unwrap();
        assert!(out.is_empty());
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_merge_prefilled() {
        let ct = |id: &str, cat: &str| {
            CategorizedTransaction::assigned(
                TransactionRecord {
                    id: Some(id.into()),
                    ..Default::default()
                },
                cat,
                "r",
            )
        };
        let prefilled = HashMap::from([(1, ct("b", "Food"))]);
        let merged = merge_prefilled(3, prefilled, vec![(2, ct("c", "Other")), (0, ct("a", "Rideshare"))]).unwrap();
        let ids: Vec<_> = merged.iter().map(|c| c.transaction.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let hole = merge_prefilled(2, HashMap::new(), vec![(0, ct("a", "Food"))]);
        assert!(matches!(hole, Err(ExpensortError::Internal(_))));
        let twice = merge_prefilled(1, HashMap::from([(0, ct("a", "Food"))]), vec![(0, ct("a", "Food"))]);
        assert!(matches!(twice, Err(ExpensortError::Internal(_))));
    }
}
