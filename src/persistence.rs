use std::collections::{BTreeMap, HashMap};

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use tracing::{debug, info};

use crate::error::{ExpensortError, Result};
use crate::fingerprint::{fingerprint, normalize_amount};
use crate::grouping::group_by_merchant;
use crate::models::{CategorizedTransaction, CategorySource, TransactionRecord};

pub const PREFILL_RATIONALE: &str = "rule: unanimous duplicate";

fn norm(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// A record plus the identifiers used to find it in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub pos: usize,
    pub record: TransactionRecord,
    pub external_id: Option<String>,
    pub fingerprint: String,
}

impl PreparedItem {
    pub fn new(provider: &str, pos: usize, record: &TransactionRecord) -> Self {
        Self {
            pos,
            record: record.clone(),
            external_id: norm(record.id.as_deref()),
            fingerprint: fingerprint(provider, record),
        }
    }
}

pub fn prepare(provider: &str, records: &[TransactionRecord]) -> Vec<PreparedItem> {
    records
        .iter()
        .enumerate()
        .map(|(pos, r)| PreparedItem::new(provider, pos, r))
        .collect()
}

/// Insert or refresh rows. Rows with an external id are keyed on
/// `(provider, external_id)`, the rest on their fingerprint.
pub fn upsert_transactions(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    records: &[TransactionRecord],
) -> Result<usize> {
    let mut with_eid = conn.prepare(
        "INSERT INTO transactions (source_provider, source_account, external_id, fingerprint, raw_record, \
         amount, date, description, merchant, memo, display_name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT (source_provider, external_id) WHERE external_id IS NOT NULL DO UPDATE SET \
         raw_record = excluded.raw_record, amount = excluded.amount, date = excluded.date, \
         description = excluded.description, merchant = excluded.merchant, memo = excluded.memo, \
         fingerprint = excluded.fingerprint, updated_at = datetime('now')",
    )?;
    let mut without_eid = conn.prepare(
        "INSERT INTO transactions (source_provider, source_account, external_id, fingerprint, raw_record, \
         amount, date, description, merchant, memo, display_name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT (fingerprint) DO UPDATE SET \
         raw_record = excluded.raw_record, amount = excluded.amount, date = excluded.date, \
         description = excluded.description, merchant = excluded.merchant, memo = excluded.memo, \
         updated_at = datetime('now')",
    )?;

    for record in records {
        let external_id = norm(record.id.as_deref());
        let merchant = norm(record.merchant.as_deref());
        let description = norm(record.description.as_deref());
        let display_name = merchant.clone().or_else(|| description.clone());
        let row = params![
            provider,
            account,
            external_id,
            fingerprint(provider, record),
            serde_json::to_string(record)?,
            normalize_amount(record.amount.as_deref()),
            norm(record.date.as_deref()),
            description,
            merchant,
            norm(record.memo.as_deref()),
            display_name,
        ];
        if external_id.is_some() {
            with_eid.execute(row)?;
        } else {
            without_eid.execute(row)?;
        }
    }
    debug!(provider, count = records.len(), "upserted transactions");
    Ok(records.len())
}

/// How `apply_category_updates` writes category metadata.
#[derive(Debug, Clone, Copy)]
pub struct CategoryUpdate {
    pub source: CategorySource,
    /// Applied to every row unless `use_item_confidence` is set.
    pub confidence: Option<f64>,
    /// Leave operator-verified rows alone.
    pub only_unverified: bool,
    /// Store each item's effective score as its confidence.
    pub use_item_confidence: bool,
}

/// Set category fields on the rows matching each item (external id first,
/// fingerprint otherwise). Returns the number of rows changed.
pub fn apply_category_updates(
    conn: &Connection,
    provider: &str,
    items: &[CategorizedTransaction],
    update: CategoryUpdate,
) -> Result<usize> {
    let guard = if update.only_unverified { " AND verified = 0" } else { "" };
    let by_eid = format!(
        "UPDATE transactions SET category = ?1, category_source = ?2, category_confidence = ?3, \
         categorized_at = datetime('now'), updated_at = datetime('now') \
         WHERE source_provider = ?4 AND external_id = ?5{guard}"
    );
    let by_fp = format!(
        "UPDATE transactions SET category = ?1, category_source = ?2, category_confidence = ?3, \
         categorized_at = datetime('now'), updated_at = datetime('now') \
         WHERE fingerprint = ?4{guard}"
    );

    let mut changed = 0;
    for item in items {
        let confidence = if update.use_item_confidence {
            Some(item.effective_score())
        } else {
            update.confidence
        };
        changed += match norm(item.transaction.id.as_deref()) {
            Some(eid) => conn.execute(
                &by_eid,
                params![item.category, update.source.as_str(), confidence, provider, eid],
            )?,
            None => conn.execute(
                &by_fp,
                params![
                    item.category,
                    update.source.as_str(),
                    confidence,
                    fingerprint(provider, &item.transaction)
                ],
            )?,
        };
    }
    Ok(changed)
}

/// Store suggestions whose effective score is above `min_confidence`.
/// Verified rows are not touched.
pub fn auto_persist_high_confidence(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    suggestions: &[CategorizedTransaction],
    min_confidence: f64,
) -> Result<usize> {
    let confident: Vec<CategorizedTransaction> = suggestions
        .iter()
        .filter(|s| s.effective_score() > min_confidence)
        .cloned()
        .collect();
    if confident.is_empty() {
        return Ok(0);
    }
    let records: Vec<TransactionRecord> = confident.iter().map(|c| c.transaction.clone()).collect();
    upsert_transactions(conn, provider, account, &records)?;
    apply_category_updates(
        conn,
        provider,
        &confident,
        CategoryUpdate {
            source: CategorySource::Llm,
            confidence: None,
            only_unverified: true,
            use_item_confidence: true,
        },
    )?;
    info!(provider, applied = confident.len(), min_confidence, "auto-applied confident suggestions");
    Ok(confident.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub category: Option<String>,
    pub record: TransactionRecord,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDuplicates {
    /// Up to `sample` matching rows, for display.
    pub rows: Vec<StoredRow>,
    /// The single non-null category across all matches, if they agree.
    pub unanimous: Option<String>,
}

/// `WHERE` fragment and bound values matching any of the ids or fingerprints
/// inside one provider/account scope.
fn scope_filter(provider: &str, account: Option<&str>, eids: &[String], fps: &[String]) -> Option<(String, Vec<SqlValue>)> {
    let mut ors = Vec::new();
    let mut values: Vec<SqlValue> = vec![provider.to_string().into(), account.map(str::to_string).into()];
    if !eids.is_empty() {
        ors.push(format!("external_id IN ({})", vec!["?"; eids.len()].join(", ")));
        values.extend(eids.iter().cloned().map(SqlValue::from));
    }
    if !fps.is_empty() {
        ors.push(format!("fingerprint IN ({})", vec!["?"; fps.len()].join(", ")));
        values.extend(fps.iter().cloned().map(SqlValue::from));
    }
    if ors.is_empty() {
        return None;
    }
    Some((
        format!("source_provider = ? AND source_account IS ? AND ({})", ors.join(" OR ")),
        values,
    ))
}

pub fn query_group_duplicates(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    eids: &[String],
    fps: &[String],
    sample: usize,
) -> Result<GroupDuplicates> {
    let Some((filter, values)) = scope_filter(provider, account, eids, fps) else {
        return Ok(GroupDuplicates::default());
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT category FROM transactions WHERE {filter} AND category IS NOT NULL LIMIT 2"
    ))?;
    let categories: Vec<String> = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let unanimous = match categories.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT category, raw_record FROM transactions WHERE {filter} ORDER BY id LIMIT {sample}"
    ))?;
    let raw: Vec<(Option<String>, String)> = stmt
        .query_map(params_from_iter(values.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let rows = raw
        .into_iter()
        .map(|(category, json)| {
            Ok(StoredRow {
                category,
                record: serde_json::from_str(&json)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GroupDuplicates { rows, unanimous })
}

/// Upsert a group and mark every member with `category` as verified.
/// Only `manual` and `rule` are accepted as sources here.
pub fn persist_group(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    items: &[PreparedItem],
    category: &str,
    source: CategorySource,
) -> Result<usize> {
    if !matches!(source, CategorySource::Manual | CategorySource::Rule) {
        return Err(ExpensortError::InvalidArgument(format!(
            "unsupported category source for group persistence: {}",
            source.as_str()
        )));
    }
    let known: i64 = conn.query_row(
        "SELECT count(*) FROM categories WHERE code = ?1 AND is_active = 1",
        [category],
        |row| row.get(0),
    )?;
    if known == 0 {
        return Err(ExpensortError::UnknownCategory(category.to_string()));
    }
    if items.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    let records: Vec<TransactionRecord> = items.iter().map(|i| i.record.clone()).collect();
    upsert_transactions(&tx, provider, account, &records)?;

    let eids: Vec<String> = items.iter().filter_map(|i| i.external_id.clone()).collect();
    let fps: Vec<String> = items.iter().map(|i| i.fingerprint.clone()).collect();
    let mut changed = 0;
    if let Some((filter, scope_values)) = scope_filter(provider, account, &eids, &fps) {
        let mut values: Vec<SqlValue> = vec![category.to_string().into(), source.as_str().to_string().into()];
        values.extend(scope_values);
        changed = tx.execute(
            &format!(
                "UPDATE transactions SET category = ?, category_source = ?, category_confidence = NULL, \
                 verified = 1, categorized_at = datetime('now'), updated_at = datetime('now') WHERE {filter}"
            ),
            params_from_iter(values.iter()),
        )?;
    }
    tx.commit()?;
    Ok(changed)
}

/// Positions resolved from the store without asking the classifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefillResult {
    pub category_by_pos: BTreeMap<usize, String>,
    pub groups: usize,
}

impl PrefillResult {
    pub fn is_resolved(&self, pos: usize) -> bool {
        self.category_by_pos.contains_key(&pos)
    }

    /// Positions not covered by the prefill, ascending.
    pub fn unresolved(&self, total: usize) -> Vec<usize> {
        (0..total).filter(|p| !self.is_resolved(*p)).collect()
    }

    pub fn to_results(&self, records: &[TransactionRecord]) -> HashMap<usize, CategorizedTransaction> {
        self.category_by_pos
            .iter()
            .filter_map(|(&pos, cat)| {
                records
                    .get(pos)
                    .map(|r| (pos, CategorizedTransaction::assigned(r.clone(), cat, PREFILL_RATIONALE)))
            })
            .collect()
    }
}

/// Resolve whole merchant groups whose stored duplicates already agree on
/// one category. With `persist`, members are written back with source `rule`.
pub fn prefill_unanimous_groups(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    records: &[TransactionRecord],
    persist: bool,
) -> Result<PrefillResult> {
    let prepared = prepare(provider, records);
    let groups = group_by_merchant(records);
    let mut result = PrefillResult::default();

    for (_, members) in groups.iter() {
        let items: Vec<PreparedItem> = members.iter().map(|&p| prepared[p].clone()).collect();
        let eids: Vec<String> = items.iter().filter_map(|i| i.external_id.clone()).collect();
        let fps: Vec<String> = items.iter().map(|i| i.fingerprint.clone()).collect();
        let dupes = query_group_duplicates(conn, provider, account, &eids, &fps, 1)?;
        let Some(category) = dupes.unanimous else {
            continue;
        };
        if persist {
            persist_group(conn, provider, account, &items, &category, CategorySource::Rule)?;
        }
        for item in &items {
            result.category_by_pos.insert(item.pos, category.clone());
        }
        result.groups += 1;
    }
    info!(
        provider,
        groups = result.groups,
        records = result.category_by_pos.len(),
        "prefilled from stored duplicates"
    );
    Ok(result)
}
