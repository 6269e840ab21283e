use std::collections::HashMap;

use crate::error::{ExpensortError, Result};
use crate::grouping::DuplicateGroups;
use crate::models::{CategorizedTransaction, Decision, TransactionRecord};

/// Give every record its group exemplar's decision, in input order.
pub fn fan_out(
    records: &[TransactionRecord],
    groups: &DuplicateGroups,
    decisions: &HashMap<usize, Decision>,
) -> Result<Vec<CategorizedTransaction>> {
    if groups.record_count() != records.len() {
        return Err(ExpensortError::Internal(format!(
            "groups cover {} records but {} were given",
            groups.record_count(),
            records.len()
        )));
    }
    records
        .iter()
        .enumerate()
        .map(|(pos, record)| {
            let exemplar = groups.exemplar_of(pos).ok_or_else(|| {
                ExpensortError::Internal(format!("record {pos} has no group"))
            })?;
            let decision = decisions.get(&exemplar).ok_or_else(|| {
                ExpensortError::Internal(format!(
                    "exemplar {exemplar} (for record {pos}) has no decision"
                ))
            })?;
            Ok(CategorizedTransaction::from_decision(record.clone(), decision))
        })
        .collect()
}
