use std::collections::{BTreeMap, HashMap};

use caseless::default_case_fold_str;
use unicode_normalization::UnicodeNormalization;

use crate::models::TransactionRecord;

/// Normalized grouping key: NFC, whitespace collapsed, case-folded.
/// Returns `None` for blank input.
pub fn normalize_key(raw: &str) -> Option<String> {
    let composed: String = raw.nfc().collect();
    let collapsed = composed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(default_case_fold_str(&collapsed))
}

/// Merchant when present, else description.
pub fn merchant_key(record: &TransactionRecord) -> Option<String> {
    record
        .merchant
        .as_deref()
        .and_then(normalize_key)
        .or_else(|| record.description.as_deref().and_then(normalize_key))
}

/// Duplicate groups over one run's input. Each group is keyed by its exemplar,
/// the smallest absolute index among the members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroups {
    members: BTreeMap<usize, Vec<usize>>,
    exemplar_of: Vec<usize>,
}

impl DuplicateGroups {
    /// Exemplar indices in ascending order.
    pub fn exemplars(&self) -> Vec<usize> {
        self.members.keys().copied().collect()
    }

    pub fn members(&self, exemplar: usize) -> &[usize] {
        self.members.get(&exemplar).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn exemplar_of(&self, pos: usize) -> Option<usize> {
        self.exemplar_of.get(pos).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.members.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.exemplar_of.len()
    }
}

pub fn group_by_merchant(records: &[TransactionRecord]) -> DuplicateGroups {
    let mut first_by_key: HashMap<String, usize> = HashMap::new();
    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut exemplar_of = Vec::with_capacity(records.len());

    for (pos, record) in records.iter().enumerate() {
        // Ascending traversal means the first index seen for a key is its minimum.
        let exemplar = match merchant_key(record) {
            Some(key) => *first_by_key.entry(key).or_insert(pos),
            None => pos,
        };
        members.entry(exemplar).or_default().push(pos);
        exemplar_of.push(exemplar);
    }

    DuplicateGroups {
        members,
        exemplar_of,
    }
}
