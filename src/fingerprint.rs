use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};

use crate::models::TransactionRecord;

fn norm_str(v: Option<&str>) -> Option<String> {
    let s = v?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Two-decimal string with half-up rounding, or `None` when the amount is
/// missing or not a plain decimal number.
pub fn normalize_amount(raw: Option<&str>) -> Option<String> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    let d = Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()?;
    let rounded = d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    Some(format!("{rounded:.2}"))
}

/// Stable SHA-256 identity of a transaction, used for cache validation and
/// as the upsert key when a row has no external id.
pub fn fingerprint(provider: &str, record: &TransactionRecord) -> String {
    // BTreeMap keeps keys sorted so the serialization is canonical.
    let mut payload: BTreeMap<&str, Option<String>> = BTreeMap::new();
    payload.insert("provider", Some(provider.trim().to_lowercase()));
    payload.insert("id", norm_str(record.id.as_deref()));
    payload.insert("amount", normalize_amount(record.amount.as_deref()));
    payload.insert("date", norm_str(record.date.as_deref()));
    payload.insert("merchant", norm_str(record.merchant.as_deref()));
    payload.insert("description", norm_str(record.description.as_deref()));

    let data = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}
