use std::path::Path;

use crate::error::{ExpensortError, Result};
use crate::models::TransactionRecord;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Collapse internal whitespace (including embedded newlines) and trim.
pub fn clean_text(raw: &str) -> Option<String> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// `MM/DD/YYYY` or `MM/DD/YY` to ISO `YYYY-MM-DD`. Two-digit years 69..=99
/// land in the 1900s, the rest in the 2000s.
pub fn parse_date_mdy(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let m: u32 = parts[0].parse().ok()?;
    let d: u32 = parts[1].parse().ok()?;
    let y: i32 = match parts[2].len() {
        4 => parts[2].parse().ok()?,
        2 => {
            let yy: i32 = parts[2].parse().ok()?;
            if yy >= 69 {
                1900 + yy
            } else {
                2000 + yy
            }
        }
        _ => return None,
    };
    chrono::NaiveDate::from_ymd_opt(y, m, d).map(|dt| dt.format("%Y-%m-%d").to_string())
}

fn trimmed(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

const AMEX_REQUIRED: &[&str] = &[
    "Reference",
    "Description",
    "Amount",
    "Date",
    "Appears On Your Statement As",
];
const AMEX_ENHANCED_EXTRA: &str = "Extended Details";
const CANONICAL_COLUMNS: &[&str] = &["id", "description", "amount", "date", "merchant", "memo"];

/// How far into the file format detection looks.
const DETECT_PREFIX: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvFormat {
    /// AmEx-like export with the header on the first line.
    AmexStandard,
    /// AmEx "Enhanced Details" export; the header follows a free-text preamble.
    AmexEnhanced,
    /// `id,description,amount,date,merchant,memo`.
    Canonical,
}

impl CsvFormat {
    pub fn key(&self) -> &'static str {
        match self {
            Self::AmexStandard => "amex",
            Self::AmexEnhanced => "amex_enhanced",
            Self::Canonical => "canonical",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AmexStandard => "American Express",
            Self::AmexEnhanced => "American Express Enhanced Details",
            Self::Canonical => "Canonical CSV",
        }
    }

    fn required(&self) -> Vec<&'static str> {
        match self {
            Self::AmexStandard => AMEX_REQUIRED.to_vec(),
            Self::AmexEnhanced => {
                let mut cols = AMEX_REQUIRED.to_vec();
                cols.push(AMEX_ENHANCED_EXTRA);
                cols
            }
            Self::Canonical => vec!["id", "description"],
        }
    }

    /// Pick a format from the start of the file contents.
    pub fn detect(content: &str) -> Self {
        let head: String = content.chars().take(DETECT_PREFIX).collect();
        if head.contains(AMEX_ENHANCED_EXTRA) {
            return Self::AmexEnhanced;
        }
        let first = head.lines().next().unwrap_or_default();
        let fields: Vec<String> = first.split(',').map(|f| f.trim().to_lowercase()).collect();
        if fields.iter().any(|f| f == "id") && fields.iter().any(|f| f == "description") {
            Self::Canonical
        } else {
            Self::AmexStandard
        }
    }

    pub fn parse(&self, content: &str) -> Result<Vec<TransactionRecord>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(content.as_bytes());
        let mut rows = rdr.records();

        let header = match self {
            Self::AmexEnhanced => loop {
                match rows.next() {
                    Some(record) => {
                        let record = record?;
                        if record.iter().any(|f| f.trim() == AMEX_ENHANCED_EXTRA)
                            && record.iter().any(|f| f.trim() == "Date")
                        {
                            break record;
                        }
                    }
                    None => {
                        return Err(ExpensortError::HeaderMismatch(format!(
                            "{}: could not locate the header row",
                            self.name()
                        )))
                    }
                }
            },
            _ => match rows.next() {
                Some(record) => record?,
                None => {
                    return Err(ExpensortError::HeaderMismatch(format!(
                        "{}: file has no header row",
                        self.name()
                    )))
                }
            },
        };

        let columns: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        let missing: Vec<&str> = self
            .required()
            .into_iter()
            .filter(|req| !columns.iter().any(|c| c == req))
            .collect();
        if !missing.is_empty() {
            return Err(ExpensortError::HeaderMismatch(format!(
                "{}: missing columns: {}",
                self.name(),
                missing.join(", ")
            )));
        }
        let idx = |name: &str| columns.iter().position(|c| c == name);

        let (id, desc, amount, date, merchant, memo) = match self {
            Self::Canonical => (
                idx(CANONICAL_COLUMNS[0]),
                idx(CANONICAL_COLUMNS[1]),
                idx(CANONICAL_COLUMNS[2]),
                idx(CANONICAL_COLUMNS[3]),
                idx(CANONICAL_COLUMNS[4]),
                idx(CANONICAL_COLUMNS[5]),
            ),
            _ => (
                idx("Reference"),
                idx("Description"),
                idx("Amount"),
                idx("Date"),
                idx("Appears On Your Statement As"),
                idx(AMEX_ENHANCED_EXTRA),
            ),
        };
        let canonical = *self == Self::Canonical;

        let mut records = Vec::new();
        for row in rows {
            let row = row?;
            if row.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            let field = |i: Option<usize>| i.and_then(|i| row.get(i));
            records.push(TransactionRecord {
                id: field(id).and_then(trimmed),
                description: field(desc).and_then(clean_text),
                amount: field(amount).and_then(trimmed),
                date: if canonical {
                    field(date).and_then(trimmed)
                } else {
                    field(date).and_then(parse_date_mdy)
                },
                merchant: field(merchant).and_then(clean_text),
                memo: field(memo).and_then(clean_text),
            });
        }
        Ok(records)
    }
}

pub fn get_by_key(key: &str) -> Option<CsvFormat> {
    [CsvFormat::AmexStandard, CsvFormat::AmexEnhanced, CsvFormat::Canonical]
        .into_iter()
        .find(|f| f.key() == key)
}

/// Read a CSV export from disk into canonical records, in file order.
pub fn load_transactions(path: &Path, format: Option<CsvFormat>) -> Result<Vec<TransactionRecord>> {
    if !path.is_file() {
        return Err(ExpensortError::InvalidArgument(format!(
            "CSV file not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let format = format.unwrap_or_else(|| CsvFormat::detect(&content));
    tracing::debug!(path = %path.display(), format = format.key(), "loading transactions");
    format.parse(&content)
}
