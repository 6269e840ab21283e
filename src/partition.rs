use chrono::{Days, Months, NaiveDate};

use crate::error::{ExpensortError, Result};
use crate::models::TransactionRecord;

/// Length of one partition window. Units add up, so `months: 1, weeks: 2`
/// is a window of one month plus fourteen days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionPeriod {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
}

impl PartitionPeriod {
    pub fn new(years: u32, months: u32, weeks: u32, days: u32) -> Result<Self> {
        let period = Self {
            years,
            months,
            weeks,
            days,
        };
        if period.is_empty() {
            return Err(ExpensortError::InvalidArgument(
                "partition period needs at least one of years, months, weeks or days".to_string(),
            ));
        }
        Ok(period)
    }

    pub fn is_empty(&self) -> bool {
        self.years == 0 && self.months == 0 && self.weeks == 0 && self.days == 0
    }

    /// Start of the window following the one that starts at `start`.
    pub fn advance(&self, start: NaiveDate) -> Result<NaiveDate> {
        let overflow = || ExpensortError::InvalidArgument(format!("partition period overflows after {start}"));
        let months = self.years.checked_mul(12).and_then(|m| m.checked_add(self.months)).ok_or_else(overflow)?;
        let days = u64::from(self.weeks) * 7 + u64::from(self.days);
        start
            .checked_add_months(Months::new(months))
            .and_then(|d| d.checked_add_days(Days::new(days)))
            .ok_or_else(overflow)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
    pub records: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitions {
    pub windows: Vec<Partition>,
    /// Records without a parseable ISO date, in input order.
    pub undated: Vec<TransactionRecord>,
}

fn record_date(record: &TransactionRecord) -> Option<NaiveDate> {
    record
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
}

/// Split records into consecutive windows starting at the earliest date.
/// Windows run until the latest date is covered; empty windows in between
/// are kept so the sequence has no gaps. Input order is preserved inside
/// each window.
pub fn partition_records(records: &[TransactionRecord], period: PartitionPeriod) -> Result<Partitions> {
    if period.is_empty() {
        return Err(ExpensortError::InvalidArgument(
            "partition period needs at least one of years, months, weeks or days".to_string(),
        ));
    }

    let mut dated: Vec<(NaiveDate, &TransactionRecord)> = Vec::new();
    let mut out = Partitions::default();
    for record in records {
        match record_date(record) {
            Some(d) => dated.push((d, record)),
            None => out.undated.push(record.clone()),
        }
    }
    let (Some(first), Some(last)) = (
        dated.iter().map(|(d, _)| *d).min(),
        dated.iter().map(|(d, _)| *d).max(),
    ) else {
        return Ok(out);
    };

    let mut start = first;
    while start <= last {
        let end = period.advance(start)?;
        out.windows.push(Partition {
            start,
            end,
            records: Vec::new(),
        });
        start = end;
    }
    for (date, record) in dated {
        // Windows are sorted and contiguous; the last start not after `date` owns it.
        let slot = out.windows.partition_point(|w| w.start <= date) - 1;
        out.windows[slot].records.push(record.clone());
    }
    Ok(out)
}
