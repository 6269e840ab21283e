use std::path::Path;

use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::importer::load_transactions;
use crate::partition::{partition_records, PartitionPeriod};

pub fn run(file: &Path, years: u32, months: u32, weeks: u32, days: u32) -> Result<()> {
    let period = PartitionPeriod::new(years, months, weeks, days)?;
    let records = load_transactions(file, None)?;
    let parts = partition_records(&records, period)?;

    let mut table = Table::new();
    table.set_header(vec!["#", "Start", "End (excl.)", "Transactions"]);
    for (i, window) in parts.windows.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(window.start),
            Cell::new(window.end),
            Cell::new(window.records.len()),
        ]);
    }
    println!("Partitions\n{table}");
    if !parts.undated.is_empty() {
        println!("Undated:      {}", parts.undated.len());
    }
    Ok(())
}
