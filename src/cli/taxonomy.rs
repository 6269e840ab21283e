use std::path::Path;

use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::Result;
use crate::settings::load_settings;
use crate::taxonomy::{load_taxonomy, reseed_from_json};

pub fn list() -> Result<()> {
    let conn = open_db(&load_settings())?;
    let taxonomy = load_taxonomy(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["Code", "Display name", "Parent"]);
    for parent in taxonomy.top_level() {
        table.add_row(vec![Cell::new(&parent.code), Cell::new(&parent.display_name), Cell::new("")]);
        for child in taxonomy.children_of(&parent.code) {
            table.add_row(vec![
                Cell::new(format!("  {}", child.code)),
                Cell::new(&child.display_name),
                Cell::new(&parent.code),
            ]);
        }
    }
    println!("Categories\n{table}");
    if let Some(fallback) = taxonomy.fallback_label() {
        println!("Fallback label: {fallback}");
    }
    Ok(())
}

pub fn reseed(file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file)?;
    let mut conn = open_db(&load_settings())?;
    let count = reseed_from_json(&mut conn, &json)?;
    println!("Loaded {count} categories from {}. Stored category assignments were cleared.", file.display());
    Ok(())
}
