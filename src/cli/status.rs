use crate::cache::CacheStore;
use crate::db::get_connection;
use crate::error::Result;
use crate::fmt::{format_bytes, money};
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();
    let cache = CacheStore::from_env();

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Cache:      {}", cache.root().display());
    println!("Model:      {}", settings.model);
    println!(
        "Pipeline:   page size {}, concurrency {}, chunk size {}",
        settings.page_size, settings.concurrency, settings.chunk_size
    );
    println!("Confidence: > {} auto-applied", settings.min_confidence);

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("DB size:    {}", format_bytes(size));

        let conn = get_connection(&db_path)?;
        let categories: i64 = conn.query_row("SELECT count(*) FROM categories WHERE is_active = 1", [], |r| r.get(0))?;
        let transactions: i64 = conn.query_row("SELECT count(*) FROM transactions", [], |r| r.get(0))?;
        let categorized: i64 = conn.query_row(
            "SELECT count(*) FROM transactions WHERE category IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let verified: i64 = conn.query_row("SELECT count(*) FROM transactions WHERE verified = 1", [], |r| r.get(0))?;
        let total: f64 = conn.query_row(
            "SELECT coalesce(sum(CAST(amount AS REAL)), 0) FROM transactions",
            [],
            |r| r.get(0),
        )?;

        println!();
        println!("Categories:    {categories}");
        println!("Transactions:  {transactions}");
        println!("Categorized:   {categorized}");
        println!("Verified:      {verified}");
        println!("Total amount:  {}", money(total));
    } else {
        println!();
        println!("Database not found. Run `expensort init` to set up.");
    }

    Ok(())
}
