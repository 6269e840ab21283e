use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS categories (
    code TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    parent_code TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (parent_code) REFERENCES categories(code)
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    source_provider TEXT NOT NULL,
    source_account TEXT,
    external_id TEXT,
    fingerprint TEXT NOT NULL UNIQUE,
    raw_record TEXT NOT NULL,
    currency_code TEXT NOT NULL DEFAULT 'USD',
    amount TEXT,
    date TEXT,
    description TEXT,
    merchant TEXT,
    memo TEXT,
    display_name TEXT,
    verified INTEGER NOT NULL DEFAULT 0,
    category TEXT,
    category_source TEXT
        CHECK (category_source IS NULL OR category_source IN ('llm', 'manual', 'rule', 'import', 'unknown')),
    category_confidence REAL
        CHECK (category_confidence IS NULL OR (category_confidence >= 0 AND category_confidence <= 1)),
    categorized_at TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (category) REFERENCES categories(code)
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_transactions_provider_external
    ON transactions (source_provider, external_id)
    WHERE external_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS ix_transactions_scope
    ON transactions (source_provider, source_account);
";

// (code, parent_code)
const DEFAULT_CATEGORIES: &[(&str, Option<&str>)] = &[
    ("Food & Dining", None),
    ("Groceries", Some("Food & Dining")),
    ("Restaurants", Some("Food & Dining")),
    ("Coffee Shops", Some("Food & Dining")),
    ("Transportation", None),
    ("Rideshare", Some("Transportation")),
    ("Fuel", Some("Transportation")),
    ("Parking & Tolls", Some("Transportation")),
    ("Public Transit", Some("Transportation")),
    ("Travel", None),
    ("Airfare", Some("Travel")),
    ("Lodging", Some("Travel")),
    ("Shopping", None),
    ("Clothing", Some("Shopping")),
    ("Electronics", Some("Shopping")),
    ("Home Goods", Some("Shopping")),
    ("Bills & Utilities", None),
    ("Phone & Internet", Some("Bills & Utilities")),
    ("Electricity & Gas", Some("Bills & Utilities")),
    ("Subscriptions", Some("Bills & Utilities")),
    ("Health", None),
    ("Pharmacy", Some("Health")),
    ("Medical", Some("Health")),
    ("Fitness", Some("Health")),
    ("Entertainment", None),
    ("Fees & Charges", None),
    ("Payments & Transfers", None),
    ("Other", None),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM categories", [], |row| row.get(0))?;
    if count == 0 {
        for (order, (code, parent)) in DEFAULT_CATEGORIES.iter().enumerate() {
            conn.execute(
                "INSERT INTO categories (code, display_name, parent_code, sort_order) VALUES (?1, ?1, ?2, ?3)",
                rusqlite::params![code, parent, order as i64],
            )?;
        }
    }
    Ok(())
}
