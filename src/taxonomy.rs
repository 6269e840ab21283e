use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{ExpensortError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub code: String,
    pub parent_code: Option<String>,
    pub display_name: String,
}

/// Labels a model may fall back to, in preference order.
const FALLBACK_LABELS: &[&str] = &["Other", "Unknown"];

/// Validated two-level category set. Every child points at a top-level entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
    codes: HashSet<String>,
}

impl Taxonomy {
    pub fn new(entries: Vec<TaxonomyEntry>) -> Result<Self> {
        let mut parents: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for e in &entries {
            if e.code.trim().is_empty() {
                return Err(ExpensortError::Taxonomy("category code cannot be blank".into()));
            }
            if parents.insert(e.code.as_str(), e.parent_code.as_deref()).is_some() {
                return Err(ExpensortError::Taxonomy(format!("duplicate code {:?}", e.code)));
            }
        }
        if entries.is_empty() {
            return Err(ExpensortError::Taxonomy("taxonomy has no categories".into()));
        }
        for e in &entries {
            let Some(parent) = e.parent_code.as_deref() else {
                continue;
            };
            match parents.get(parent) {
                None => {
                    return Err(ExpensortError::Taxonomy(format!(
                        "{:?} references unknown parent {parent:?}",
                        e.code
                    )))
                }
                Some(Some(_)) => {
                    return Err(ExpensortError::Taxonomy(format!(
                        "{:?} is nested under child {parent:?}; only two levels are allowed",
                        e.code
                    )))
                }
                Some(None) => {}
            }
        }
        let codes = entries.iter().map(|e| e.code.clone()).collect();
        Ok(Self { entries, codes })
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    /// Codes in taxonomy order; this is the schema enum.
    pub fn codes(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.code.as_str()).collect()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn fallback_label(&self) -> Option<&'static str> {
        FALLBACK_LABELS.iter().copied().find(|l| self.contains(l))
    }

    /// Entries ordered by `(parent_code, code)` for hashing.
    pub fn sorted_for_hash(&self) -> Vec<TaxonomyEntry> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| {
            let ka = (a.parent_code.as_deref().unwrap_or(""), a.code.as_str());
            let kb = (b.parent_code.as_deref().unwrap_or(""), b.code.as_str());
            ka.cmp(&kb)
        });
        sorted
    }

    pub fn top_level(&self) -> Vec<&TaxonomyEntry> {
        let mut parents: Vec<&TaxonomyEntry> =
            self.entries.iter().filter(|e| e.parent_code.is_none()).collect();
        parents.sort_by(|a, b| (&a.display_name, &a.code).cmp(&(&b.display_name, &b.code)));
        parents
    }

    pub fn children_of(&self, parent: &str) -> Vec<&TaxonomyEntry> {
        let mut kids: Vec<&TaxonomyEntry> = self
            .entries
            .iter()
            .filter(|e| e.parent_code.as_deref() == Some(parent))
            .collect();
        kids.sort_by(|a, b| (&a.display_name, &a.code).cmp(&(&b.display_name, &b.code)));
        kids
    }
}

pub fn load_taxonomy(conn: &Connection) -> Result<Taxonomy> {
    let mut stmt = conn.prepare(
        "SELECT code, parent_code, display_name FROM categories \
         WHERE is_active = 1 ORDER BY sort_order, code",
    )?;
    let entries = stmt
        .query_map([], |row| {
            Ok(TaxonomyEntry {
                code: row.get(0)?,
                parent_code: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Taxonomy::new(entries)
}

/// Trim and collapse internal whitespace; case is preserved.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn validate_name(name: &str) -> Result<String> {
    let n = normalize_name(name);
    if n.is_empty() {
        return Err(ExpensortError::Taxonomy("name cannot be empty".into()));
    }
    if n.chars().count() > 64 {
        return Err(ExpensortError::Taxonomy(format!("{n:?} is longer than 64 characters")));
    }
    let allowed = Regex::new(r"^[A-Za-z0-9 &\-/]+$").map_err(|e| ExpensortError::Other(e.to_string()))?;
    if !allowed.is_match(&n) {
        return Err(ExpensortError::Taxonomy(format!(
            "{n:?}: only letters, numbers, spaces, and & - / are allowed"
        )));
    }
    Ok(n)
}

#[derive(Debug, Deserialize)]
struct SeedParent {
    code: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    children: Vec<SeedChild>,
}

#[derive(Debug, Deserialize)]
struct SeedChild {
    code: Option<String>,
    display_name: Option<String>,
}

fn seed_names(code: Option<String>, display_name: Option<String>) -> Result<(String, String)> {
    let code = code
        .or_else(|| display_name.clone())
        .ok_or_else(|| ExpensortError::Taxonomy("seed entry needs a code or display_name".into()))?;
    let code = validate_name(&code)?;
    let display = match display_name {
        Some(d) if !d.trim().is_empty() => validate_name(&d)?,
        _ => code.clone(),
    };
    Ok((code, display))
}

/// Replace the category table from a JSON list of parents with `children`.
/// All parents come first in input order, then every child grouped by parent;
/// `sort_order` is the position in that sequence.
pub fn reseed_from_json(conn: &mut Connection, json: &str) -> Result<usize> {
    let parents: Vec<SeedParent> = serde_json::from_str(json)?;
    let mut top = Vec::with_capacity(parents.len());
    let mut nested = Vec::new();
    for parent in parents {
        let (pcode, pname) = seed_names(parent.code, parent.display_name)?;
        for child in parent.children {
            let (ccode, cname) = seed_names(child.code, child.display_name)?;
            nested.push(TaxonomyEntry {
                code: ccode,
                parent_code: Some(pcode.clone()),
                display_name: cname,
            });
        }
        top.push(TaxonomyEntry {
            code: pcode,
            parent_code: None,
            display_name: pname,
        });
    }
    top.extend(nested);
    let taxonomy = Taxonomy::new(top)?;

    let tx = conn.transaction()?;
    tx.execute("UPDATE transactions SET category = NULL WHERE category IS NOT NULL", [])?;
    tx.execute("DELETE FROM categories", [])?;
    // Parents precede children, so the self-reference resolves on insert.
    for (order, e) in taxonomy.entries().iter().enumerate() {
        tx.execute(
            "INSERT INTO categories (code, display_name, parent_code, sort_order) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![e.code, e.display_name, e.parent_code, order as i64],
        )?;
    }
    tx.commit()?;
    Ok(taxonomy.entries().len())
}
