use std::collections::HashMap;
use std::io::Write;

use colored::Colorize;
use dialoguer::Input;
use rusqlite::Connection;

use crate::error::{ExpensortError, Result};
use crate::fmt;
use crate::grouping::group_by_merchant;
use crate::models::{CategorizedTransaction, CategorySource, TransactionRecord};
use crate::persistence::{persist_group, query_group_duplicates, GroupDuplicates, PreparedItem};
use crate::taxonomy::Taxonomy;

pub const REVIEW_RATIONALE: &str = "manual review";
pub const DEFAULT_EXEMPLARS: usize = 5;

/// Source of the operator's decision for one group. `Ok(None)` ends the review.
pub trait CategoryPrompt {
    fn select(&mut self, options: &[String], default: &str) -> Result<Option<String>>;
}

/// Reads a category code from the terminal. Enter accepts the default,
/// `q` quits.
pub struct TerminalPrompt;

impl CategoryPrompt for TerminalPrompt {
    fn select(&mut self, _options: &[String], default: &str) -> Result<Option<String>> {
        let choice: String = Input::new()
            .with_prompt("Category code (Enter to accept, q=quit)")
            .default(default.to_string())
            .interact_text()
            .map_err(|e| ExpensortError::Other(format!("prompt failed: {e}")))?;
        let choice = choice.trim();
        if choice.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        Ok(Some(choice.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ReviewOptions {
    /// Rows shown per block before "+K more".
    pub exemplars: usize,
    /// Suggestions with an effective score above this are not reviewed.
    pub min_confidence: f64,
}

impl Default for ReviewOptions {
    fn default() -> Self {
        Self {
            exemplars: DEFAULT_EXEMPLARS,
            min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewGroup {
    pub items: Vec<PreparedItem>,
    pub suggested: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    /// Input order, with reviewed groups replaced by the operator's choice.
    pub results: Vec<CategorizedTransaction>,
    pub reviewed_groups: usize,
    pub pending_groups: usize,
    pub quit: bool,
}

/// Low-confidence suggestions grouped by merchant, in order of first appearance.
pub fn build_review_groups(
    provider: &str,
    suggestions: &[CategorizedTransaction],
    min_confidence: f64,
) -> Vec<ReviewGroup> {
    let positions: Vec<usize> = (0..suggestions.len())
        .filter(|&p| suggestions[p].effective_score() <= min_confidence)
        .collect();
    let records: Vec<TransactionRecord> = positions.iter().map(|&p| suggestions[p].transaction.clone()).collect();
    let groups = group_by_merchant(&records);
    groups
        .iter()
        .map(|(_, members)| {
            let items = members
                .iter()
                .map(|&m| PreparedItem::new(provider, positions[m], &records[m]))
                .collect();
            let suggested = members.iter().map(|&m| suggestions[positions[m]].category.clone()).collect();
            ReviewGroup { items, suggested }
        })
        .collect()
}

/// Unanimous stored category if any, otherwise the most common suggestion
/// with ties broken alphabetically.
pub fn select_default_category(stored: &GroupDuplicates, suggested: &[String]) -> Option<String> {
    if let Some(cat) = &stored.unanimous {
        return Some(cat.clone());
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in suggested {
        *counts.entry(s.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .min_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
        .map(|(cat, _)| cat.to_string())
}

fn fmt_row(tx: &TransactionRecord) -> String {
    let desc: String = tx
        .description
        .as_deref()
        .or(tx.merchant.as_deref())
        .unwrap_or_default()
        .chars()
        .take(60)
        .collect();
    format!(
        "{}\t{}\t{}\t{}",
        tx.date.as_deref().unwrap_or_default(),
        fmt::amount(tx.amount.as_deref()),
        desc,
        tx.id.as_deref().unwrap_or_default()
    )
}

fn print_block(out: &mut impl Write, title: &str, rows: &[String], exemplars: usize) -> Result<()> {
    writeln!(out, "{}", title.bold())?;
    for row in rows.iter().take(exemplars) {
        writeln!(out, "   {row}")?;
    }
    if rows.len() > exemplars {
        writeln!(out, "  +{} more", rows.len() - exemplars)?;
    }
    Ok(())
}

/// Walk each low-confidence group, ask for a category and persist it as
/// `manual` before moving on. Unknown codes are rejected and asked again.
#[allow(clippy::too_many_arguments)]
pub fn review_transaction_categories(
    conn: &Connection,
    provider: &str,
    account: Option<&str>,
    suggestions: &[CategorizedTransaction],
    taxonomy: &Taxonomy,
    prompt: &mut dyn CategoryPrompt,
    options: &ReviewOptions,
    out: &mut impl Write,
) -> Result<ReviewOutcome> {
    let groups = build_review_groups(provider, suggestions, options.min_confidence);
    let codes: Vec<String> = taxonomy.codes().into_iter().map(str::to_string).collect();
    let mut results = suggestions.to_vec();
    let mut reviewed = 0;

    if groups.is_empty() {
        writeln!(out, "{}", "No transactions need review.".green())?;
    }

    for (n, group) in groups.iter().enumerate() {
        writeln!(out, "{}", "\u{2500}".repeat(60))?;
        let rows: Vec<String> = group.items.iter().map(|i| fmt_row(&i.record)).collect();
        print_block(
            out,
            &format!("Group {}/{} (date\tamount\tdescription\tid):", n + 1, groups.len()),
            &rows,
            options.exemplars,
        )?;

        let eids: Vec<String> = group.items.iter().filter_map(|i| i.external_id.clone()).collect();
        let fps: Vec<String> = group.items.iter().map(|i| i.fingerprint.clone()).collect();
        let stored = query_group_duplicates(conn, provider, account, &eids, &fps, options.exemplars + 1)?;
        if stored.rows.is_empty() {
            writeln!(out, "No stored duplicates for this group.")?;
        } else {
            let dup_rows: Vec<String> = stored
                .rows
                .iter()
                .map(|r| format!("{}\t[{}]", fmt_row(&r.record), r.category.as_deref().unwrap_or("uncategorized")))
                .collect();
            print_block(out, "Stored duplicates:", &dup_rows, options.exemplars)?;
        }

        let default = select_default_category(&stored, &group.suggested).unwrap_or_default();
        writeln!(out, "Proposed category: {}", default.cyan())?;

        let chosen = loop {
            match prompt.select(&codes, &default)? {
                None => {
                    writeln!(out, "{}", "Review paused.".yellow())?;
                    return Ok(ReviewOutcome {
                        results,
                        reviewed_groups: reviewed,
                        pending_groups: groups.len() - reviewed,
                        quit: true,
                    });
                }
                Some(code) if taxonomy.contains(&code) => break code,
                Some(code) => writeln!(out, "{}", format!("Unknown category code: {code}").red())?,
            }
        };

        persist_group(conn, provider, account, &group.items, &chosen, CategorySource::Manual)?;
        for item in &group.items {
            results[item.pos] = CategorizedTransaction::assigned(item.record.clone(), &chosen, REVIEW_RATIONALE);
        }
        reviewed += 1;
        writeln!(out, "{}", format!("\u{2192} {} transaction(s) set to {chosen}", group.items.len()).green())?;
    }

    Ok(ReviewOutcome {
        results,
        reviewed_groups: reviewed,
        pending_groups: 0,
        quit: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::persistence::prepare;
    use crate::taxonomy::load_taxonomy;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    struct ScriptedPrompt {
        answers: Vec<Option<String>>,
        defaults: Vec<String>,
    }

    impl ScriptedPrompt {
        fn new(answers: &[Option<&str>]) -> Self {
            Self {
                answers: answers.iter().rev().map(|a| a.map(str::to_string)).collect(),
                defaults: Vec::new(),
            }
        }
    }

    impl CategoryPrompt for ScriptedPrompt {
        fn select(&mut self, _options: &[String], default: &str) -> Result<Option<String>> {
            self.defaults.push(default.to_string());
            Ok(self.answers.pop().unwrap_or(None))
        }
    }

    fn suggestion(id: &str, merchant: &str, category: &str, score: f64) -> CategorizedTransaction {
        CategorizedTransaction {
            transaction: TransactionRecord {
                id: Some(id.into()),
                description: Some(format!("{merchant} purchase")),
                amount: Some("-5.00".into()),
                date: Some("2025-08-01".into()),
                merchant: Some(merchant.into()),
                memo: None,
            },
            category: category.into(),
            rationale: "r".into(),
            score,
            revised_category: None,
            revised_rationale: None,
            revised_score: None,
            citations: None,
        }
    }

    fn stored_category(conn: &Connection, eid: &str) -> Option<(String, String, bool)> {
        conn.query_row(
            "SELECT category, category_source, verified FROM transactions WHERE external_id = ?1",
            [eid],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .ok()
    }

    #[test]
    fn test_default_prefers_unanimous_stored() {
        let stored = GroupDuplicates {
            rows: vec![],
            unanimous: Some("Fuel".into()),
        };
        assert_eq!(select_default_category(&stored, &["Rideshare".into()]).as_deref(), Some("Fuel"));
    }

    #[test]
    fn test_default_most_common_ties_alphabetical() {
        let none = GroupDuplicates::default();
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(
            select_default_category(&none, &s(&["Taxi", "Rideshare", "Taxi"])).as_deref(),
            Some("Taxi")
        );
        assert_eq!(
            select_default_category(&none, &s(&["Taxi", "Rideshare"])).as_deref(),
            Some("Rideshare")
        );
        assert_eq!(select_default_category(&none, &[]), None);
    }

    #[test]
    fn test_build_review_groups_skips_confident() {
        let suggestions = vec![
            suggestion("a", "Uber", "Rideshare", 0.5),
            suggestion("b", "Cafe", "Coffee Shops", 0.95),
            suggestion("c", "uber", "Taxi", 0.6),
        ];
        let groups = build_review_groups("amex", &suggestions, 0.7);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].items.iter().map(|i| i.pos).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(groups[0].suggested, vec!["Rideshare", "Taxi"]);
    }

    #[test]
    fn test_review_persists_each_group_and_rejects_unknown_codes() {
        let (_dir, conn) = test_db();
        let taxonomy = load_taxonomy(&conn).unwrap();
        let suggestions = vec![
            suggestion("a", "Uber", "Restaurants", 0.5),
            suggestion("b", "Cafe", "Restaurants", 0.4),
            suggestion("c", "uber", "Groceries", 0.3),
        ];
        let mut prompt = ScriptedPrompt::new(&[Some("Nope"), Some("Groceries"), Some("Restaurants")]);
        let mut out = Vec::new();
        let outcome = review_transaction_categories(
            &conn,
            "amex",
            None,
            &suggestions,
            &taxonomy,
            &mut prompt,
            &ReviewOptions::default(),
            &mut out,
        )
        .unwrap();

        assert!(!outcome.quit);
        assert_eq!(outcome.reviewed_groups, 2);
        assert_eq!(outcome.results[0].category, "Groceries");
        assert_eq!(outcome.results[2].category, "Groceries");
        assert_eq!(outcome.results[2].rationale, REVIEW_RATIONALE);
        assert_eq!(outcome.results[1].category, "Restaurants");
        assert_eq!(prompt.defaults[0], "Groceries");

        let (cat, source, verified) = stored_category(&conn, "c").unwrap();
        assert_eq!(cat, "Groceries");
        assert_eq!(source, "manual");
        assert!(verified);
        assert!(String::from_utf8(out).unwrap().contains("Unknown category code: Nope"));
    }

    #[test]
    fn test_quit_keeps_earlier_groups() {
        let (_dir, conn) = test_db();
        let taxonomy = load_taxonomy(&conn).unwrap();
        let suggestions = vec![
            suggestion("a", "Uber", "Restaurants", 0.5),
            suggestion("b", "Cafe", "Groceries", 0.4),
        ];
        let mut prompt = ScriptedPrompt::new(&[Some("Restaurants"), None]);
        let outcome = review_transaction_categories(
            &conn,
            "amex",
            None,
            &suggestions,
            &taxonomy,
            &mut prompt,
            &ReviewOptions::default(),
            &mut std::io::sink(),
        )
        .unwrap();
        assert!(outcome.quit);
        assert_eq!(outcome.reviewed_groups, 1);
        assert_eq!(outcome.pending_groups, 1);
        assert!(stored_category(&conn, "a").is_some());
        assert!(stored_category(&conn, "b").is_none());
        assert_eq!(outcome.results[1].rationale, "r");
    }

    #[test]
    fn test_stored_unanimous_becomes_default() {
        let (_dir, conn) = test_db();
        let taxonomy = load_taxonomy(&conn).unwrap();
        let prior = suggestion("a", "Uber", "Groceries", 0.5);
        persist_group(
            &conn,
            "amex",
            Some("gold"),
            &prepare("amex", &[prior.transaction.clone()]),
            "Restaurants",
            CategorySource::Manual,
        )
        .unwrap();

        let mut prompt = ScriptedPrompt::new(&[Some("Restaurants")]);
        review_transaction_categories(
            &conn,
            "amex",
            Some("gold"),
            &[prior],
            &taxonomy,
            &mut prompt,
            &ReviewOptions::default(),
            &mut std::io::sink(),
        )
        .unwrap();
        assert_eq!(prompt.defaults, vec!["Restaurants"]);
    }
}
