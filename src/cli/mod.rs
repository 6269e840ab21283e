pub mod categorize;
pub mod init;
pub mod partition;
pub mod review;
pub mod status;
pub mod taxonomy;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::categorize::{CategorizeOptions, Categorizer};
use crate::classifier::openai::OpenAiClassifier;
use crate::db::{get_connection, init_db};
use crate::error::{ExpensortError, Result};
use crate::importer::{get_by_key, load_transactions};
use crate::models::TransactionRecord;
use crate::retry::RetryPolicy;
use crate::settings::Settings;
use crate::taxonomy::load_taxonomy;

#[derive(Parser)]
#[command(name = "expensort", about = "Categorize card transactions with an LLM, review, and store them.")]
pub struct Cli {
    /// More log output on stderr (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by commands that read a CSV and talk to the store.
#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Path to the CSV export
    pub file: PathBuf,
    /// Source provider recorded with stored rows (default from settings)
    #[arg(long)]
    pub provider: Option<String>,
    /// Source account recorded with stored rows
    #[arg(long)]
    pub account: Option<String>,
    /// CSV format key: amex, amex_enhanced or canonical (detected when omitted)
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    /// Exemplars per classifier request
    #[arg(long = "page-size")]
    pub page_size: Option<usize>,
    /// Maximum requests in flight
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Skip the on-disk result cache
    #[arg(long = "no-cache")]
    pub no_cache: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for expensort data (default: ~/.local/share/expensort)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Categorize every row of a CSV and print `<id>\t<category>`.
    Categorize {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Store stored-duplicate matches and confident suggestions
        #[arg(long)]
        persist: bool,
    },
    /// Categorize a CSV, then review low-confidence groups interactively.
    Review {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Rows shown per group before "+K more"
        #[arg(long, default_value_t = crate::reviewer::DEFAULT_EXEMPLARS)]
        exemplars: usize,
    },
    /// Split a CSV into consecutive date windows.
    Partition {
        /// Path to the CSV export
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        years: u32,
        #[arg(long, default_value_t = 0)]
        months: u32,
        #[arg(long, default_value_t = 0)]
        weeks: u32,
        #[arg(long, default_value_t = 0)]
        days: u32,
    },
    /// Inspect or replace the category taxonomy.
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommands,
    },
    /// Show settings, database and cache summary.
    Status,
}

#[derive(Subcommand)]
pub enum TaxonomyCommands {
    /// List active categories as a tree.
    List,
    /// Replace all categories from a JSON file of parents with `children`.
    Reseed {
        #[arg(long)]
        file: PathBuf,
    },
}

impl SourceArgs {
    pub fn provider(&self, settings: &Settings) -> String {
        self.provider
            .clone()
            .unwrap_or_else(|| settings.source_provider.clone())
    }

    /// Read the CSV with the requested format, or the detected one.
    pub fn load(&self) -> Result<Vec<TransactionRecord>> {
        let format = match self.format.as_deref() {
            Some(key) => Some(
                get_by_key(key).ok_or_else(|| ExpensortError::InvalidArgument(format!("unknown CSV format: {key}")))?,
            ),
            None => None,
        };
        load_transactions(&self.file, format)
    }
}

impl PipelineArgs {
    pub fn options(&self, settings: &Settings) -> CategorizeOptions {
        CategorizeOptions {
            page_size: self.page_size.unwrap_or(settings.page_size),
            concurrency: self.concurrency.unwrap_or(settings.concurrency),
            retry: RetryPolicy::default(),
            invalid_category: settings.invalid_category,
        }
    }
}

/// Open (and create if needed) the database under the configured data dir.
pub(crate) fn open_db(settings: &Settings) -> Result<Connection> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;
    Ok(conn)
}

/// Build the categorizer against the stored taxonomy.
pub(crate) fn build_categorizer(
    classifier: OpenAiClassifier,
    conn: &Connection,
    options: CategorizeOptions,
) -> Result<Categorizer> {
    let taxonomy = Arc::new(load_taxonomy(conn)?);
    Categorizer::new(Arc::new(classifier), taxonomy, options)
}
