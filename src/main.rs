mod cache;
mod categorize;
mod classifier;
mod cli;
mod db;
mod error;
mod fanout;
mod fingerprint;
mod fmt;
mod grouping;
mod importer;
mod logging;
mod models;
mod paginate;
mod partition;
mod persistence;
mod pool;
mod prefetch;
mod prompting;
mod retry;
mod reviewer;
mod settings;
mod taxonomy;

use clap::Parser;

use cli::{Cli, Commands, TaxonomyCommands};

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Categorize {
            source,
            pipeline,
            persist,
        } => cli::categorize::run(&source, &pipeline, persist),
        Commands::Review {
            source,
            pipeline,
            exemplars,
        } => cli::review::run(&source, &pipeline, exemplars),
        Commands::Partition {
            file,
            years,
            months,
            weeks,
            days,
        } => cli::partition::run(&file, years, months, weeks, days),
        Commands::Taxonomy { command } => match command {
            TaxonomyCommands::List => cli::taxonomy::list(),
            TaxonomyCommands::Reseed { file } => cli::taxonomy::reseed(&file),
        },
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
