use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use review_coach::{Catalog, QuestionSelector, RandomSource, SeededRandom, SelectorOptions, ThreadRandom};

#[derive(Parser)]
#[command(
    name = "review-coach",
    about = "Detect covered topics in a review and suggest what to ask next",
    version
)]
struct Cli {
    /// Review files to analyze (reads stdin if none provided)
    files: Vec<String>,

    /// TOML catalog to use instead of the built-in hotel categories
    #[arg(long)]
    catalog: Option<String>,

    /// Seed for the category picker, for reproducible suggestions
    #[arg(long)]
    seed: Option<u64>,

    /// Number of successive suggestions to draw per review
    #[arg(long, default_value_t = 1)]
    questions: usize,

    /// Keep shown-question history even when most of the text is deleted
    #[arg(long)]
    no_deletion_reset: bool,
}

fn selector(cli: &Cli, catalog: &Arc<Catalog>) -> QuestionSelector<Box<dyn RandomSource>> {
    let rng: Box<dyn RandomSource> = match cli.seed {
        Some(seed) => Box::new(SeededRandom::new(seed)),
        None => Box::new(ThreadRandom),
    };
    QuestionSelector::with_random(Arc::clone(catalog), rng).with_options(SelectorOptions {
        reset_on_large_deletion: !cli.no_deletion_reset,
        ..SelectorOptions::default()
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let catalog = match &cli.catalog {
        Some(path) => Arc::new(Catalog::load(path).with_context(|| format!("loading catalog {path}"))?),
        None => Catalog::builtin(),
    };

    if cli.files.is_empty() {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("reading stdin")?;
        let report = selector(&cli, &catalog).review(&input, cli.questions);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for path in &cli.files {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            let report = selector(&cli, &catalog).review(&text, cli.questions);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
