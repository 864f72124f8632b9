use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use scribe::config::Settings;
use scribe::models::ItemKind;
use scribe::notes::NoteService;
use scribe::rag::EmbeddingMaintenance;
use scribe::state::{build_provider, build_store};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Label {
    Note,
    Journal,
    All,
}

impl Label {
    fn kinds(self) -> &'static [ItemKind] {
        match self {
            Label::Note => &[ItemKind::Note],
            Label::Journal => &[ItemKind::Journal],
            Label::All => &[ItemKind::Note, ItemKind::Journal],
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "scribe-backfill")]
#[command(about = "Embed every note and journal that is missing a vector")]
struct Args {
    /// Settings file (defaults to SCRIBE_CONFIG or scribe.toml)
    #[arg(short, long, env = "SCRIBE_CONFIG")]
    config: Option<String>,

    /// Which items to embed
    #[arg(long, value_enum, default_value_t = Label::All)]
    label: Label,

    /// Also recompute every journal's noteCount from its linked notes
    #[arg(long)]
    repair: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scribe=warn")),
        )
        .init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(file) => Settings::load_from(file)?,
        None => Settings::load()?,
    };

    println!("Connecting to the content store...");
    let store = build_store(&settings).await?;
    println!("Initializing embedding model...");
    let provider = build_provider(&settings)?;

    let maintenance = Arc::new(EmbeddingMaintenance::new(
        store.clone(),
        provider,
        settings.maintenance.batch_size,
    ));

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("looking for items without embeddings");

    let report = maintenance
        .backfill(args.label.kinds(), |progress| {
            pb.set_message(format!(
                "pass {}: {} notes, {} journals embedded, {} failed",
                progress.passes, progress.notes, progress.journals, progress.failed
            ));
        })
        .await?;
    pb.finish_with_message("done");

    println!("\nBack-fill complete!");
    println!("  Notes embedded:    {}", report.notes);
    println!("  Journals embedded: {}", report.journals);
    println!("  Skipped (blank):   {}", report.skipped);
    println!("  Failed:            {}", report.failed);
    println!("  Passes:            {}", report.passes);

    if args.repair {
        let notes = NoteService::new(store, maintenance);
        let repaired = notes.repair_note_counts().await?;
        println!("  Journals repaired: {}", repaired);
    }

    Ok(())
}
