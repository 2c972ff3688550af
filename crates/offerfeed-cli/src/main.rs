use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offerfeed_adapters::{EmbeddedPage, TemplateRegistry, TrimCatalog};
use offerfeed_sync::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Debug, Parser)]
#[command(name = "offerfeed-cli")]
#[command(about = "Vehicle offer feed command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled feed once and publish what passes the gate.
    Sync,
    /// Check a published catalog CSV.
    Validate { path: PathBuf },
    /// Print the offers found in a page or text file.
    Extract {
        file: PathBuf,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long, value_delimiter = ',')]
        trims: Vec<String>,
    },
    /// Summarize recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = std::env::var("OFFERFEED_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = offerfeed_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} feeds={} published={} reports={}",
                summary.run_id,
                summary.feeds.len(),
                summary.published_feeds(),
                summary.reports_dir
            );
            for feed in &summary.feeds {
                let status = match (&feed.error, &feed.publish) {
                    (Some(err), _) => format!("failed: {err}"),
                    (None, Some(publish)) => match &publish.rejection_reason {
                        None => format!("published {} rows", publish.row_count),
                        Some(reason) => format!("rejected: {reason}"),
                    },
                    (None, None) => "skipped".to_string(),
                };
                println!("  {}: {status}", feed.feed_id);
                if !feed.skipped_items.is_empty() {
                    println!("    skipped {} items", feed.skipped_items.len());
                }
            }
        }
        Commands::Validate { path } => {
            let report = offerfeed_storage::validate_catalog_file(&path).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                bail!("{} failed validation with {} errors", path.display(), report.errors.len());
            }
        }
        Commands::Extract {
            file,
            base_url,
            trims,
        } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let templates = TemplateRegistry::with_defaults()?;
            let is_html = file
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
                .unwrap_or(false);
            let extraction = if is_html {
                let page = EmbeddedPage::parse(&text, base_url.as_deref())?;
                templates.extract_with_fallback(&page.legal_text(), &page.body_text)
            } else {
                templates.extract(&text)
            };

            let catalog = TrimCatalog::new(trims, "Standard");
            let offers: Vec<_> = extraction
                .offers()
                .iter()
                .map(|offer| {
                    serde_json::json!({
                        "trim": (!offer.trim_hint.is_empty()).then(|| catalog.resolve(&offer.trim_hint)),
                        "offer": offer,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "template": extraction.template(),
                    "offers": offers,
                }))?
            );
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!(
                "{}",
                offerfeed_sync::report_recent_markdown(runs, &config.reports_dir)?
            );
        }
    }

    Ok(())
}
