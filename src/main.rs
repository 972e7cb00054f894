use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use metalab::classify;
use metalab::db::Db;
use metalab::discover;
use metalab::limitless::LimitlessClient;
use metalab::repair;
use metalab::reset;
use metalab::sync::{self, SyncOptions, TIER1_ORGANIZERS};
use metalab::util::env as env_util;

#[derive(Parser, Debug)]
#[command(name = "metalab", version, about = "MetaLab tournament data admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Sync tournament data from the platform for one organizer or the tier-1 set
    Sync {
        /// Organizer ID to sync
        #[arg(long, conflicts_with = "all_tier1")]
        organizer: Option<i64>,
        /// Sync every tier-1 organizer
        #[arg(long, default_value_t = false)]
        all_tier1: bool,
        /// Only sync tournaments on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: NaiveDate,
        /// Show what would be synced without writing to the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Max tournaments to sync per organizer (useful for testing)
        #[arg(long)]
        limit: Option<usize>,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Complete partially-ingested tournaments with row-level checks
    Repair {
        /// Limit the scan to one organizer's store
        #[arg(long)]
        organizer: Option<i64>,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Delete ingested tournament data (deck mappings and archetypes are preserved)
    Reset {
        /// Limit the reset to these organizers' stores; omit for a global reset
        #[arg(long, value_delimiter = ',')]
        organizer: Vec<i64>,
        /// Skip the confirmation prompt
        #[arg(long, default_value_t = false)]
        yes: bool,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Classify stored UNKNOWN decklists by signature cards
    Classify {
        /// Preview changes without applying
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Scan recent tournaments for organizers worth onboarding
    Discover {
        /// Listing pages to scan
        #[arg(long, default_value_t = 10)]
        pages: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            organizer,
            all_tier1,
            since,
            dry_run,
            limit,
            db_url,
        } => {
            let organizers: Vec<i64> = if all_tier1 {
                TIER1_ORGANIZERS.iter().map(|(id, _)| *id).collect()
            } else if let Some(id) = organizer {
                vec![id]
            } else {
                bail!("either --organizer ID or --all-tier1 is required");
            };
            let db = connect(db_url).await?;
            let api = LimitlessClient::from_env()?;
            let opts = SyncOptions {
                since,
                dry_run,
                limit,
            };
            run_sync(&db, &api, &organizers, &opts).await
        }
        Commands::Repair { organizer, db_url } => {
            let db = connect(db_url).await?;
            let api = LimitlessClient::from_env()?;
            let summary = repair::repair(&db, &api, organizer).await?;
            println!("Repair complete:");
            println!("  tournaments flagged: {}", summary.tournaments_flagged);
            println!("  results inserted:    {}", summary.results_inserted);
            println!("  matches inserted:    {}", summary.matches_inserted);
            Ok(())
        }
        Commands::Reset {
            organizer,
            yes,
            db_url,
        } => {
            let db = connect(db_url).await?;
            run_reset(&db, &organizer, yes).await
        }
        Commands::Classify { dry_run, db_url } => {
            let db = connect(db_url).await?;
            let summary = classify::backfill_unknown(&db, dry_run).await?;
            println!("Examined {} UNKNOWN results with decklists", summary.examined);
            println!("{}", "=".repeat(50));
            for (archetype, count) in &summary.by_archetype {
                println!("  {archetype:<30} {count:>5}");
            }
            println!("{}", "-".repeat(50));
            println!("  {:<30} {:>5}", "Total classified", summary.classified);
            println!(
                "  {:<30} {:>5}",
                "Remaining UNKNOWN",
                summary.examined - summary.classified
            );
            if dry_run {
                println!("\n[dry-run] no changes applied");
            }
            Ok(())
        }
        Commands::Discover { pages } => {
            let api = LimitlessClient::from_env()?;
            run_discover(&api, pages).await
        }
    }
}

async fn connect(db_url_override: Option<String>) -> Result<Db> {
    let database_url = match db_url_override {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    info!(dsn = %env_util::redact_dsn(&database_url), "connecting");
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5u32);
    Db::connect(&database_url, max_conns).await
}

async fn run_sync(
    db: &Db,
    api: &LimitlessClient,
    organizers: &[i64],
    opts: &SyncOptions,
) -> Result<()> {
    let mut all_stats = Vec::new();
    let mut failures: Vec<(i64, String)> = Vec::new();
    for &organizer_id in organizers {
        match sync::sync_organizer(db, api, organizer_id, opts).await {
            Ok(stats) => all_stats.push(stats),
            Err(e) => {
                error!(organizer_id, error = %e, "organizer sync failed");
                failures.push((organizer_id, e.to_string()));
            }
        }
    }

    let synced: usize = all_stats.iter().map(|s| s.tournaments_synced).sum();
    let skipped: usize = all_stats.iter().map(|s| s.tournaments_skipped).sum();
    let results: usize = all_stats.iter().map(|s| s.results_inserted).sum();
    let matches: usize = all_stats.iter().map(|s| s.matches_inserted).sum();
    let players: usize = all_stats.iter().map(|s| s.players_created).sum();
    let requests: usize = all_stats.iter().map(|s| s.deck_requests_created).sum();

    println!("{}", "=".repeat(60));
    println!("SYNC COMPLETE");
    println!("{}", "=".repeat(60));
    println!("Tournaments synced:  {synced}");
    println!("Tournaments skipped: {skipped}");
    println!("Results inserted:    {results}");
    println!("Matches inserted:    {matches}");
    println!("New players:         {players}");
    println!("Deck requests:       {requests}");
    if !failures.is_empty() {
        println!("\nErrors: {}", failures.len());
        for (organizer_id, err) in &failures {
            println!("  - organizer {organizer_id}: {err}");
        }
    }
    if opts.dry_run {
        println!("\n[dry-run] no changes were written to the database");
    }
    if requests > 0 {
        println!("\nNote: {requests} new deck request(s) await archetype curation.");
    }
    Ok(())
}

async fn run_reset(db: &Db, organizers: &[i64], yes: bool) -> Result<()> {
    println!("Current data counts:");
    for (table, count) in reset::ingested_counts(db).await? {
        println!("  {table}: {count}");
    }

    if organizers.is_empty() {
        println!("\nWARNING: this deletes ALL matches, results, tournaments, sync state and players.");
    } else {
        println!(
            "\nWARNING: this deletes matches, results, tournaments and sync state for organizers {organizers:?}."
        );
    }
    println!("Deck mappings, deck requests, archetypes and the ingestion log are preserved.");

    if !yes {
        print!("\nType 'DELETE' to confirm: ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        if line.trim() != "DELETE" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let summary = reset::reset(db, organizers).await?;
    println!("\nDeleted:");
    println!("  matches:     {}", summary.matches);
    println!("  results:     {}", summary.results);
    println!("  tournaments: {}", summary.tournaments);
    println!("  sync_state:  {}", summary.sync_states);
    if organizers.is_empty() {
        println!("  players:     {}", summary.players);
    }
    Ok(())
}

async fn run_discover(api: &LimitlessClient, pages: u32) -> Result<()> {
    let candidates = discover::discover(api, pages).await;
    println!(
        "Found {} organizers outside the tier-1 set",
        candidates.len()
    );
    println!("{}", "-".repeat(70));
    for c in &candidates {
        let coverage = match c.deck_coverage {
            Some(pct) if pct >= 80.0 => format!("{pct:.0}% GOOD"),
            Some(pct) if pct >= 50.0 => format!("{pct:.0}% PARTIAL"),
            Some(pct) => format!("{pct:.0}% LOW"),
            None => "no data".to_string(),
        };
        println!(
            "  ID: {:<8} | {:>3} tournaments | {:<12} | {}",
            c.organizer_id, c.tournaments, coverage, c.sample_name
        );
    }
    Ok(())
}
