use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{self, Config};
use crate::db::Database;
use crate::logging;
use crate::queue::{JobQueue, QueueStats};
use crate::scan_cache::{CacheManager, CacheStats};

#[derive(Parser)]
#[command(name = "mailworker")]
#[command(version)]
#[command(about = "Operate the mail scanning worker's queue and scan cache")]
#[command(long_about = "Administrative commands for the shared worker database.\n\n\
    Examples:\n  \
    mailworker stats --json                 # Queue and cache statistics\n  \
    mailworker invalidate                   # Drop every cached verdict\n  \
    mailworker invalidate --older-than 3600 # Drop verdicts older than an hour\n  \
    mailworker maintain                     # Expire and evict cache entries now")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file [default: <config dir>/config.toml]
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv for more)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expire stale cache entries and evict down to capacity
    Maintain,

    /// Drop cached verdicts; run whenever scanner rules change
    Invalidate {
        /// Only drop entries created more than this many seconds ago
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },

    /// Release job locks held past the staleness window
    Reclaim,

    /// Show queue and cache statistics
    Stats {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Serialize)]
struct Stats {
    queue: QueueStats,
    cache: CacheStats,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_default()?,
        };
        match self.verbose {
            0 => {}
            1 => config.logging.filter = "debug".to_string(),
            _ => config.logging.filter = "trace".to_string(),
        }
        logging::init(&config.logging);

        if let Commands::Config = self.command {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            if self.config.is_none() {
                if let Some(path) = config::default_config_path() {
                    println!("# {}", path.display());
                }
            }
            print!("{rendered}");
            return Ok(());
        }

        let db = Database::open(&config.database.path).with_context(|| {
            format!("Failed to open database: {}", config.database.path.display())
        })?;
        let cache = CacheManager::new(&db, config.cache.clone());
        let queue = JobQueue::new(&db, &config.queue);

        match self.command {
            Commands::Maintain => {
                let report = cache.maintain()?;
                println!(
                    "Expired {} entries, evicted {}, {} remaining",
                    report.expired, report.evicted, report.remaining
                );
            }
            Commands::Invalidate { older_than } => {
                let removed = match older_than {
                    Some(secs) => cache.invalidate_older_than(cutoff_before(Utc::now(), secs)?)?,
                    None => cache.invalidate_all()?,
                };
                println!("Invalidated {removed} cache entries");
            }
            Commands::Reclaim => {
                let reclaimed = queue.reclaim_stale()?;
                println!("Reclaimed {reclaimed} stale job locks");
            }
            Commands::Stats { json } => {
                let stats = Stats {
                    queue: queue.stats()?,
                    cache: cache.stats()?,
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    print_stats(&stats);
                }
            }
            Commands::Config => {}
        }
        Ok(())
    }
}

/// `now - secs`, rejecting ages that do not fit a timestamp
fn cutoff_before(now: DateTime<Utc>, secs: u64) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than {secs} is out of range"))
}

fn print_stats(stats: &Stats) {
    println!("Queue:");
    println!("  Ready:   {}", stats.queue.ready);
    println!("  Locked:  {}", stats.queue.locked);
    println!("  Delayed: {}", stats.queue.delayed);
    println!("  Dead:    {}", stats.queue.dead);
    println!();
    println!("Scan cache:");
    println!("  Entries:    {}", stats.cache.entries);
    println!("  Total hits: {}", stats.cache.total_uses);
    match (stats.cache.oldest_entry, stats.cache.newest_entry) {
        (Some(oldest), Some(newest)) => {
            println!("  Oldest:     {}", oldest.to_rfc3339());
            println!("  Newest:     {}", newest.to_rfc3339());
        }
        _ => println!("  (empty)"),
    }
}
