//! QuoteVault CLI — fetch, prefetch, and cache management commands.
//!
//! Commands:
//! - `history` — bring a universe's daily table up to date and summarize it
//! - `minute` — fetch minute bars for one instrument and session
//! - `prefetch` — start a warm-up run, or report the persisted state
//! - `names` — refresh the instrument name map
//! - `cache status` / `cache clear` — inspect or drop the minute cache
//! - `cache backup` / `cache restore` — export or import the data tree

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use quotevault_core::domain::{Instrument, Period};
use quotevault_core::{DataHub, VaultConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "quotevault",
    about = "QuoteVault CLI — market data acquisition and cache engine"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "quotevault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a universe's daily history up to date and summarize it.
    History {
        /// Index universe code (e.g. 000300).
        #[arg(default_value = "000300")]
        universe: String,
    },
    /// Fetch minute bars for one instrument and session.
    Minute {
        /// Instrument code (e.g. 600000).
        code: String,

        /// Treat the code as an index instead of a stock.
        #[arg(long, default_value_t = false)]
        index: bool,

        /// Session date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,

        /// Bar period in minutes: 5, 15, 30 or 60.
        #[arg(long)]
        period: Option<u32>,

        /// Evict any cached entry first and refetch.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Start a prefetch run for a universe, or report the last run.
    Prefetch {
        #[arg(default_value = "000300")]
        universe: String,

        /// Only print the persisted state, do not start a run.
        #[arg(long, default_value_t = false)]
        status: bool,

        /// Block until the run finishes.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Refresh the instrument name map.
    Names {
        /// Specific codes to resolve; with none, the full map is refreshed.
        codes: Vec<String>,

        /// Bypass the freshness gate and refetch unconditionally.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Minute-cache inspection and maintenance.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Report cached minute entries.
    Status,
    /// Remove every cached minute entry.
    Clear,
    /// Export the whole data tree into a directory.
    Backup {
        /// Destination directory for the backup.
        dest: PathBuf,
    },
    /// Import a previously exported data tree, overwriting live entries.
    Restore {
        /// Directory holding the backup.
        src: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = VaultConfig::load(&cli.config).context("loading configuration")?;
    let hub = DataHub::new(config);

    match cli.command {
        Commands::History { universe } => cmd_history(&hub, &universe),
        Commands::Minute {
            code,
            index,
            date,
            period,
            force,
        } => cmd_minute(&hub, &code, index, date.as_deref(), period, force),
        Commands::Prefetch {
            universe,
            status,
            wait,
        } => cmd_prefetch(&hub, &universe, status, wait),
        Commands::Names { codes, force } => cmd_names(&hub, &codes, force),
        Commands::Cache { command } => match command {
            CacheCommands::Status => cmd_cache_status(&hub),
            CacheCommands::Clear => cmd_cache_clear(&hub),
            CacheCommands::Backup { dest } => {
                let files = hub.backup_to(&dest).context("writing backup")?;
                println!("backed up {files} files to {}", dest.display());
                Ok(())
            }
            CacheCommands::Restore { src } => {
                let files = hub.restore_from(&src).context("restoring backup")?;
                println!("restored {files} files from {}", src.display());
                Ok(())
            }
        },
    }
}

fn cmd_history(hub: &DataHub, universe: &str) -> Result<()> {
    let table = hub.history(universe)?;
    if table.is_empty() {
        println!("universe {universe}: no data");
        return Ok(());
    }
    let first = table.records.first().map(|r| r.date);
    let last = table.last_date();
    println!(
        "universe {universe}: {} rows, {} instruments, {} .. {}",
        table.len(),
        table.codes().len(),
        first.map(|d| d.to_string()).unwrap_or_default(),
        last.map(|d| d.to_string()).unwrap_or_default(),
    );
    if let Some(date) = last {
        println!("top by amount on {date}:");
        for code in table.top_by_amount(date, 10) {
            let row = table
                .records
                .iter()
                .find(|r| r.code == code && r.date == date);
            if let Some(row) = row {
                println!(
                    "  {code}  {name:<10}  close {close:>8.2}  chg {pct:>6.2}%",
                    name = row.name,
                    close = row.close,
                    pct = row.pct_chg,
                );
            }
        }
    }
    Ok(())
}

fn cmd_minute(
    hub: &DataHub,
    code: &str,
    index: bool,
    date: Option<&str>,
    period: Option<u32>,
    force: bool,
) -> Result<()> {
    let instrument = if index {
        Instrument::index(code)
    } else {
        Instrument::stock(code)
    };
    let date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("invalid date {raw:?}, expected YYYY-MM-DD"))?,
        None => chrono::Local::now().date_naive(),
    };
    let period = match period {
        Some(minutes) => match Period::from_minutes(minutes) {
            Some(p) => Some(p),
            None => bail!("unsupported period {minutes}, expected 5, 15, 30 or 60"),
        },
        None => None,
    };

    if force {
        hub.evict_minute(&instrument, date, period)?;
    }
    let fetched = hub.minute_bars(&instrument, date, period)?;
    let series = fetched.value;
    println!(
        "{instrument} {date} p{period}: {bars} bars ({source:?})",
        period = series.period,
        bars = series.len(),
        source = fetched.source,
    );
    if let (Some(first), Some(last)) = (series.bars.first(), series.bars.last()) {
        println!(
            "  {}  open {:.2}  ->  {}  close {:.2} ({:+.2}%)",
            first.timestamp.time(),
            first.open,
            last.timestamp.time(),
            last.close,
            last.pct_chg,
        );
    }
    Ok(())
}

fn cmd_prefetch(hub: &DataHub, universe: &str, status_only: bool, wait: bool) -> Result<()> {
    if !status_only {
        if hub.start_prefetch(universe)? {
            println!("prefetch started for {universe}");
        } else {
            println!("prefetch not started (already running or nothing to do)");
        }
        if wait {
            while hub.prefetch_running() {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
    }
    match hub.prefetch_state() {
        Some(state) => println!(
            "prefetch {date}: {status:?}, success {success}, failed {failed} (updated {updated})",
            date = state.date,
            status = state.status,
            success = state.success,
            failed = state.failed,
            updated = state.updated,
        ),
        None => println!("no prefetch run recorded"),
    }
    Ok(())
}

fn cmd_names(hub: &DataHub, codes: &[String], force: bool) -> Result<()> {
    let map = if codes.is_empty() {
        hub.refresh_names(force)
    } else {
        hub.refresh_names_for(codes, force)
    };
    println!("name map: {} instruments", map.len());
    for code in codes {
        match map.get(code) {
            Some(name) => println!("  {code}  {name}"),
            None => println!("  {code}  (unresolved)"),
        }
    }
    Ok(())
}

fn cmd_cache_status(hub: &DataHub) -> Result<()> {
    let keys = hub.minute_cache_keys();
    println!("minute cache: {} entries", keys.len());
    for key in keys {
        println!("  {key}");
    }
    Ok(())
}

fn cmd_cache_clear(hub: &DataHub) -> Result<()> {
    let before = hub.minute_cache_keys().len();
    hub.clear_minute_cache()?;
    println!("removed {before} minute entries");
    Ok(())
}
