use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use unicode_width::UnicodeWidthStr;

use rivulet::config::{Backend, Config, Paths};
use rivulet::feed::{self, opml, FeedOutcome, FeedStatus, Fetcher};
use rivulet::storage::{self, Entry, EntryFilter, Feed, Store, StoreError};
use rivulet::util::truncate_to_width;

const TITLE_WIDTH: usize = 48;
const ID_WIDTH: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "rivulet", version, about = "Command-line RSS/Atom aggregator")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/rivulet/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed, or to the feed advertised by a web page
    Add {
        url: String,
        /// Folder to file the feed under
        #[arg(long)]
        folder: Option<String>,
        /// Title to use instead of the feed's own
        #[arg(long)]
        title: Option<String>,
    },
    /// Fetch new entries for one feed or all feeds
    Fetch {
        /// Feed id, id prefix or URL (default: every feed)
        feed: Option<String>,
        /// Ignore cached validators and download every feed in full
        #[arg(long)]
        force: bool,
    },
    /// List subscribed feeds
    Feeds,
    /// List entries, newest first
    Entries {
        /// Only entries of this feed (id, prefix or URL)
        #[arg(long)]
        feed: Option<String>,
        /// Only unread entries
        #[arg(long)]
        unread: bool,
        /// Published at or after this date
        #[arg(long, value_parser = parse_cli_date)]
        since: Option<DateTime<Utc>>,
        /// Published before this date
        #[arg(long, value_parser = parse_cli_date)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Mark an entry as read
    Read { id: String },
    /// Mark an entry as unread
    Unread { id: String },
    /// Mark every entry published before a date as read
    ReadBefore {
        #[arg(value_parser = parse_cli_date)]
        date: DateTime<Utc>,
    },
    /// Unsubscribe and delete a feed's entries
    Rm { feed: String },
    /// Search entry titles and content
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show entry counts
    Stats,
    /// Reclaim storage space
    Compact,
    /// Copy every feed and entry into a new store
    Migrate {
        /// Backend of the new store
        #[arg(long)]
        to: Backend,
        /// Data directory of the new store
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,
    },
    /// Subscribe to every feed in an OPML file
    Import { file: PathBuf },
    /// Write subscriptions as OPML (default: stdout)
    Export { file: Option<PathBuf> },
}

fn parse_cli_date(s: &str) -> Result<DateTime<Utc>, String> {
    feed::parse_date(s).ok_or_else(|| format!("unrecognized date {s:?} (try YYYY-MM-DD)"))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Dropping `run` on Ctrl-C cancels the in-flight request and releases
    // the store (and its file lock) on the way out.
    tokio::select! {
        result = run(args) => match result {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let paths = Paths::from_env()?;
    let file = path.unwrap_or(&paths.config_file);
    Config::load(file, &paths).with_context(|| format!("loading {}", file.display()))
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let store = storage::open(&config)
        .await
        .with_context(|| format!("opening {} store in {}", config.backend, config.data_dir.display()))?;
    let store = store.as_ref();

    match args.command {
        Command::Add { url, folder, title } => {
            let fetcher = Fetcher::new()?;
            let feed = feed::subscribe(store, &fetcher, &url, folder.as_deref(), title.as_deref())
                .await
                .map_err(|e| match e {
                    feed::SubscribeError::Store(StoreError::DuplicateUrl) => {
                        anyhow::anyhow!("already subscribed to {url}")
                    }
                    other => other.into(),
                })?;
            println!("Subscribed to {} ({})", feed.display_title(), feed.url);
            println!("  id: {}", short_id(&feed.id));
        }
        Command::Fetch { feed, force } => {
            let fetcher = Fetcher::new()?;
            return fetch(store, &fetcher, feed.as_deref(), force).await;
        }
        Command::Feeds => list_feeds(store).await?,
        Command::Entries {
            feed,
            unread,
            since,
            until,
            limit,
            offset,
            json,
        } => {
            let mut filter = EntryFilter {
                unread_only: unread,
                since,
                until,
                limit,
                offset,
                ..EntryFilter::default()
            };
            if let Some(key) = feed {
                filter.feed_id = Some(find_feed(store, &key).await?.id);
            }
            let entries = store.list_entries(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries(&entries);
            }
        }
        Command::Read { id } => {
            let entry = find_entry(store, &id).await?;
            store.mark_read(&entry.id).await?;
            println!("Marked read: {}", entry_title(&entry));
        }
        Command::Unread { id } => {
            let entry = find_entry(store, &id).await?;
            store.mark_unread(&entry.id).await?;
            println!("Marked unread: {}", entry_title(&entry));
        }
        Command::ReadBefore { date } => {
            let changed = store.mark_read_before(date).await?;
            println!("Marked {changed} entries as read");
        }
        Command::Rm { feed } => {
            let feed = find_feed(store, &feed).await?;
            store.delete_feed(&feed.id).await?;
            println!("Removed {}", feed.display_title());
        }
        Command::Search { query, limit } => {
            let entries = store.search(&query, limit).await?;
            print_entries(&entries);
        }
        Command::Stats => print_stats(store).await?,
        Command::Compact => {
            store.compact().await?;
            println!("Compacted {} store", config.backend);
        }
        Command::Migrate { to, dest } => migrate(store, &config, to, &dest).await?,
        Command::Import { file } => {
            let report = opml::import(store, &file)
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            println!(
                "Imported {} feeds ({} already subscribed)",
                report.added, report.skipped
            );
        }
        Command::Export { file } => {
            let document = opml::export(store).await?;
            match file {
                Some(path) => {
                    opml::export_to_file(&document, &path)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported subscriptions to {}", path.display());
                }
                None => {
                    std::io::stdout().write_all(document.as_bytes())?;
                    println!();
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Commands
// ============================================================================

/// Refreshes one or all feeds, printing a status line per feed. Any failed
/// feed makes the exit code non-zero.
async fn fetch(
    store: &dyn Store,
    fetcher: &Fetcher,
    key: Option<&str>,
    force: bool,
) -> Result<ExitCode> {
    let failed = match key {
        Some(key) => {
            let target = find_feed(store, key).await?;
            let outcome = FeedOutcome {
                feed_id: target.id.clone(),
                title: target.display_title().to_owned(),
                result: feed::refresh_one(store, fetcher, &target, force).await,
            };
            print_outcome(&outcome);
            outcome.result.is_err()
        }
        None => {
            let summary = feed::refresh_all(store, fetcher, force, print_outcome).await?;
            println!(
                "{} feeds: {} new entries, {} cached, {} errors",
                summary.total, summary.new_entries, summary.cached, summary.errors
            );
            summary.errors > 0
        }
    };

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_outcome(outcome: &FeedOutcome) {
    let status = match &outcome.result {
        Ok(FeedStatus::Updated(n)) => format!("✓ {n} new"),
        Ok(FeedStatus::Cached) => "- cached".to_owned(),
        Err(e) => format!("✗ {e}"),
    };
    println!("{}  {status}", column(&outcome.title, TITLE_WIDTH));
}

async fn list_feeds(store: &dyn Store) -> Result<()> {
    let feeds = store.list_feeds().await?;
    if feeds.is_empty() {
        println!("No feeds. Add one with `rivulet add <url>`.");
        return Ok(());
    }

    for feed in &feeds {
        let stats = store.feed_stats(&feed.id).await?;
        let folder = feed
            .folder
            .as_deref()
            .map(|f| format!("  [{f}]"))
            .unwrap_or_default();
        let error = if feed.last_error.is_some() {
            format!("  ✗ {} errors", feed.error_count)
        } else {
            String::new()
        };
        println!(
            "{}  {}  {:>4}/{:<4}{folder}{error}",
            short_id(&feed.id),
            column(feed.display_title(), TITLE_WIDTH),
            stats.unread,
            stats.total,
        );
    }
    Ok(())
}

fn print_entries(entries: &[Entry]) {
    for entry in entries {
        let marker = if entry.read { ' ' } else { '*' };
        let date = entry
            .published_at
            .map(|d| d.with_timezone(&Local).format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "----------".to_owned());
        println!(
            "{} {marker} {date}  {}",
            short_id(&entry.id),
            truncate_to_width(entry_title(entry), TITLE_WIDTH + 24)
        );
    }
}

async fn print_stats(store: &dyn Store) -> Result<()> {
    let overall = store.overall_stats().await?;
    println!(
        "{} feeds, {} entries, {} unread",
        overall.feeds, overall.entries, overall.unread
    );
    for feed in store.list_feeds().await? {
        let stats = store.feed_stats(&feed.id).await?;
        println!(
            "  {}  {:>5} entries  {:>5} unread",
            column(feed.display_title(), TITLE_WIDTH),
            stats.total,
            stats.unread
        );
    }
    Ok(())
}

async fn migrate(src: &dyn Store, config: &Config, to: Backend, dest: &Path) -> Result<()> {
    if to == config.backend && same_dir(dest, &config.data_dir) {
        bail!("destination is the current store");
    }

    let dst = storage::open_backend(to, dest)
        .await
        .with_context(|| format!("opening {to} store in {}", dest.display()))?;
    if dst.overall_stats().await?.feeds > 0 {
        bail!("destination {} already contains feeds", dest.display());
    }

    let report = storage::migrate_data(src, dst.as_ref()).await?;
    println!(
        "Migrated {} feeds and {} entries to {to} store in {}",
        report.feeds,
        report.entries,
        dest.display()
    );
    println!(
        "Set `backend = \"{to}\"` and `data_dir = \"{}\"` in the config file to use it.",
        dest.display()
    );
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Looks a feed up by id, id prefix or URL.
async fn find_feed(store: &dyn Store, key: &str) -> Result<Feed> {
    match store.get_feed_by_prefix(key).await {
        Ok(feed) => Ok(feed),
        Err(StoreError::NotFound | StoreError::PrefixTooShort) if key.contains("://") => store
            .get_feed_by_url(key)
            .await
            .with_context(|| format!("no feed with URL {key}")),
        Err(e) => Err(e).with_context(|| format!("no feed matching {key:?}")),
    }
}

async fn find_entry(store: &dyn Store, key: &str) -> Result<Entry> {
    store
        .get_entry_by_prefix(key)
        .await
        .with_context(|| format!("no entry matching {key:?}"))
}

fn short_id(id: &str) -> &str {
    id.get(..ID_WIDTH).unwrap_or(id)
}

fn entry_title(entry: &Entry) -> &str {
    entry
        .title
        .as_deref()
        .or(entry.link.as_deref())
        .unwrap_or(&entry.guid)
}

/// Truncates to `width` display columns and pads to exactly that width.
fn column(s: &str, width: usize) -> String {
    let truncated = truncate_to_width(s, width);
    let pad = width.saturating_sub(truncated.width());
    format!("{truncated}{}", " ".repeat(pad))
}
