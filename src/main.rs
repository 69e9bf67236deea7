mod config;
mod document;
mod fingerprint;
mod index;
mod models;
mod runner;
mod store;
mod sync;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use config::{Config, StoreKind};
use index::SyncIndex;
use runner::{RunSettings, TargetSource};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use store::ExternalStore;
use store::google::GoogleTasksStore;
use store::local::LocalStore;
use store::reminders::RemindersStore;
use sync::{SyncOptions, TitlePolicy};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Two-way sync between markdown checklists and reminder lists.
#[derive(Parser)]
#[command(name = "todolist-sync", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile documents with their reminder lists.
    Sync(SyncArgs),

    /// Authorize access to Google Tasks.
    Auth,

    /// Print the fingerprint index.
    ShowIndex {
        /// Only show this list.
        #[arg(long)]
        list: Option<String>,

        /// Index file to read instead of the configured one.
        #[arg(long)]
        index: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Markdown file to sync (requires --list).
    #[arg(long, requires = "list", conflicts_with = "dir")]
    file: Option<PathBuf>,

    /// List for --file; without --file, restricts the configured targets.
    #[arg(long)]
    list: Option<String>,

    /// Sync every markdown file of a directory to the list named after it.
    #[arg(long, conflicts_with = "list")]
    dir: Option<PathBuf>,

    /// Print the planned actions without changing anything.
    #[arg(long)]
    dry_run: bool,

    /// Document titles overwrite store titles (default).
    #[arg(long, conflicts_with = "force_pull")]
    force_push: bool,

    /// Store titles overwrite document titles.
    #[arg(long)]
    force_pull: bool,

    /// Append store items missing from the document.
    #[arg(long)]
    import_unmapped: bool,

    /// Consider completed store items when matching and importing.
    #[arg(long)]
    include_completed: bool,

    /// Rebuild missing index entries from exact title matches.
    #[arg(long)]
    reindex: bool,

    /// Skip importing legacy notes markers.
    #[arg(long)]
    no_migrate: bool,

    /// Store backend to use instead of the configured one.
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Index file to use instead of the configured one.
    #[arg(long)]
    index: Option<PathBuf>,

    /// Keep running, syncing again every interval.
    #[arg(long)]
    watch: bool,

    /// Seconds between runs in watch mode.
    #[arg(long, requires = "watch")]
    interval: Option<u64>,

    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    // Logs go to stderr so reports on stdout stay machine readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("todolist_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Sync(args) => sync_command(&config, &args),
        Command::Auth => {
            store::google::authorize(&config.google, &config.google.token_path)?;
            println!("Google Tasks authorized.");
            Ok(())
        }
        Command::ShowIndex { list, index } => {
            show_index(&config, list.as_deref(), index);
            Ok(())
        }
    }
}

fn sync_command(config: &Config, args: &SyncArgs) -> Result<()> {
    let source = match (&args.file, &args.dir) {
        (Some(file), _) => TargetSource::File {
            file: file.clone(),
            list: args.list.clone().unwrap_or_default(),
        },
        (None, Some(dir)) => TargetSource::Dir(dir.clone()),
        (None, None) => TargetSource::Configured {
            list: args.list.clone(),
        },
    };
    let mut targets = runner::resolve_targets(&source, config).context("resolving sync targets")?;
    if targets.is_empty() {
        bail!(
            "nothing to sync: pass --file with --list, --dir, or add [[targets]] to {}",
            config::config_path().display()
        );
    }
    // Flags given on the command line win over per-target settings.
    for target in &mut targets {
        if args.import_unmapped {
            target.import_unmapped = Some(true);
        }
        if args.include_completed {
            target.include_completed = Some(true);
        }
    }

    let settings = RunSettings {
        options: sync_options(config, args),
        index_path: args
            .index
            .clone()
            .unwrap_or_else(|| config.sync.index_path.clone()),
        backup_dir: config.sync.backups.then(|| config.sync.backup_dir.clone()),
    };
    let timeout = Duration::from_secs(config.sync.timeout_seconds.max(1));
    let kind = args.store.unwrap_or(config.store.kind);
    let mut store = open_store(config, kind, timeout)?;
    let interval = Duration::from_secs(args.interval.unwrap_or(config.sync.interval_seconds).max(1));

    loop {
        let report = runner::run(&targets, store.as_mut(), &settings);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", report.render());
        }

        let failures = report.failures();
        if !args.watch {
            if failures > 0 {
                bail!("{failures} sync target(s) failed");
            }
            return Ok(());
        }
        if failures > 0 {
            warn!(failures, "sync run finished with failures");
        }
        info!(seconds = interval.as_secs(), "waiting for next run");
        thread::sleep(interval);
    }
}

fn sync_options(config: &Config, args: &SyncArgs) -> SyncOptions {
    SyncOptions {
        dry_run: args.dry_run,
        title_policy: if args.force_pull && !args.force_push {
            TitlePolicy::Pull
        } else {
            TitlePolicy::Push
        },
        import_unmapped: args.import_unmapped || config.sync.import_unmapped,
        include_completed: args.include_completed || config.sync.include_completed,
        reindex: args.reindex,
        migrate_legacy: config.sync.migrate_legacy && !args.no_migrate,
        title_match_limit: config.sync.title_match_limit,
    }
}

fn open_store(config: &Config, kind: StoreKind, timeout: Duration) -> Result<Box<dyn ExternalStore>> {
    let store: Box<dyn ExternalStore> = match kind {
        StoreKind::Local => {
            let path = &config.store.local_path;
            Box::new(
                LocalStore::open(path)
                    .with_context(|| format!("opening local store {}", path.display()))?,
            )
        }
        StoreKind::Google => Box::new(GoogleTasksStore::new(
            config.google.clone(),
            config.google.token_path.clone(),
            timeout,
        )?),
        StoreKind::Reminders => {
            if !cfg!(target_os = "macos") {
                warn!("Apple Reminders is only reachable through osascript on macOS");
            }
            Box::new(RemindersStore::new(timeout))
        }
    };
    info!(store = ?kind, "store ready");
    Ok(store)
}

fn show_index(config: &Config, list: Option<&str>, path: Option<PathBuf>) {
    let path = path.unwrap_or_else(|| config.sync.index_path.clone());
    let index = SyncIndex::load(&path);
    println!("index: {}", path.display());
    for name in index.list_names() {
        if list.is_some_and(|wanted| wanted != name) {
            continue;
        }
        println!("{name} ({} entries)", index.len(&name));
        for (fingerprint, entry) in index.entries(&name) {
            let hash = entry
                .last_content_hash
                .as_deref()
                .map(short)
                .unwrap_or("-");
            println!("  {}  {}  notes {}", short(&fingerprint), entry.external_id, hash);
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
