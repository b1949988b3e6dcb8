//! addonkeeper - command-line entry point.
//!
//! Usage: akeep [OPTIONS] <COMMAND>
//!
//! Commands:
//!   scan                               Match installed folders to the catalog
//!   status                             Scan and show which add-ons need updates
//!   install <id> [--reinstall] [--yes] Install or update one add-on
//!   delete <folder> [--keep <id>]...   Remove an add-on, keeping listed children
//!   resolve <folder> <id>              Settle a folder claimed by several add-ons
//!   update-all                         Update every stale add-on
//!
//! Options:
//!   --root <path>       Add-on installation root (overrides addon_root)
//!   --catalog <path>    Catalog JSON file (overrides catalog)
//!   --version, -v       Show version

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use addonkeeper::addons::{
    fetch_all, AddonEngine, AddonId, BackgroundEngine, CatalogIndex, EngineEvent, GitHubClient,
    HttpDownloader, InstallOptions, JsonCatalog, LocalFs,
};
use addonkeeper::config::Config;
use addonkeeper::logging;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for the worker between events before giving up.
const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Parsed command.
#[derive(Debug)]
enum Command {
    Scan,
    Status,
    Install {
        id: AddonId,
        reinstall: bool,
        yes: bool,
    },
    Delete {
        folder: String,
        keep: BTreeSet<AddonId>,
    },
    Resolve {
        folder: String,
        id: AddonId,
    },
    UpdateAll,
}

/// Parsed command line.
#[derive(Debug)]
struct Cli {
    root: Option<PathBuf>,
    catalog: Option<PathBuf>,
    command: Command,
}

fn parse_id(value: Option<&String>, what: &str) -> Result<AddonId, String> {
    let value = value.ok_or_else(|| format!("missing {}", what))?;
    value
        .parse()
        .map_err(|_| format!("invalid {} '{}'", what, value))
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut root = None;
    let mut catalog = None;
    let mut positional = Vec::new();
    let mut flags = Vec::new();
    let mut keep = BTreeSet::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--root" => root = Some(PathBuf::from(iter.next().ok_or("--root needs a path")?)),
            "--catalog" => {
                catalog = Some(PathBuf::from(iter.next().ok_or("--catalog needs a path")?));
            }
            "--keep" => {
                keep.insert(parse_id(iter.next(), "--keep id")?);
            }
            a if a.starts_with("--") => flags.push(a.to_string()),
            _ => positional.push(arg.clone()),
        }
    }

    let has = |flag: &str| flags.iter().any(|f| f == flag);
    let command = match positional.first().map(String::as_str) {
        Some("scan") => Command::Scan,
        Some("status") => Command::Status,
        Some("install") => Command::Install {
            id: parse_id(positional.get(1), "add-on id")?,
            reinstall: has("--reinstall"),
            yes: has("--yes"),
        },
        Some("delete") => Command::Delete {
            folder: positional.get(1).cloned().ok_or("missing folder")?,
            keep,
        },
        Some("resolve") => Command::Resolve {
            folder: positional.get(1).cloned().ok_or("missing folder")?,
            id: parse_id(positional.get(2), "add-on id")?,
        },
        Some("update-all") => Command::UpdateAll,
        Some(other) => return Err(format!("unknown command '{}'", other)),
        None => return Err("no command given".to_string()),
    };

    Ok(Cli {
        root,
        catalog,
        command,
    })
}

fn print_usage() {
    eprintln!("usage: akeep [--root <path>] [--catalog <path>] <scan|status|install|delete|resolve|update-all> ...");
}

/// Prints events until the worker reports it is idle.
fn drain(worker: &BackgroundEngine, show_status: bool) -> bool {
    let mut ok = true;

    while let Some(event) = worker.wait_event(EVENT_TIMEOUT) {
        match event {
            EngineEvent::Idle => return ok,
            EngineEvent::ScanFinished { addons, conflicts } => {
                if show_status {
                    for a in &addons {
                        let mark = if a.freshness.needs_update() { "update" } else { "ok" };
                        println!(
                            "{:<32} {:>8} {:>10} -> {:<10} {}",
                            a.folder, a.id, a.local_version, a.catalog_version, mark
                        );
                    }
                }
                println!("{} installed, {} conflict(s)", addons.len(), conflicts.len());
                for c in &conflicts {
                    println!("  conflict: '{}' claimed by {:?}", c.folder, c.candidates);
                }
            }
            EngineEvent::StateChanged { addon_id, phase } => {
                println!("[{}] {}", addon_id, phase);
            }
            EngineEvent::DownloadProgress { addon_id, percent } => {
                if percent % 25 == 0 || percent == 100 {
                    println!("[{}] {}%", addon_id, percent);
                }
            }
            EngineEvent::ConfirmationRequired {
                addon_id,
                dependents,
            } => {
                println!(
                    "[{}] would replace bundled add-ons {:?}; rerun with --yes to continue",
                    addon_id, dependents
                );
            }
            EngineEvent::FolderDeleteFailed { folder, reason } => {
                eprintln!("warning: could not delete '{}': {}", folder, reason);
            }
            EngineEvent::Notification(message) => println!("{}", message),
            EngineEvent::BatchFinished(summary) => {
                println!(
                    "update-all: {} updated, {} failed",
                    summary.updated.len(),
                    summary.failed.len()
                );
                for (id, reason) in &summary.failed {
                    println!("  {}: {}", id, reason);
                }
            }
            EngineEvent::Error(message) => {
                eprintln!("error: {}", message);
                ok = false;
            }
        }
    }

    eprintln!("error: engine stopped responding");
    false
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("addonkeeper v{}", VERSION);
        return Ok(());
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {}", e);
            print_usage();
            std::process::exit(2);
        }
    };

    let config = Config::load()?;
    if let Err(e) = logging::init(&config.log_config) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let root = cli
        .root
        .or_else(|| config.addon_root.clone())
        .ok_or("no add-on root; pass --root or set addon_root in ~/.akeeprc")?;
    let catalog_path = cli
        .catalog
        .or_else(|| config.catalog_path.clone())
        .ok_or("no catalog; pass --catalog or set catalog in ~/.akeeprc")?;

    let entries = fetch_all(&JsonCatalog::new(catalog_path))?;
    let engine = AddonEngine::new(
        Arc::new(LocalFs::new(root)?),
        CatalogIndex::new(entries),
        Arc::new(HttpDownloader::new()),
    )
    .with_source_control(Arc::new(GitHubClient::new(config.github_token.clone())))
    .with_settings(config.engine_settings());

    let worker = BackgroundEngine::spawn(engine);
    worker.request_scan();
    let show_status = matches!(cli.command, Command::Status);
    let mut ok = drain(&worker, show_status);

    match cli.command {
        Command::Scan | Command::Status => {}
        Command::Install { id, reinstall, yes } => {
            worker.request_install(
                id,
                InstallOptions {
                    reinstall,
                    skip_bundle_check: yes,
                    batch: false,
                },
            );
            ok &= drain(&worker, false);
        }
        Command::Delete { folder, keep } => {
            worker.request_delete(&folder, keep);
            ok &= drain(&worker, false);
        }
        Command::Resolve { folder, id } => {
            worker.request_resolve_conflict(&folder, id);
            ok &= drain(&worker, false);
        }
        Command::UpdateAll => {
            worker.request_update_all();
            ok &= drain(&worker, false);
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
