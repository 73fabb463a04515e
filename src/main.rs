use clap::{Parser, Subcommand};
use stash_shelf::config::{self, SiteConfig};
use stash_shelf::output::{self, LineReporter};
use stash_shelf::registry::{self, RegistryError};
use stash_shelf::render::HandlerSet;
use stash_shelf::shelf::{Shelf, ShelfDump, StoreError};
use stash_shelf::shelve::{self, ShelveError, ShelveOptions};
use stash_shelf::staleness::WatermarkStore;
use stash_shelf::types::Manifest;
use std::path::{Path, PathBuf};

/// Environment variable holding the `env_logger` filter.
const LOG_ENV: &str = "STASH_SHELF_LOG";

/// Default file written by `get`.
const DUMP_FILENAME: &str = "shelf-dump.json";

#[derive(Parser)]
#[command(name = "stash-shelf")]
#[command(about = "Render stash sites ahead of time onto a persistent shelf")]
#[command(long_about = "\
Render stash sites ahead of time onto a persistent shelf

A site is a directory (or a single .toml module) whose modules declare URL
rules, handlers and exports. Shelving renders every route instance and stores
the output on the shelf; later runs only re-render modules whose source
changed since the last successful run.

Site structure:

  testsite/
  ├── site.toml                  # Site config (optional)
  ├── stash/
  │   ├── mod.toml               # Module `stash`
  │   ├── index.toml             # Module `stash.index`
  │   └── multiple.toml          # Module `stash.multiple`
  └── templates/                 # Templates for `template:<name>` exports
  simplest.toml                  # Single-module site `simplest`

Logging: set STASH_SHELF_LOG=debug to trace run states and store commits.

Run 'stash-shelf gen-config' to generate a documented site.toml.")]
#[command(version = env!("STASH_SHELF_VERSION"))]
struct Cli {
    /// Directory searched for sites
    #[arg(long, default_value = ".", global = true)]
    path: PathBuf,

    /// Shelf file, overriding [shelf] path from site.toml
    #[arg(long, global = true)]
    shelf: Option<PathBuf>,

    /// Watermark directory, overriding [watermark] dir from site.toml
    #[arg(long, global = true)]
    watermarks: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// A shelf namespace, optionally narrowed to one path.
#[derive(clap::Args, Clone)]
struct Target {
    /// Shelf namespace
    site: String,

    /// URL path of a single entry
    rule: Option<String>,

    /// Site to read site.toml from, if it differs from the namespace
    #[arg(short, long)]
    module: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Shelve a site's stash: render changed modules onto the shelf
    Shelve {
        site: String,
        /// Re-render every module, ignoring the watermark
        #[arg(long)]
        full: bool,
    },
    /// Display the contents of the shelf
    Show {
        #[command(flatten)]
        target: Target,
        /// Show each entry's exports
        #[arg(short = 'c', long = "context")]
        context: bool,
    },
    /// Dump shelf entries to a file
    Get {
        #[command(flatten)]
        target: Target,
        /// File to write
        #[arg(short, long, default_value = DUMP_FILENAME)]
        output: PathBuf,
    },
    /// Load a dump file onto the shelf
    Put { file: PathBuf },
    /// Drop a site, or one of its paths, from the shelf
    Drop {
        #[command(flatten)]
        target: Target,
    },
    /// Create an empty shelf
    Create {
        /// Replace an existing shelf
        #[arg(long)]
        force: bool,
    },
    /// Print a stock site.toml with all options documented
    GenConfig,
    /// Display the version
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, "warn")).init();
    let cli = Cli::parse();

    match &cli.command {
        Command::Shelve { site, full } => {
            let manifest = resolve_or_exit(&cli.path, site)?;
            let shelf = Shelf::open_or_create(shelf_path(&cli, &manifest.config))?;
            let watermarks = WatermarkStore::new(watermark_dir(&cli, &manifest.config));
            let handlers = HandlerSet::for_manifest(&manifest);
            let mut reporter = LineReporter::stdout();
            let outcome = shelve::shelve_site(
                &manifest,
                &handlers,
                &shelf,
                &watermarks,
                &mut reporter,
                ShelveOptions { force_full: *full },
            )
            .map_err(|e| match e {
                ShelveError::Registry(e) => exit_on_missing_site(e),
                e => Box::new(e) as Box<dyn std::error::Error>,
            })?;
            print_lines(output::format_shelve_summary(&outcome));
        }
        Command::Show { target, context } => {
            let shelf = Shelf::open(shelf_path(&cli, &target_config(&cli, target)?))?;
            let paths = selected_paths(&shelf, target)?;
            let entries = paths
                .into_iter()
                .map(|path| -> Result<_, StoreError> {
                    let entry = if *context { shelf.get(&target.site, &path)? } else { None };
                    Ok((path, entry))
                })
                .collect::<Result<Vec<_>, _>>()?;
            print_lines(output::format_show(&target.site, &entries, *context));
        }
        Command::Get { target, output } => {
            let shelf = Shelf::open(shelf_path(&cli, &target_config(&cli, target)?))?;
            let dump = shelf.export(&target.site, target.rule.as_deref())?;
            std::fs::write(output, serde_json::to_string_pretty(&dump)?)?;
            println!("{} created.", output.display());
        }
        Command::Put { file } => {
            let dump: ShelfDump = serde_json::from_str(&std::fs::read_to_string(file)?)?;
            let config = site_config(&cli.path, &dump.site)?;
            let shelf = Shelf::open_or_create(shelf_path(&cli, &config))?;
            let count = shelf.import(&dump, file)?;
            print_lines(output::format_imported(&dump.site, count));
        }
        Command::Drop { target } => {
            let shelf = Shelf::open(shelf_path(&cli, &target_config(&cli, target)?))?;
            let removed = shelf.drop(&target.site, target.rule.as_deref())?;
            print_lines(output::format_dropped(
                &target.site,
                target.rule.as_deref(),
                removed,
            ));
        }
        Command::Create { force } => {
            let shelf = Shelf::create(shelf_path(&cli, &SiteConfig::default()), *force)?;
            println!("created empty shelf at {}", shelf.path().display());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        Command::Version => {
            println!("{}", env!("STASH_SHELF_VERSION"));
        }
    }

    Ok(())
}

/// Resolve a site, exiting with `EX_NOINPUT` when it cannot be found.
fn resolve_or_exit(search: &Path, site: &str) -> Result<Manifest, Box<dyn std::error::Error>> {
    registry::resolve_site(&[search.to_path_buf()], site).map_err(exit_on_missing_site)
}

fn exit_on_missing_site(err: RegistryError) -> Box<dyn std::error::Error> {
    if let RegistryError::SiteNotFound(_) = err {
        println!("{}", err);
        std::process::exit(err.exit_code());
    }
    Box::new(err)
}

/// Config of the site named by `-m`, or by the namespace itself. A namespace
/// with no matching site on disk uses the stock config.
fn target_config(cli: &Cli, target: &Target) -> Result<SiteConfig, Box<dyn std::error::Error>> {
    match &target.module {
        Some(module) => Ok(resolve_or_exit(&cli.path, module)?.config),
        None => site_config(&cli.path, &target.site),
    }
}

fn site_config(search: &Path, site: &str) -> Result<SiteConfig, Box<dyn std::error::Error>> {
    if registry::site_exists(&[search.to_path_buf()], site) {
        Ok(resolve_or_exit(search, site)?.config)
    } else {
        Ok(SiteConfig::default())
    }
}

fn shelf_path(cli: &Cli, config: &SiteConfig) -> PathBuf {
    cli.shelf
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.shelf.path))
}

fn watermark_dir(cli: &Cli, config: &SiteConfig) -> PathBuf {
    cli.watermarks
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.watermark.dir))
}

/// Paths listed by `show`: all of the namespace, or just the requested one.
fn selected_paths(shelf: &Shelf, target: &Target) -> Result<Vec<String>, StoreError> {
    let paths = shelf.list(&target.site)?;
    Ok(match &target.rule {
        Some(rule) => paths.into_iter().filter(|p| p == rule).collect(),
        None => paths,
    })
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}
