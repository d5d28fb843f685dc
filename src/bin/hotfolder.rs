//! CLI binary for edgequake-hotfolder.
//!
//! `watch` runs a single worker in the foreground, `run` starts the
//! orchestrator for every configured profile, and the remaining subcommands
//! edit the persisted configuration.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_hotfolder::{
    Converter, ImageEncoder, Orchestrator, OutputKind, PageRenderer, PdfiumRenderer,
    ProfileStatus, ProfileStore, ProfileWatcher, Relocator, StandardEncoder, WatchConfig,
    WatcherLauncher, WorkerControl,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Pick the folder profiles live in, then create one
  hotfolder set-network-folder /srv/scans
  hotfolder profile add acme

  # Run every active profile until Ctrl-C
  hotfolder run

  # One worker, no profile configuration
  hotfolder watch --watch-dir ./in --output-dir ./done --kind tiff

LAYOUT:
  <network>/<profile>/JPEG       drop PDFs/images here for colour JPEG pages
  <network>/<profile>/TIFF       drop PDFs/images here for black/white TIFF pages
  <network>/<profile>/COMPLETE   results; collisions go to a conflicts/ subfolder

ENVIRONMENT VARIABLES:
  HOTFOLDER_CONFIG        Configuration file (default: hotfolder.json)
  PDFIUM_LIB_PATH         pdfium library file or directory (default: system library)
  RUST_LOG                Log filter, overrides --verbose/--quiet
"#;

/// Convert PDFs and images dropped into watched folders into page images.
#[derive(Parser, Debug)]
#[command(
    name = "hotfolder",
    version,
    about = "Watch folders and convert arriving PDFs and images into page images",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Persisted profile configuration.
    #[arg(long, global = true, env = "HOTFOLDER_CONFIG", default_value = "hotfolder.json")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true, env = "HOTFOLDER_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, global = true, env = "HOTFOLDER_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one worker: watch a folder and convert arrivals into an output folder.
    Watch {
        /// Folder receiving new files and directories.
        #[arg(long)]
        watch_dir: PathBuf,

        /// Folder receiving converted output and relocated directories.
        #[arg(long)]
        output_dir: PathBuf,

        /// Output kind produced by this worker.
        #[arg(long, value_enum)]
        kind: KindArg,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Run every active profile under the orchestrator until Ctrl-C.
    Run {
        #[command(flatten)]
        tuning: Tuning,
    },

    /// Manage profiles.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Set the maximum number of workers running at once.
    SetCap {
        #[arg(value_parser = clap::value_parser!(u64).range(1..))]
        cap: u64,
    },

    /// Set the folder new profiles are created in.
    SetNetworkFolder { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// Create a profile and its JPEG/TIFF/COMPLETE folders.
    Add { name: String },
    /// Delete a profile and its folders.
    Remove { name: String },
    /// Stop a profile's workers.
    Pause { name: String },
    /// Resume a paused profile.
    Unpause { name: String },
    /// Show every profile.
    List,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Jpeg,
    Tiff,
}

impl From<KindArg> for OutputKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Jpeg => OutputKind::Jpeg,
            KindArg::Tiff => OutputKind::Tiff,
        }
    }
}

/// Conversion and timing flags shared by `watch` and `run`.
#[derive(Args, Debug)]
struct Tuning {
    /// Rendering DPI (36–1200).
    #[arg(long, env = "HOTFOLDER_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(36..=1200))]
    dpi: u32,

    /// JPEG quality (1–100).
    #[arg(long, env = "HOTFOLDER_JPEG_QUALITY", default_value_t = 60,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Luma below this becomes black in TIFF output.
    #[arg(long, env = "HOTFOLDER_THRESHOLD", default_value_t = 128)]
    threshold: u8,

    /// Milliseconds between stability samples.
    #[arg(long, env = "HOTFOLDER_POLL_MS", default_value_t = 1000)]
    poll_ms: u64,

    /// Seconds a file must stay unchanged before conversion.
    #[arg(long, env = "HOTFOLDER_FILE_STABLE_SECS", default_value_t = 5)]
    file_stable_secs: u64,

    /// Seconds a directory must stay unchanged before relocation.
    #[arg(long, env = "HOTFOLDER_DIR_STABLE_SECS", default_value_t = 30)]
    dir_stable_secs: u64,

    /// Pages of one document converted concurrently.
    #[arg(long, env = "HOTFOLDER_PAGE_CONCURRENCY", default_value_t = 4)]
    page_concurrency: usize,

    /// Files of one relocated directory converted concurrently.
    #[arg(long, env = "HOTFOLDER_FILE_CONCURRENCY", default_value_t = 4)]
    file_concurrency: usize,

    /// Let in-flight conversions finish on Ctrl-C instead of aborting them.
    #[arg(long, env = "HOTFOLDER_DRAIN")]
    drain: bool,

    /// Do not convert entries already present when a worker starts.
    #[arg(long, env = "HOTFOLDER_NO_INITIAL_SCAN")]
    no_initial_scan: bool,

    /// pdfium shared library, or the directory containing it.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,
}

impl Tuning {
    fn config(&self) -> Result<WatchConfig> {
        WatchConfig::builder()
            .dpi(self.dpi)
            .jpeg_quality(self.jpeg_quality)
            .bilevel_threshold(self.threshold)
            .poll_interval(Duration::from_millis(self.poll_ms))
            .file_stable_for(Duration::from_secs(self.file_stable_secs))
            .dir_stable_for(Duration::from_secs(self.dir_stable_secs))
            .page_concurrency(self.page_concurrency)
            .file_concurrency(self.file_concurrency)
            .drain_on_shutdown(self.drain)
            .scan_existing_on_start(!self.no_initial_scan)
            .build()
            .context("Invalid tuning flags")
    }

    fn renderer(&self) -> Arc<dyn PageRenderer> {
        match &self.pdfium_lib {
            Some(path) => Arc::new(PdfiumRenderer::with_library(path)),
            None => Arc::new(PdfiumRenderer::new()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Watch {
            watch_dir,
            output_dir,
            kind,
            tuning,
        } => watch(watch_dir, output_dir, kind.into(), &tuning).await,
        Command::Run { tuning } => run(&cli.config, &tuning).await,
        Command::Profile { action } => profile(&cli.config, action),
        Command::SetCap { cap } => {
            let mut store = open_store(&cli.config)?;
            store
                .set_core_cap(Some(cap as usize))
                .context("Failed to save concurrency cap")?;
            println!("{} concurrency cap set to {}", green("✓"), cap);
            Ok(())
        }
        Command::SetNetworkFolder { path } => {
            let mut store = open_store(&cli.config)?;
            store
                .set_network_folder(&path)
                .context("Failed to save network folder")?;
            println!("{} network folder set to {}", green("✓"), path.display());
            Ok(())
        }
    }
}

fn open_store(path: &std::path::Path) -> Result<ProfileStore> {
    ProfileStore::load_or_create(path)
        .with_context(|| format!("Failed to open configuration {}", path.display()))
}

async fn watch(
    watch_dir: PathBuf,
    output_dir: PathBuf,
    kind: OutputKind,
    tuning: &Tuning,
) -> Result<()> {
    let config = tuning.config()?;
    let encoder: Arc<dyn ImageEncoder> = Arc::new(StandardEncoder);
    let relocator = Arc::new(Relocator::new(config.move_retry));
    let drain = config.drain_on_shutdown;
    let converter = Arc::new(Converter::new(kind, config, tuning.renderer(), encoder));
    let watcher = ProfileWatcher::new(watch_dir, output_dir, converter, relocator);

    let control = WorkerControl::new();
    let mut worker = tokio::spawn(watcher.run(control.clone()));

    tokio::select! {
        joined = &mut worker => {
            return joined
                .context("Worker task failed")?
                .context("Watcher stopped with an error");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, stopping");
            if drain {
                control.drain();
            } else {
                control.terminate();
            }
        }
    }

    worker
        .await
        .context("Worker task failed")?
        .context("Watcher stopped with an error")
}

async fn run(config_path: &std::path::Path, tuning: &Tuning) -> Result<()> {
    let config = tuning.config()?;
    let store = open_store(config_path)?;
    if store.profiles().is_empty() {
        bail!(
            "No profiles in {}.\nRun: hotfolder profile add <NAME>",
            config_path.display()
        );
    }

    let launcher = WatcherLauncher::new(config.clone(), tuning.renderer(), Arc::new(StandardEncoder));
    let orchestrator = Orchestrator::start(store, &config, Arc::new(launcher));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");
    orchestrator
        .shutdown()
        .await
        .context("Orchestrator shutdown failed")
}

fn profile(config_path: &std::path::Path, action: ProfileAction) -> Result<()> {
    let mut store = open_store(config_path)?;
    match action {
        ProfileAction::Add { name } => {
            let record = store
                .add_profile(&name)
                .with_context(|| format!("Failed to add profile '{name}'"))?;
            println!("{} added {}", green("✓"), bold(&name));
            println!("  {}", dim(&record.jpeg_dir.display().to_string()));
            println!("  {}", dim(&record.tiff_dir.display().to_string()));
            println!("  {}", dim(&record.complete_dir.display().to_string()));
        }
        ProfileAction::Remove { name } => {
            match store
                .remove_profile(&name)
                .with_context(|| format!("Failed to remove profile '{name}'"))?
            {
                Some(_) => println!("{} removed {}", green("✓"), bold(&name)),
                None => println!("{}", dim(&format!("no profile named '{name}'"))),
            }
        }
        ProfileAction::Pause { name } => set_status(&mut store, &name, ProfileStatus::Paused)?,
        ProfileAction::Unpause { name } => set_status(&mut store, &name, ProfileStatus::Active)?,
        ProfileAction::List => {
            match store.network_folder() {
                Some(folder) => println!("Network folder: {}", folder.display()),
                None => println!("Network folder: {}", yellow("not set")),
            }
            if let Some(cap) = store.core_cap() {
                println!("Concurrency cap: {}", cap);
            }
            if store.profiles().is_empty() {
                println!("{}", dim("no profiles"));
            }
            for (name, record) in store.profiles() {
                let status = match record.status {
                    ProfileStatus::Active => green("active"),
                    ProfileStatus::Paused => yellow("paused"),
                };
                println!("{:<24} {}", bold(name), status);
            }
        }
    }
    Ok(())
}

fn set_status(store: &mut ProfileStore, name: &str, status: ProfileStatus) -> Result<()> {
    let changed = store
        .set_status(name, status)
        .with_context(|| format!("Failed to update profile '{name}'"))?;
    let word = match status {
        ProfileStatus::Active => "active",
        ProfileStatus::Paused => "paused",
    };
    if changed {
        println!("{} {} is now {}", green("✓"), bold(name), word);
    } else {
        println!("{}", dim(&format!("{name} is already {word}")));
    }
    Ok(())
}
