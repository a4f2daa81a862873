use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::debug;

use crate::cache::{CacheController, TranslationHash, inventory};
use crate::config::CacheConfig;
use crate::utils::logger;
use crate::version::VERSION;

#[derive(Parser, Debug)]
#[command(
    name = "transcache",
    version = VERSION,
    about = "Inspect and populate the persistent translation cache"
)]
pub struct TranscacheCli {
    #[arg(long, global = true)]
    /// Cache directory (defaults to TRANSCACHE_CACHE_DIR or ~/.cache/transcache).
    cache_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Access mode: readwrite, readonly or writeonly.
    cache_mode: Option<String>,

    #[arg(short, long, global = true)]
    /// Log cache hits and writes.
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copies the object stored under HASH to a file or stdout.
    Get {
        hash: TranslationHash,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Stores FILE under HASH unless an entry already exists.
    Put { hash: TranslationHash, file: PathBuf },
    /// Prints the content hash of each file.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Lists committed entries.
    List {
        #[arg(long)]
        json: bool,
    },
}

impl TranscacheCli {
    pub fn command(&self) -> &Command {
        &self.command
    }

    fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::from_env();
        config.enabled = true;
        config.verbose |= self.verbose;
        if let Some(dir) = &self.cache_dir {
            config.dir = Some(dir.clone());
        }
        if let Some(mode) = &self.cache_mode {
            config.mode.clone_from(mode);
        }
        config
    }

    fn controller(&self) -> Result<CacheController> {
        let controller = CacheController::new(&self.cache_config());
        if !controller.is_enabled() {
            bail!("translation cache is unavailable (see warnings above)");
        }
        debug!(root = %controller.root().display(), "using cache");
        Ok(controller)
    }
}

pub fn run() -> Result<()> {
    let cli = TranscacheCli::parse();
    logger::init_logging(cli.verbose);
    match &cli.command {
        Command::Get { hash, output } => handle_get(&cli, hash, output.as_deref()),
        Command::Put { hash, file } => handle_put(&cli, hash, file),
        Command::Hash { files } => handle_hash(files),
        Command::List { json } => handle_list(&cli, *json),
    }
}

fn handle_get(cli: &TranscacheCli, hash: &TranslationHash, output: Option<&Path>) -> Result<()> {
    let controller = cli.controller()?;
    if !controller.allows_read() {
        bail!("cache mode does not allow reads");
    }
    let Some(object) = controller.get(hash) else {
        bail!("no cache entry for {hash}");
    };
    let bytes = object
        .read_to_vec()
        .with_context(|| format!("failed to read {}", object.path().display()))?;

    match output {
        Some(path) => {
            fs::write(path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "{} {} ({} bytes)",
                "hit".green().bold(),
                path.display(),
                bytes.len()
            );
        }
        None => io::stdout()
            .lock()
            .write_all(&bytes)
            .context("failed to write to stdout")?,
    }
    Ok(())
}

fn handle_put(cli: &TranscacheCli, hash: &TranslationHash, file: &Path) -> Result<()> {
    let controller = cli.controller()?;
    if !controller.allows_write() {
        bail!("cache mode does not allow writes");
    }
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    controller.put(hash, &bytes);

    // put never reports failure; check the outcome by looking for the final name.
    let entry = controller.root().join(hash.to_hex());
    match fs::metadata(&entry) {
        Ok(metadata) if metadata.len() == bytes.len() as u64 => {
            println!("{} {hash}", "stored".green().bold());
        }
        Ok(metadata) => {
            println!(
                "{} {hash} (existing entry is {} bytes)",
                "kept".yellow().bold(),
                metadata.len()
            );
        }
        Err(_) => bail!("entry {hash} was not written"),
    }
    Ok(())
}

fn handle_hash(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        println!("{}  {}", TranslationHash::of(&bytes), file.display());
    }
    Ok(())
}

fn handle_list(cli: &TranscacheCli, json: bool) -> Result<()> {
    let controller = cli.controller()?;
    let inventory = inventory::scan(controller.root())
        .with_context(|| format!("failed to scan {}", controller.root().display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
        return Ok(());
    }

    println!("{} {}", "cache".bold(), controller.root().display());
    for entry in &inventory.entries {
        let modified = entry.modified.map_or_else(
            || "-".to_string(),
            |time| time.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        println!("{}  {:>10}  {modified}", entry.hash, entry.size);
    }
    println!(
        "{} entries, {} bytes",
        inventory.entries.len(),
        inventory.total_bytes()
    );
    if inventory.in_flight > 0 {
        println!(
            "{}",
            format!("{} in-flight or orphaned temp files", inventory.in_flight).yellow()
        );
    }
    Ok(())
}
