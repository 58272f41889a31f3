//! # frz
//!
//! Command-line front end for the frz repository engine: freeze files into
//! content-addressed storage (`add`), restore missing content (`fill`), and
//! verify and rebuild damaged repositories (`repair`).

pub mod config;
mod progress;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use console::style;

use frz_hash::{
    blake3_factory, hash_source, sha256_factory, sha512_256_factory, HasherFactory, BLAKE3_NAME,
    SHA256_NAME, SHA512_256_NAME,
};
use frz_repo::{AddEvent, Frz256, GitClient, LocatorConfig};
use frz_store::{lexical_normal, relative_from, DiskHashIndex, HashIndex, MemHashIndex};
use frz_stream::{
    FileSource, MultiThreadedStreamer, MultiThreadedStreamerOptions, SingleThreadedStreamer,
    Streamer,
};

use config::Config;
use progress::CliProgress;

/// Store files as symlinks to content-addressed storage files.
#[derive(Parser)]
#[command(name = "frz", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add the given files or directories
    Add {
        /// Input file or directory
        #[arg(value_name = "PATH", required = true)]
        files: Vec<PathBuf>,
    },
    /// Look for missing content, and fill it in if possible
    Fill {
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Look for damage, and fix it if possible
    Repair {
        /// Don't re-hash all content
        #[arg(long)]
        fast: bool,
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Hash files and print their base-32 content IDs
    HashFiles(HashFilesArgs),
    /// Build an index directory for an existing content directory
    CreateIndex(CreateIndexArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// If content is found to be missing, search this directory for
    /// matching files to copy
    #[arg(long = "copy-from", value_name = "DIR")]
    copy_from: Vec<PathBuf>,

    /// If content is found to be missing, search this directory for
    /// matching files to move into .frz/content (or copy, if moving isn't
    /// possible)
    #[arg(long = "move-from", value_name = "DIR")]
    move_from: Vec<PathBuf>,
}

#[derive(Args)]
struct HashFilesArgs {
    /// Input file
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Hash algorithm
    #[arg(short, long, default_value = BLAKE3_NAME)]
    algorithm: String,

    /// Stream on the calling thread only
    #[arg(long)]
    single_threaded: bool,

    /// Record results as symlinks in this index directory
    #[arg(short, long, value_name = "DIR")]
    index_dir: Option<PathBuf>,
}

#[derive(Args)]
struct CreateIndexArgs {
    /// Content directory to index
    #[arg(short, long, value_name = "DIR")]
    content_dir: PathBuf,

    /// Index directory to create entries in
    #[arg(short, long, value_name = "DIR")]
    index_dir: PathBuf,

    /// Hash algorithm
    #[arg(short, long, default_value = BLAKE3_NAME)]
    algorithm: String,
}

/// Parse `args` and run the selected command against `working_dir`.
/// Returns the process exit code.
pub fn run<I, T>(working_dir: &Path, args: I) -> Result<i32>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = Cli::command().get_matches_from(args);
    let cli = Cli::from_arg_matches(&matches).context("parsing arguments")?;
    let config = Config::load(working_dir);
    match cli.command {
        Command::Add { files } => cmd_add(working_dir, &config, &files),
        Command::Fill { sources } => {
            let sub = subcommand_matches(&matches)?;
            cmd_fill(working_dir, &config, content_sources(&sources, sub, working_dir))
        }
        Command::Repair { fast, sources } => {
            let sub = subcommand_matches(&matches)?;
            cmd_repair(working_dir, &config, !fast, content_sources(&sources, sub, working_dir))
        }
        Command::HashFiles(args) => cmd_hash_files(working_dir, &args),
        Command::CreateIndex(args) => cmd_create_index(working_dir, &args),
    }
}

fn subcommand_matches(matches: &ArgMatches) -> Result<&ArgMatches> {
    matches
        .subcommand()
        .map(|(_, sub)| sub)
        .context("a subcommand is required")
}

/// Merge `--copy-from` and `--move-from` into one list, preserving the
/// order they were given on the command line: that order is the locator
/// priority.
fn content_sources(
    sources: &SourceArgs,
    matches: &ArgMatches,
    working_dir: &Path,
) -> Vec<LocatorConfig> {
    let mut ordered: Vec<(usize, LocatorConfig)> = Vec::new();
    for (id, values, read_only) in [
        ("copy_from", &sources.copy_from, true),
        ("move_from", &sources.move_from, false),
    ] {
        let Some(indices) = matches.indices_of(id) else {
            continue;
        };
        for (index, value) in indices.zip(values.iter()) {
            ordered.push((index, LocatorConfig { path: working_dir.join(value), read_only }));
        }
    }
    ordered.sort_by_key(|(index, _)| *index);
    ordered.into_iter().map(|(_, source)| source).collect()
}

fn hasher_for(family: &str) -> Result<(HasherFactory<32>, &'static str)> {
    match family {
        BLAKE3_NAME => Ok((blake3_factory(), BLAKE3_NAME)),
        SHA256_NAME => Ok((sha256_factory(), SHA256_NAME)),
        SHA512_256_NAME => Ok((sha512_256_factory(), SHA512_256_NAME)),
        other => bail!(
            "unknown hash family {other:?} (expected blake3, sha256, or sha512_256)"
        ),
    }
}

fn build_engine(config: &Config) -> Result<Frz256> {
    let streaming = &config.streaming;
    let streamer: Arc<dyn Streamer> = if streaming.single_threaded {
        Arc::new(SingleThreadedStreamer::new(streaming.bytes_per_buffer))
    } else {
        Arc::new(MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: streaming.num_buffers,
            bytes_per_buffer: streaming.bytes_per_buffer,
        }))
    };
    let (make_hasher, hash_name) = hasher_for(&config.hash.family)?;
    Ok(Frz256::new(streamer, make_hasher, hash_name))
}

fn pretty(working_dir: &Path, path: &Path) -> String {
    relative_from(&lexical_normal(path), &lexical_normal(working_dir))
        .display()
        .to_string()
}

fn cmd_add(working_dir: &Path, config: &Config, files: &[PathBuf]) -> Result<i32> {
    let mut frz = build_engine(config)?;
    let mut git = GitClient::new();
    let summary = frz.add_all(working_dir, files, &mut git, &mut |event| match event {
        AddEvent::Added(path) => println!("+ {}", pretty(working_dir, path)),
        AddEvent::Deduplicated(path) => println!("= {}", pretty(working_dir, path)),
        AddEvent::Failed(path, e) => {
            println!("{} {}\n *- {}", style("***").red(), pretty(working_dir, path), e)
        }
    });
    println!(
        "\n{} files successfully added\n\
         {} files successfully added and deduplicated\n\
         {} directory entries skipped because they weren't regular files\n\
         {} files skipped because of errors",
        summary.successful, summary.duplicates, summary.non_files, summary.errors
    );
    Ok(if summary.errors == 0 { 0 } else { 1 })
}

fn cmd_fill(
    working_dir: &Path,
    config: &Config,
    content_sources: Vec<LocatorConfig>,
) -> Result<i32> {
    let mut frz = build_engine(config)?;
    let progress = CliProgress::new();
    let result = frz.fill(working_dir, content_sources, &progress)?;
    println!(
        "Content files\n  {} missing (restored)\n  {} missing (not restored)",
        result.num_fetched, result.num_still_missing
    );
    Ok(if result.num_still_missing == 0 { 0 } else { 1 })
}

fn cmd_repair(
    working_dir: &Path,
    config: &Config,
    verify_all_hashes: bool,
    content_sources: Vec<LocatorConfig>,
) -> Result<i32> {
    let mut frz = build_engine(config)?;
    let progress = CliProgress::new();
    let result = frz.repair(working_dir, verify_all_hashes, content_sources, &progress)?;
    println!(
        "Index symlinks\n  {} OK\n  {} bad (removed)\n  {} missing (recreated)\n\
         Content files\n  {} duplicates (moved aside)\n  {} missing (restored)\n  \
         {} missing (not restored)",
        result.num_good_index_symlinks,
        result.num_bad_index_symlinks,
        result.num_missing_index_symlinks,
        result.num_duplicate_content_files,
        result.num_fetched,
        result.num_still_missing
    );
    Ok(if result.num_still_missing == 0 { 0 } else { 1 })
}

fn cmd_hash_files(working_dir: &Path, args: &HashFilesArgs) -> Result<i32> {
    let (make_hasher, name) = hasher_for(&args.algorithm)?;
    let streamer: Box<dyn Streamer> = if args.single_threaded {
        Box::new(SingleThreadedStreamer::new(1 << 20))
    } else {
        Box::new(MultiThreadedStreamer::new(MultiThreadedStreamerOptions::default()))
    };
    let mut index: Box<dyn HashIndex<32>> = match &args.index_dir {
        Some(dir) => Box::new(DiskHashIndex::new(working_dir.join(dir))),
        None => Box::new(MemHashIndex::new()),
    };

    println!(
        "Hashing with {name}, {}",
        if args.single_threaded { "single-threaded" } else { "multi-threaded" }
    );
    let start = Instant::now();
    let mut total_bytes = 0u64;
    for file in &args.files {
        let path = working_dir.join(file);
        let hashed = FileSource::open(&path)
            .and_then(|mut source| hash_source(&*streamer, &make_hasher, &mut source));
        match hashed {
            Ok(id) => {
                let inserted = index.insert(&id, &path)?;
                println!("{} {}  {}", if inserted { "+" } else { "=" }, id.to_base32(), file.display());
                total_bytes += id.size();
            }
            Err(e) => println!("{} {}: {}", style("***").red(), file.display(), e),
        }
    }
    let seconds = start.elapsed().as_secs_f64();
    println!(
        "Hashed {} bytes in {:.1}s ({:.1} MiB/s)",
        total_bytes,
        seconds,
        total_bytes as f64 / seconds.max(1e-9) / (1 << 20) as f64
    );
    Ok(0)
}

/// Walk a content directory and create one index symlink per distinct hash,
/// for repositories whose index was lost or never built.
fn cmd_create_index(working_dir: &Path, args: &CreateIndexArgs) -> Result<i32> {
    let (make_hasher, _) = hasher_for(&args.algorithm)?;
    let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions::default());
    let mut index = DiskHashIndex::<32>::new(working_dir.join(&args.index_dir));
    let content_dir = working_dir.join(&args.content_dir);

    let mut successful = 0u64;
    let mut duplicates = 0u64;
    let mut non_files = 0u64;
    let mut errors = 0u64;
    for entry in walkdir::WalkDir::new(&content_dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors += 1;
                println!("{} {}", style("***").red(), e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            non_files += 1;
            continue;
        }
        let hashed = FileSource::open(entry.path())
            .and_then(|mut source| hash_source(&streamer, &make_hasher, &mut source));
        let id = match hashed {
            Ok(id) => id,
            Err(e) => {
                errors += 1;
                println!("{} {}\n *- {}", style("***").red(), entry.path().display(), e);
                continue;
            }
        };
        match index.insert(&id, entry.path()) {
            Ok(true) => {
                successful += 1;
                println!("+ {}", entry.path().display());
            }
            Ok(false) => {
                duplicates += 1;
                println!("= {}", entry.path().display());
            }
            Err(e) => {
                errors += 1;
                println!("{} {}\n *- {}", style("***").red(), entry.path().display(), e);
            }
        }
    }
    println!(
        "\n{} files successfully indexed\n\
         {} files ignored because they were duplicates\n\
         {} directory entries skipped because they weren't regular files\n\
         {} files skipped because of errors",
        successful, duplicates, non_files, errors
    );
    Ok(if errors == 0 { 0 } else { 1 })
}
