//! Bundlefetch CLI - Command-line interface
//!
//! Downloads large content bundles in verified, resumable chunks.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use commands::common::{parse_size, ContentTypeArg, PriorityArg};
use error::CliError;
use runner::GlobalArgs;

#[derive(Parser)]
#[command(name = "bundlefetch")]
#[command(version, about = "Resumable, verified delivery of large content bundles", long_about = None)]
struct Cli {
    /// Work directory for task state, staged chunks and logs
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Configuration file (default: <config dir>/bundlefetch/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a single artifact
    Fetch {
        /// Source URL (fetched with HTTP range requests)
        #[arg(long)]
        url: Option<String>,

        /// Per-chunk source URL, in chunk order (repeatable)
        #[arg(long = "chunk-url")]
        chunk_urls: Vec<String>,

        /// Artifact size in bytes (probed with HEAD when omitted)
        #[arg(long, value_parser = parse_size)]
        size: Option<u64>,

        /// Chunk size, e.g. 4M
        #[arg(long, value_parser = parse_size)]
        chunk_size: Option<u64>,

        /// Expected SHA-256 of the whole artifact
        #[arg(long)]
        sha256: Option<String>,

        /// Expected SHA-256 of each chunk, in chunk order (repeatable)
        #[arg(long = "chunk-sha256")]
        chunk_sha256: Vec<String>,

        /// Destination path (default: <output dir>/<task id>.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "medium")]
        priority: PriorityArg,

        #[arg(long, value_enum, default_value = "module")]
        content_type: ContentTypeArg,
    },

    /// Download a module listed in a content manifest
    Manifest {
        /// Manifest JSON file
        file: PathBuf,

        /// Module to download (default: core)
        #[arg(long)]
        module: Option<String>,

        /// Directory modules are installed under (default: output dir)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Override the module's default priority
        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,

        /// List the manifest's modules and exit
        #[arg(long)]
        list: bool,
    },

    /// Resume interrupted and paused downloads
    Resume {
        /// Give failed tasks a fresh round of retries
        #[arg(long)]
        retry_failed: bool,
    },

    /// Show persisted tasks
    Status,

    /// Cancel a task and delete its staged data
    Cancel {
        /// Task id or unique id prefix
        id: String,
    },

    /// Show storage capacity of the work directory
    Storage,
}

fn main() {
    let cli = Cli::parse();
    let global = GlobalArgs {
        work_dir: cli.work_dir,
        config: cli.config,
        verbose: cli.verbose,
    };

    let result: Result<(), CliError> = match cli.command {
        Commands::Fetch {
            url,
            chunk_urls,
            size,
            chunk_size,
            sha256,
            chunk_sha256,
            output,
            priority,
            content_type,
        } => commands::fetch::run(
            &global,
            commands::fetch::FetchArgs {
                url,
                chunk_urls,
                size,
                chunk_size,
                sha256,
                chunk_sha256,
                output,
                priority,
                content_type,
            },
        ),

        Commands::Manifest {
            file,
            module,
            dest,
            priority,
            list,
        } => commands::manifest::run(
            &global,
            commands::manifest::ManifestArgs {
                file,
                module,
                dest,
                priority,
                list,
            },
        ),

        Commands::Resume { retry_failed } => {
            commands::resume::run(&global, commands::resume::ResumeArgs { retry_failed })
        }

        Commands::Status => commands::status::run(&global),

        Commands::Cancel { id } => commands::cancel::run(&global, &id),

        Commands::Storage => commands::storage::run(&global),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
