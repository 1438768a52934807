//! coldvault command line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use coldvault_protocol::VaultRef;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coldvault")]
#[command(about = "Upload files to and retrieve archives from cold-archive vaults")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "COLDVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Local store root directory (overrides config)
    #[arg(long, global = true, env = "COLDVAULT_STORE")]
    store: Option<PathBuf>,

    /// Parallel transfers (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Upload part size in MiB, a power of two (overrides config)
    #[arg(long, global = true)]
    part_size_mib: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file as a new archive and print its record
    Upload {
        /// Target vault as region:name
        vault: VaultRef,
        /// File to upload
        file: PathBuf,
        /// Archive description (defaults to the file name)
        description: Vec<String>,
    },
    /// Retrieve an archive into a local file
    Download {
        /// Source vault as region:name
        vault: VaultRef,
        /// Archive id returned by upload
        archive_id: String,
        /// Output file
        output: PathBuf,
    },
    /// Print a file's tree hash without uploading it
    Hash {
        /// File to hash
        file: PathBuf,
    },
    /// Create a vault in the local store
    CreateVault {
        /// Vault as region:name
        vault: VaultRef,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store_root = store;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(part_size_mib) = cli.part_size_mib {
        config.part_size_mib = part_size_mib;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli.command, config))
}
