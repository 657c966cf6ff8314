//! arcvault CLI - seal files into an encrypted vault and open it again
//!
//! Keys come either from a passphrase (scrypt, with the salt stored in the
//! vault) or from a raw 16 or 32 byte key file.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use arcvault::SealOptions;
use arcvault::file_ops::{self, KeySource};
use arcvault::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};

#[derive(Parser)]
#[command(name = "arcvault")]
#[command(version)]
#[command(about = "Pack files into a single encrypted vault.", long_about = None)]
struct Cli {
    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true, conflicts_with = "key_file")]
    passphrase_stdin: bool,

    /// Use the raw contents of FILE (16 or 32 bytes) as the key instead of
    /// a passphrase
    #[arg(long, global = true, value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal files and directories into a vault
    #[command(alias = "s")]
    Seal {
        /// Path to write the vault to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Directory for the plaintext staging file (removed when done)
        #[arg(long, value_name = "DIR", env = "ARCVAULT_STAGING_DIR")]
        staging_dir: Option<PathBuf>,

        /// Files and directories to seal, in archive order
        #[arg(value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Decrypt a vault and extract its contents
    #[command(alias = "o")]
    Open {
        /// Path to the vault to open
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Directory to extract into (created if missing)
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
    },

    /// Decrypt a vault and list its entries without extracting
    #[command(alias = "l")]
    List {
        /// Path to the vault to list
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut keys = key_source(cli.passphrase_stdin, cli.key_file);
    let result = match cli.command {
        Commands::Seal {
            output,
            staging_dir,
            paths,
        } => {
            let options = SealOptions { staging_dir };
            file_ops::seal_paths(&paths, &output, &mut keys, &options).map(|_| ())
        }
        Commands::Open { input, output } => {
            file_ops::open_vault(&input, &output, &mut keys).map(|_| ())
        }
        Commands::List { input } => file_ops::list_vault(&input, &mut keys).map(|entries| {
            for entry in entries {
                let mut shown = entry.path.display().to_string();
                if entry.is_dir {
                    if !shown.ends_with('/') {
                        shown.push('/');
                    }
                    println!("{shown}");
                } else {
                    println!("{}\t{shown}", entry.size);
                }
            }
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut cause = e.source();
        while let Some(inner) = cause {
            eprintln!("  caused by: {inner}");
            cause = inner.source();
        }
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "arcvault=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn key_source(use_stdin: bool, key_file: Option<PathBuf>) -> KeySource {
    if let Some(path) = key_file {
        return KeySource::KeyFile(path);
    }
    let reader: Box<dyn PassphraseReader> = if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(std::io::stdin())))
    } else {
        Box::new(TerminalPassphraseReader)
    };
    KeySource::Passphrase(reader)
}
