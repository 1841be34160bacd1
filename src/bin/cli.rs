//! flockd CLI
//!
//! Command-line interface for inspecting and editing a flockd database.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flockd::{Config, Database, FlockdError, Table};
use tracing_subscriber::{fmt, EnvFilter};

/// flockd CLI
#[derive(Parser, Debug)]
#[command(name = "flockd-cli")]
#[command(about = "CLI for the flockd file system key/value store")]
#[command(version)]
struct Args {
    /// Database root directory
    #[arg(short, long, default_value = "./flockd.db")]
    root: String,

    /// Lock timeout in milliseconds
    #[arg(short, long, default_value = "10")]
    timeout_ms: u64,

    /// Table to operate on (defaults to the root table)
    #[arg(long, global = true)]
    table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value stored under a key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key, creating or replacing it
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Create a key that must not exist yet
    Create {
        /// The key to create
        key: String,

        /// The value to store
        value: String,
    },

    /// Replace the value of an existing key
    Update {
        /// The key to update
        key: String,

        /// The new value
        value: String,
    },

    /// Delete a key
    #[command(alias = "del")]
    Delete {
        /// The key to delete
        key: String,
    },

    /// Print every record in the table
    List,

    /// Print every table found under the root
    Tables,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,flockd=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), FlockdError> {
    let config = Config::builder()
        .root(&args.root)
        .lock_timeout_ms(args.timeout_ms)
        .build();
    let db = Database::open(config)?;

    let table: Arc<Table> = match &args.table {
        Some(name) => db.table(name)?,
        None => Arc::new(db.root().clone()),
    };

    match args.command {
        Commands::Get { key } => {
            let value = table.get(&key)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Set { key, value } => table.set(&key, value.as_bytes())?,
        Commands::Create { key, value } => table.create(&key, value.as_bytes())?,
        Commands::Update { key, value } => table.update(&key, value.as_bytes())?,
        Commands::Delete { key } => table.delete(&key)?,
        Commands::List => {
            table.for_each(|key, value| {
                println!("{}: {}", key, String::from_utf8_lossy(value));
                Ok::<(), FlockdError>(())
            })?;
        }
        Commands::Tables => {
            for found in db.tables()? {
                let name = if found.name().is_empty() { "(root)" } else { found.name() };
                println!("{}\t{}", name, found.path().display());
            }
        }
    }

    Ok(())
}
