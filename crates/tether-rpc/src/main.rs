//! Tether RPC - command-line front end for the service directory.
//!
//! Installs and removes providers in the directory database, resolves
//! `intent:` targets against it, and runs an in-process transport demo.

mod demo;
mod manage;
mod resolve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_core::SqliteDirectory;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Service directory and transport tool for tether")]
struct Args {
    /// Directory database (defaults to the platform config dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install or replace a provider
    Install(manage::InstallArgs),
    /// Remove a provider or a whole package
    Remove(manage::RemoveArgs),
    /// List installed providers as JSON
    List,
    /// Resolve an intent target and print the result
    Resolve(resolve::ResolveArgs),
    /// Connect in-process clients to a server that accepts up to a limit
    /// and refuses the rest
    RefuseDemo(demo::DemoArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Install(install) => manage::install(&open_directory(args.db)?, &install),
        Command::Remove(remove) => manage::remove(&open_directory(args.db)?, &remove),
        Command::List => manage::list(&open_directory(args.db)?),
        Command::Resolve(resolve) => resolve::run(open_directory(args.db)?, &resolve).await,
        Command::RefuseDemo(demo) => demo::run(&demo),
    }
}

fn open_directory(db: Option<PathBuf>) -> Result<SqliteDirectory> {
    let directory = match db {
        Some(path) => {
            debug!("Using directory database {}", path.display());
            SqliteDirectory::open_at(&path)?
        }
        None => SqliteDirectory::open()?,
    };
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tether_core::{CapabilityFilter, ComponentName};

    #[test]
    fn test_db_flag_opens_shared_file() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("directory.db");

        let first = open_directory(Some(db_path.clone())).unwrap();
        first
            .install(
                &ComponentName::new("com.example", "com.example.Echo"),
                &CapabilityFilter::new().with_action("com.example.ECHO"),
            )
            .unwrap();

        let second = open_directory(Some(db_path.clone())).unwrap();
        assert!(db_path.exists());
        assert_eq!(second.list().unwrap().len(), 1);
    }

    #[test]
    fn test_cli_parses_global_db_after_subcommand() {
        let args = Args::try_parse_from(["tether-rpc", "list", "--db", "/tmp/dir.db", "-d"]).unwrap();
        assert!(matches!(args.command, Command::List));
        assert_eq!(args.db, Some(PathBuf::from("/tmp/dir.db")));
        assert!(args.debug);
    }
}
