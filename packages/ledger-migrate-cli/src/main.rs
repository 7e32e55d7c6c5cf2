use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod logger;

use config::Config;

#[derive(Parser)]
#[command(author, version, about = "Apply and roll back versioned SQL migrations", long_about = None)]
struct Cli {
    /// Environment file to load before reading configuration
    #[arg(long, default_value = ".env")]
    env: PathBuf,

    /// SQLite database file (falls back to DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Directory holding NNN_name.up.sql / NNN_name.down.sql files (falls back to MIGRATIONS_DIR)
    #[arg(long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every pending migration in version order
    Up,
    /// Roll back the most recently applied migration
    Down,
    /// Show the applied migrations recorded in the ledger
    Status,
    /// List migrations on disk that have not been applied
    Pending,
}

fn run(cli: Cli) -> Result<()> {
    config::load_env_file(&cli.env);

    let config = Config::resolve(cli.database, cli.dir)?;
    let mut runner = config.open_runner()?;
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Up => commands::execute_up(&mut runner, &mut out),
        Commands::Down => commands::execute_down(&mut runner, &mut out),
        Commands::Status => commands::execute_status(&runner, &mut out),
        Commands::Pending => commands::execute_pending(&runner, &mut out),
    }
}

fn main() {
    logger::init();

    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
