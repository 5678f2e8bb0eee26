use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "procwarden service supervisor")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Sub‑commands (run when omitted)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Start services and supervise them until they all stop or SIGINT / SIGTERM
    Run {
        /// Services to start (default: all, in configuration order)
        services: Vec<String>,
    },
    /// Print the status of every configured service
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Stop every service
    Stop,
}
