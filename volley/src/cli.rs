use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Bulk email dispatch over a rotating pool of SMTP relays
#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(about = "Send one message to many recipients through a pool of relays", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Engine configuration (RON). Falls back to `VOLLEY_CONFIG`,
    /// ./volley.config.ron and /etc/volley/volley.config.ron
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a job and follow it until it finishes
    Send {
        /// Job description (RON)
        #[arg(short, long)]
        job: PathBuf,

        /// Recipient list, one address per line; replaces the job's list
        #[arg(short, long)]
        recipients: Option<PathBuf>,

        /// Relays file with one `host|port|username|password` per line;
        /// replaces the job's relays
        #[arg(long)]
        relays: Option<PathBuf>,

        /// Number of concurrent workers (1-10)
        #[arg(short, long)]
        workers: Option<i64>,

        /// Where job events go
        #[arg(long, value_enum, default_value = "console")]
        output: Output,
    },
    /// Validate a recipient list without sending anything
    Check {
        /// Recipient list, one address per line
        list: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Output {
    /// Print events to the terminal
    Console,
    /// Route events through the diagnostic log (see `LOG_FORMAT`)
    Log,
}
