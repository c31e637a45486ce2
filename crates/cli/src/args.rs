//! Command-line interface.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "quire",
    about = "Follow jobs, compile documents and manage their saved versions",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Follow a job until it finishes
    Watch {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    /// Save if needed, compile, print diagnostics
    Compile {
        #[arg(value_name = "DOCUMENT_ID")]
        document_id: String,
    },
    /// List saved versions
    Backups {
        #[arg(value_name = "DOCUMENT_ID")]
        document_id: String,
    },
    /// Restore a saved version
    Restore {
        #[arg(value_name = "DOCUMENT_ID")]
        document_id: String,

        #[arg(value_name = "VERSION_ID")]
        version_id: String,

        #[arg(
            long = "yes",
            short = 'y',
            help = "Skip the confirmation prompt"
        )]
        assume_yes: bool,
    },
}
