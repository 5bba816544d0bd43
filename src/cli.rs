// Author: BlackIce Project
// License: MIT

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version = env!("CARGO_PKG_VERSION"),
    about = "Safety and control daemon for desktop automation"
)]
pub struct Args {
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(short, long, action)]
    pub verbose: bool,

    #[arg(long, action)]
    pub no_console: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(about = "Run a natural-language intent and wait for it to finish")]
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        intent: Vec<String>,
    },

    #[command(about = "Show the status of one task or all tasks")]
    Status {
        task_id: Option<String>,
    },

    #[command(about = "Cancel one task or all active tasks")]
    Stop {
        task_id: Option<String>,
    },

    #[command(about = "Pause one task or all active tasks")]
    Pause {
        task_id: Option<String>,
    },

    #[command(about = "Resume one task or all paused tasks")]
    Resume {
        task_id: Option<String>,
    },

    #[command(about = "Write the audit ring to a JSON file")]
    DumpAudit {
        path: PathBuf,
    },

    #[command(about = "Display daemon and task information")]
    Info {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Trigger the emergency stop sequence")]
    Emergency,

    #[command(about = "Re-arm after an emergency stop")]
    ResetEmergency,

    #[command(about = "Stop the running daemon")]
    StopDaemon,
}
