// Author: BlackIce Project
// License: MIT

use crate::cli::{Args, Command};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Translate a CLI subcommand into a daemon command line, send it, and
/// exit with the code the daemon decided on.
pub async fn run(args: Args) -> Result<(), AnyError> {
    let command = args.command.expect("command mode requires a subcommand");

    let wire = match command {
        Command::Run { intent } => format!("run {}", intent.join(" ")),
        Command::Status { task_id } => with_optional("status", task_id),
        Command::Stop { task_id } => with_optional("stop", task_id),
        Command::Pause { task_id } => with_optional("pause", task_id),
        Command::Resume { task_id } => with_optional("resume", task_id),
        Command::DumpAudit { path } => format!("dump-audit {}", path.display()),
        Command::Info { json } => {
            if json {
                "info --json".to_string()
            } else {
                "info".to_string()
            }
        }
        Command::Emergency => "emergency".to_string(),
        Command::ResetEmergency => "reset-emergency".to_string(),
        Command::StopDaemon => "stop-daemon".to_string(),
    };

    let outcome = crate::client::send_command(&wire)
        .await
        .map_err(|e| -> AnyError { e.to_string().into() })?;
    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    Ok(())
}

fn with_optional(verb: &str, task_id: Option<String>) -> String {
    match task_id {
        Some(id) => format!("{verb} {id}"),
        None => verb.to_string(),
    }
}
