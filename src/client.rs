// Author: BlackIce Project
// License: MIT

use eyre::{eyre, Result, WrapErr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Outcome of one client command: lines already printed, plus the exit
/// code the process should end with.
pub struct CommandOutcome {
    pub exit_code: i32,
}

/// Send one command line to the daemon and stream its response to stdout.
///
/// Exit codes: 0 success, 2 policy denial, 3 emergency stop, 4 planner
/// unavailable, 5 display unavailable, 1 anything else.
pub async fn send_command(cmd: &str) -> Result<CommandOutcome> {
    let path = crate::ipc::socket_path().map_err(|e| eyre!(e))?;
    let stream = UnixStream::connect(&path)
        .await
        .wrap_err_with(|| format!("daemon not reachable at {}", path.display()))?;

    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(format!("{cmd}\n").as_bytes())
        .await
        .wrap_err("failed to send command")?;
    write_half.shutdown().await.ok();

    let mut exit_code = 0;
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await.wrap_err("connection lost")? {
        exit_code = classify_line(&line).unwrap_or(exit_code);
        println!("{line}");
    }

    Ok(CommandOutcome { exit_code })
}

/// Map a response line to an exit code, if it carries one.
fn classify_line(line: &str) -> Option<i32> {
    if let Some(done) = line.strip_prefix("DONE ") {
        return done
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok());
    }
    if let Some(refused) = line.strip_prefix("REFUSED ") {
        if refused.starts_with("emergency_stop") {
            return Some(3);
        }
        if refused.starts_with("display_unavailable") {
            return Some(5);
        }
        return Some(1);
    }
    if line.starts_with("ERROR") {
        return Some(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_lines_carry_their_exit_code() {
        assert_eq!(classify_line("DONE 0 Completed"), Some(0));
        assert_eq!(classify_line("DONE 2 Failed policy_denied: blocked"), Some(2));
        assert_eq!(classify_line("DONE 3 Cancelled emergency_stop:Hotkey"), Some(3));
        assert_eq!(classify_line("DONE 4 Failed planner_unavailable: down"), Some(4));
    }

    #[test]
    fn refusals_map_to_their_category() {
        assert_eq!(classify_line("REFUSED emergency_stop: latched"), Some(3));
        assert_eq!(classify_line("REFUSED display_unavailable: no id"), Some(5));
        assert_eq!(classify_line("REFUSED busy"), Some(1));
    }

    #[test]
    fn plain_output_keeps_the_current_code() {
        assert_eq!(classify_line("TASK task-0001"), None);
        assert_eq!(classify_line("{\"status\": \"running\"}"), None);
    }
}
