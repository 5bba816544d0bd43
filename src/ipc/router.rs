// Author: BlackIce Project
// License: MIT

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;

use crate::daemon::DaemonMsg;

pub async fn route_command(
    cmd: &str,
    tx: &mpsc::Sender<DaemonMsg>,
    out: &mut OwnedWriteHalf,
) {
    let mut parts = cmd.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().map(str::trim).filter(|r| !r.is_empty());

    match verb {
        "run" => match rest {
            Some(intent) => crate::ipc::handlers::run::handle(intent, tx, out).await,
            None => write_line(out, "ERROR: run requires an intent").await,
        },

        "status" => crate::ipc::handlers::status::handle(rest, tx, out).await,

        "info" => {
            let as_json = rest.map_or(false, |r| r.split_whitespace().any(|t| t == "--json"));
            crate::ipc::handlers::info::handle(as_json, tx, out).await;
        }

        "stop" => crate::ipc::handlers::control::handle_stop(rest, tx, out).await,
        "pause" => crate::ipc::handlers::control::handle_pause(rest, tx, out).await,
        "resume" => crate::ipc::handlers::control::handle_resume(rest, tx, out).await,

        "dump-audit" => match rest {
            Some(path) => crate::ipc::handlers::dump::handle(path, tx, out).await,
            None => write_line(out, "ERROR: dump-audit requires a path").await,
        },

        "reset-emergency" => crate::ipc::handlers::emergency::handle_reset(tx, out).await,
        "emergency" => crate::ipc::handlers::emergency::handle_trigger(tx, out).await,

        "stop-daemon" => crate::ipc::handlers::control::handle_stop_daemon(tx, out).await,

        other => write_line(out, &format!("ERROR: unknown command: {other}")).await,
    }
}

pub async fn write_line(out: &mut OwnedWriteHalf, line: &str) {
    let _ = out.write_all(line.as_bytes()).await;
    let _ = out.write_all(b"\n").await;
}
