// Author: BlackIce Project
// License: MIT

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::{Daemon, DaemonMsg};
use crate::ipc::router::write_line;

/// `run <intent>`: accept the intent, then hold the connection open until
/// the task reaches a terminal state so the CLI can exit with the right
/// code.
pub async fn handle(intent: &str, tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let started = match super::request(
        tx,
        DaemonMsg::RunIntent {
            intent: intent.to_string(),
            reply: reply_tx,
        },
        reply_rx,
    )
    .await
    {
        Ok(Ok(started)) => started,
        Ok(Err(reason)) => {
            write_line(out, &format!("REFUSED {reason}")).await;
            return;
        }
        Err(e) => {
            write_line(out, &format!("ERROR: {e}")).await;
            return;
        }
    };

    write_line(out, &format!("TASK {}", started.task_id)).await;

    // No timeout here: plans legitimately run for minutes. The daemon
    // cancels tasks on shutdown, which resolves this receiver.
    match started.done.await {
        Ok(result) => {
            let code = Daemon::exit_code_for(&result);
            let reason = result.reason.unwrap_or_default();
            write_line(
                out,
                &format!("DONE {code} {:?} {reason}", result.status).trim_end(),
            )
            .await;
        }
        Err(_) => write_line(out, "ERROR: task runtime dropped").await,
    }
}
