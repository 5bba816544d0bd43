// Author: BlackIce Project
// License: MIT

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::DaemonMsg;
use crate::ipc::router::write_line;

pub async fn handle_stop(
    task_id: Option<&str>,
    tx: &mpsc::Sender<DaemonMsg>,
    out: &mut OwnedWriteHalf,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    respond(
        super::request(
            tx,
            DaemonMsg::Cancel {
                task_id: task_id.map(String::from),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await,
        out,
    )
    .await;
}

pub async fn handle_pause(
    task_id: Option<&str>,
    tx: &mpsc::Sender<DaemonMsg>,
    out: &mut OwnedWriteHalf,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    respond(
        super::request(
            tx,
            DaemonMsg::Pause {
                task_id: task_id.map(String::from),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await,
        out,
    )
    .await;
}

pub async fn handle_resume(
    task_id: Option<&str>,
    tx: &mpsc::Sender<DaemonMsg>,
    out: &mut OwnedWriteHalf,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    respond(
        super::request(
            tx,
            DaemonMsg::Resume {
                task_id: task_id.map(String::from),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await,
        out,
    )
    .await;
}

pub async fn handle_stop_daemon(tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    respond(
        super::request(tx, DaemonMsg::StopDaemon { reply: reply_tx }, reply_rx).await,
        out,
    )
    .await;
}

async fn respond(result: Result<Result<String, String>, String>, out: &mut OwnedWriteHalf) {
    match result {
        Ok(Ok(msg)) => write_line(out, &format!("OK {msg}")).await,
        Ok(Err(reason)) => write_line(out, &format!("ERROR: {reason}")).await,
        Err(e) => write_line(out, &format!("ERROR: {e}")).await,
    }
}
