// Author: BlackIce Project
// License: MIT

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::DaemonMsg;
use crate::ipc::router::write_line;

pub async fn handle(
    task_id: Option<&str>,
    tx: &mpsc::Sender<DaemonMsg>,
    out: &mut OwnedWriteHalf,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = super::request(
        tx,
        DaemonMsg::Status {
            task_id: task_id.map(String::from),
            reply: reply_tx,
        },
        reply_rx,
    )
    .await;

    match result {
        Ok(Ok(json)) => write_line(out, &json).await,
        Ok(Err(reason)) => write_line(out, &format!("ERROR: {reason}")).await,
        Err(e) => write_line(out, &format!("ERROR: {e}")).await,
    }
}
