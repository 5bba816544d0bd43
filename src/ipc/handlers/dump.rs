// Author: BlackIce Project
// License: MIT

use std::path::PathBuf;

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::DaemonMsg;
use crate::ipc::router::write_line;

pub async fn handle(path: &str, tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = super::request(
        tx,
        DaemonMsg::DumpAudit {
            path: PathBuf::from(path),
            reply: reply_tx,
        },
        reply_rx,
    )
    .await;

    match result {
        Ok(Ok(msg)) => write_line(out, &format!("OK {msg}")).await,
        Ok(Err(reason)) => write_line(out, &format!("ERROR: {reason}")).await,
        Err(e) => write_line(out, &format!("ERROR: {e}")).await,
    }
}
