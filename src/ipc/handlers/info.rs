// Author: BlackIce Project
// License: MIT

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::DaemonMsg;
use crate::ipc::router::write_line;

pub async fn handle(as_json: bool, tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = super::request(
        tx,
        DaemonMsg::Info {
            json: as_json,
            reply: reply_tx,
        },
        reply_rx,
    )
    .await;

    match result {
        Ok(Ok(info)) => write_line(out, &info).await,
        Ok(Err(reason)) => write_line(out, &format!("ERROR: {reason}")).await,
        Err(e) => {
            if as_json {
                write_line(out, r#"{"running": false}"#).await;
            } else {
                write_line(out, &format!("ERROR: {e}")).await;
            }
        }
    }
}
