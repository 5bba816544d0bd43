// Author: BlackIce Project
// License: MIT

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

use crate::core::events::StopSource;
use crate::daemon::DaemonMsg;
use crate::ipc::router::write_line;

pub async fn handle_reset(tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = super::request(tx, DaemonMsg::ResetEmergency { reply: reply_tx }, reply_rx).await;
    respond(result, out).await;
}

/// Programmatic trigger; same sequence as the hotkey.
pub async fn handle_trigger(tx: &mpsc::Sender<DaemonMsg>, out: &mut OwnedWriteHalf) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = super::request(
        tx,
        DaemonMsg::TriggerEmergency {
            source: StopSource::Manual,
            reply: reply_tx,
        },
        reply_rx,
    )
    .await;
    respond(result, out).await;
}

async fn respond(result: Result<Result<String, String>, String>, out: &mut OwnedWriteHalf) {
    match result {
        Ok(Ok(msg)) => write_line(out, &format!("OK {msg}")).await,
        Ok(Err(reason)) => write_line(out, &format!("ERROR: {reason}")).await,
        Err(e) => write_line(out, &format!("ERROR: {e}")).await,
    }
}
