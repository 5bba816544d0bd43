// Author: BlackIce Project
// License: MIT

pub mod control;
pub mod dump;
pub mod emergency;
pub mod info;
pub mod run;
pub mod status;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::daemon::DaemonMsg;

/// Bounded wait for a daemon reply; a wedged daemon must not wedge the
/// client.
pub(super) const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Send a message and await its oneshot reply under [`REPLY_TIMEOUT`].
pub(super) async fn request<T>(
    tx: &mpsc::Sender<DaemonMsg>,
    msg: DaemonMsg,
    rx: oneshot::Receiver<T>,
) -> Result<T, String> {
    if tx.send(msg).await.is_err() {
        return Err("daemon not running".to_string());
    }
    match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err("no response from daemon".to_string()),
        Err(_) => Err("timed out waiting for daemon".to_string()),
    }
}
