// Author: BlackIce Project
// License: MIT

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixListener,
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::daemon::DaemonMsg;

/// Bind the control socket and serve connections until the process exits.
///
/// Protocol: one command line in; one or more response lines out; the
/// server closes the stream when the command is finished. `run` keeps the
/// connection open until its task reaches a terminal state.
pub async fn spawn_ipc_server(tx: mpsc::Sender<DaemonMsg>) -> Result<(), String> {
    let path = crate::ipc::socket_path()?;

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // Remove stale socket file (if any). Ignore errors.
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)
        .map_err(|e| format!("failed to bind ipc socket {}: {e}", path.display()))?;

    info!(socket = %path.display(), "ipc listening");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    error!(error = %e, "ipc accept failed");
                    continue;
                }
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();

                let cmd = match lines.next_line().await {
                    Ok(Some(line)) => line.trim().to_string(),
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "ipc read failed");
                        return;
                    }
                };

                if cmd.is_empty() {
                    let _ = write_half.write_all(b"ERROR: empty command\n").await;
                    let _ = write_half.shutdown().await;
                    return;
                }

                debug!(command = %cmd, "ipc command");
                crate::ipc::router::route_command(&cmd, &tx, &mut write_half).await;
                let _ = write_half.shutdown().await;
            });
        }
    });

    Ok(())
}
