// Author: BlackIce Project
// License: MIT

use std::collections::HashMap;

use tokio::runtime::Handle;
use tracing::{debug, warn};
use zbus::zvariant::Value;
use zbus::{Connection, Proxy};

use crate::safety::Notifier;

const NOTIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Desktop notifications over `org.freedesktop.Notifications`.
///
/// Strictly best-effort: a missing session bus degrades to a log line,
/// never to an error on the emergency path.
pub struct DbusNotifier {
    handle: Handle,
}

impl DbusNotifier {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Notifier for DbusNotifier {
    fn notify(&self, summary: &str, body: &str, critical: bool) {
        let summary = summary.to_string();
        let body = body.to_string();
        self.handle.spawn(async move {
            if let Err(e) = send_notification(&summary, &body, critical).await {
                warn!(error = %e, "desktop notification failed");
            }
        });
    }
}

async fn send_notification(summary: &str, body: &str, critical: bool) -> zbus::Result<()> {
    let fut = async {
        let session = Connection::session().await?;
        let proxy = Proxy::new(
            &session,
            "org.freedesktop.Notifications",
            "/org/freedesktop/Notifications",
            "org.freedesktop.Notifications",
        )
        .await?;

        let mut hints: HashMap<&str, Value<'_>> = HashMap::new();
        // Urgency 2 = critical per the notification spec.
        hints.insert("urgency", Value::U8(if critical { 2 } else { 1 }));

        let _: u32 = proxy
            .call(
                "Notify",
                &(
                    "warden",
                    0u32,
                    "dialog-warning",
                    summary,
                    body,
                    Vec::<String>::new(),
                    hints,
                    5000i32,
                ),
            )
            .await?;
        debug!(summary, "desktop notification sent");
        Ok(())
    };

    match tokio::time::timeout(NOTIFY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(zbus::Error::Failure("notification timed out".to_string())),
    }
}
