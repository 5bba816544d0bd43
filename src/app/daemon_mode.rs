// Author: BlackIce Project
// License: MIT

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;
use crate::daemon::Daemon;
use crate::planner::UnconfiguredPlanner;
use crate::services::notify::DbusNotifier;
use crate::templates::NullMatcher;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

pub async fn run(args: Args) -> Result<(), AnyError> {
    // single-instance
    let _instance_lock = crate::app::platform::acquire_single_instance_lock().map_err(|e| {
        eprintln!("{e}");
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, e)
    })?;

    init_logging(&args);

    info!("warden starting");

    // resolve config path
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(crate::config::resolve_default_config_path);

    let mut settings = crate::config::load_from_path(&config_path).map_err(|e| {
        error!("{e}");
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;

    // The user display is whatever session launched us, never config-only.
    settings.display.user_display = crate::app::platform::detect_user_display();
    info!(
        config = %config_path.display(),
        user_display = %settings.display.user_display,
        strict = settings.policy.strict_mode,
        "configuration loaded"
    );

    // External collaborators. The planner backend and template matcher
    // attach through their traits; bare defaults keep the safety core
    // honest without them.
    let daemon = Daemon::new(
        settings,
        Arc::new(UnconfiguredPlanner),
        Arc::new(NullMatcher),
        Arc::new(DbusNotifier::new(tokio::runtime::Handle::current())),
    )
    .map_err(|e| -> AnyError { e.to_string().into() })?;

    let (msg_tx, msg_rx) = tokio::sync::mpsc::channel(64);
    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    crate::ipc::server::spawn_ipc_server(msg_tx.clone())
        .await
        .map_err(|e| std::io::Error::other(e))?;

    let mut daemon_task = tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move { daemon.run(msg_rx, shutdown_tx).await }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = &mut daemon_task => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string().into()),
                Err(join_err) => Err(Box::new(join_err) as AnyError),
            }
        }

        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
            let _ = daemon_task.await;
            Ok(())
        }

        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            let _ = shutdown_tx.send(true);
            let _ = daemon_task.await;
            Ok(())
        }
    }
}

fn init_logging(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={default_level}")));

    let console_layer = (!args.no_console).then(|| fmt::layer().with_target(false));

    let file_layer = crate::app::platform::default_log_path().and_then(|path| {
        let needs_blank =
            crate::warden_log::prepare_log_file(&path, crate::warden_log::LogPolicy::default())
                .unwrap_or(false);
        if needs_blank {
            let _ = crate::warden_log::write_raw_blank_line(&path);
        }
        let _ = crate::warden_log::write_raw_line(&path, &crate::warden_log::run_header());

        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Arc::new(file)),
            ),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file logging disabled");
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}
