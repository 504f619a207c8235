use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stream_worker::config::WorkerConfig;
use stream_worker::database::{self, repositories::SqlxStreamRepository};
use stream_worker::gc::GarbageCollector;
use stream_worker::ingest::{IngestRuntime, Registration, STREAM_ON_PUBLISH, StreamCommandHandler};
use stream_worker::lifecycle::{ManagerDeps, StreamManager};
use stream_worker::logging::{self, LogFormat};
use stream_worker::storage::build_object_store;
use stream_worker::transcode::FfmpegLauncher;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Consumers per registration for stream commands.
const STREAM_COMMAND_CONSUMERS: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env_or_default();

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir, LogFormat::for_profile(config.profile))?;
    let shutdown_token = CancellationToken::new();
    let retention_task = logging_config.start_retention_cleanup(shutdown_token.clone());

    info!(profile = %config.profile, output_dir = %config.output_dir.display(), "Starting stream worker");

    let pool = database::init_pool(&config.database_url)
        .await
        .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;
    let repo = Arc::new(SqlxStreamRepository::new(pool.clone()));

    stream_worker::utils::fs::ensure_dir_all(&config.output_dir).await?;

    let store = build_object_store(&config.storage);
    let launcher = FfmpegLauncher::new(config.ffmpeg());
    match launcher.version() {
        Some(version) => info!(version, "FFmpeg detected"),
        None => warn!(path = %config.ffmpeg_path, "FFmpeg not found, launches will fail"),
    }

    let manager = StreamManager::new(
        config.dispatcher.clone(),
        ManagerDeps {
            launcher: Arc::new(launcher),
            repo: repo.clone(),
            store,
            tracker: config.tracker.clone(),
        },
    );
    manager.start();

    let gc = Arc::new(GarbageCollector::new(
        repo,
        config.output_dir.clone(),
        config.gc.clone(),
    ));
    let gc_task = gc.spawn(shutdown_token.child_token());

    let runtime = Arc::new(IngestRuntime::new(vec![Registration::new(
        [STREAM_ON_PUBLISH],
        Arc::new(StreamCommandHandler::new(manager.clone())),
        STREAM_COMMAND_CONSUMERS,
    )]));
    let mut ingest_task = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.run_lines(stdin_lines(), STREAM_ON_PUBLISH).await }
    });

    let ingest_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            runtime.stop();
            ingest_task.await
        }
        result = &mut ingest_task => {
            info!("Command input closed");
            result
        }
    };

    shutdown_token.cancel();
    if let Err(e) = gc_task.await {
        error!(error = %e, "Garbage collector task failed");
    }

    match ingest_result {
        Ok(Ok(count)) => info!(messages = count, "Ingestion stopped"),
        Ok(Err(e)) => error!(error = %e, "Ingestion failed"),
        Err(e) => error!(error = %e, "Ingestion task failed"),
    }

    manager.shutdown().await;
    let _ = retention_task.await;
    pool.close().await;

    info!("Stream worker stopped");
    Ok(())
}

/// Newline-delimited commands from stdin.
///
/// Reading happens on a detached thread so a pending read never holds up
/// runtime shutdown.
fn stdin_lines() -> impl AsyncBufRead + Unpin {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let handle = tokio::runtime::Handle::current();

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(mut line) = line else {
                break;
            };
            line.push('\n');
            if handle.block_on(writer.write_all(line.as_bytes())).is_err() {
                break;
            }
        }
    });

    tokio::io::BufReader::new(reader)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
