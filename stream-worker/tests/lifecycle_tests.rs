//! Lifecycle manager tests against a fake launcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeLauncher, MemoryRepository, RecordingStore, wait_until};
use stream_worker::Error;
use stream_worker::lifecycle::{
    DispatcherConfig, ManagerDeps, StreamCommand, StreamManager,
};
use stream_worker::tracker::TrackerConfig;
use stream_worker::transcode::ShutdownStage;

const SOURCE: &str = "rtmp://localhost/live/s1";

struct Harness {
    manager: StreamManager,
    launcher: Arc<FakeLauncher>,
    _dir: tempfile::TempDir,
}

fn harness(config: DispatcherConfig, make_launcher: impl FnOnce(FakeLauncher) -> FakeLauncher) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(make_launcher(FakeLauncher::new(dir.path())));
    let deps = ManagerDeps {
        launcher: launcher.clone(),
        repo: Arc::new(MemoryRepository::new()),
        store: Arc::new(RecordingStore::new()),
        tracker: TrackerConfig::default().with_poll_interval_ms(20),
    };
    Harness {
        manager: StreamManager::new(config, deps),
        launcher,
        _dir: dir,
    }
}

fn started(config: DispatcherConfig, make_launcher: impl FnOnce(FakeLauncher) -> FakeLauncher) -> Harness {
    let h = harness(config, make_launcher);
    h.manager.start();
    h
}

const WAIT: Duration = Duration::from_secs(5);

mod start_stop {
    use super::*;

    #[tokio::test]
    async fn test_start_registers_stream() {
        let h = started(DispatcherConfig::default(), |l| l);

        h.manager.dispatch(StreamCommand::start("s1", SOURCE)).unwrap();

        assert!(wait_until(WAIT, || h.manager.is_active("s1")).await);
        assert_eq!(h.launcher.launch_count(), 1);
        let launched = h.launcher.last().unwrap();
        assert_eq!(launched.request.stream_id, "s1");
        assert_eq!(launched.request.source_url, SOURCE);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_removes_entry_and_stops_process() {
        let h = started(DispatcherConfig::default(), |l| l);

        h.manager.dispatch(StreamCommand::start("s1", SOURCE)).unwrap();
        assert!(wait_until(WAIT, || h.manager.is_active("s1")).await);
        let process = h.manager.process("s1").unwrap();

        h.manager.dispatch(StreamCommand::stop("s1")).unwrap();
        assert!(wait_until(WAIT, || !h.manager.is_active("s1")).await);
        assert!(wait_until(WAIT, || process.is_done()).await);
        assert!(process.is_manual_stop());
        assert_eq!(process.shutdown_stage(), Some(ShutdownStage::GracefulStop));

        // No retry follows an intentional stop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.launcher.launch_count(), 1);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_stream_is_noop() {
        let h = started(DispatcherConfig::default(), |l| l);

        h.manager.dispatch(StreamCommand::stop("missing")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.manager.active_count(), 0);
        assert_eq!(h.launcher.launch_count(), 0);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_keeps_single_entry() {
        let h = started(DispatcherConfig::default(), |l| l);

        h.manager.dispatch(StreamCommand::start("s1", SOURCE)).unwrap();
        assert!(wait_until(WAIT, || h.manager.is_active("s1")).await);
        let first = h.manager.process("s1").unwrap();

        h.manager.dispatch(StreamCommand::start("s1", SOURCE)).unwrap();
        assert!(wait_until(WAIT, || h.launcher.launch_count() == 2).await);
        assert!(
            wait_until(WAIT, || {
                h.manager
                    .process("s1")
                    .is_some_and(|p| p.launch_id() != first.launch_id())
            })
            .await
        );

        assert_eq!(h.manager.active_count(), 1);
        assert!(first.is_manual_stop());
        assert!(first.is_done());

        // The old launch's monitor must not remove the replacement.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.manager.is_active("s1"));
        assert_eq!(h.launcher.launch_count(), 2);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_many_streams_are_independent() {
        let h = started(DispatcherConfig::default(), |l| l);

        for i in 0..8 {
            h.manager
                .dispatch(StreamCommand::start(format!("s{i}"), SOURCE))
                .unwrap();
        }
        assert!(wait_until(WAIT, || h.manager.active_count() == 8).await);

        h.manager.dispatch(StreamCommand::stop("s3")).unwrap();
        assert!(wait_until(WAIT, || !h.manager.is_active("s3")).await);
        assert_eq!(h.manager.active_count(), 7);

        let mut ids = h.manager.active_stream_ids();
        ids.sort();
        assert!(!ids.contains(&"s3".to_string()));

        h.manager.shutdown().await;
    }
}

mod retries {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_crash_schedules_retry() {
        let h = started(DispatcherConfig::default(), |l| l);

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(3))
            .unwrap();
        assert!(wait_until(WAIT, || h.manager.is_active("s1")).await);
        let first = h.launcher.last().unwrap();
        assert_eq!(first.request.retry_count, 0);

        first.crash("exit status: 1: Input/output error");

        // Deregistered while the 2s backoff runs.
        assert!(wait_until(Duration::from_secs(1), || !h.manager.is_active("s1")).await);
        assert_eq!(h.launcher.launch_count(), 1);

        assert!(wait_until(Duration::from_secs(5), || h.launcher.launch_count() == 2).await);
        let second = h.launcher.last().unwrap();
        assert_eq!(second.request.retry_count, 1);
        assert_eq!(second.request.source_url, SOURCE);
        assert!(
            wait_until(WAIT, || {
                h.manager
                    .process("s1")
                    .is_some_and(|p| p.launch_id() == second.process.launch_id())
            })
            .await
        );
        assert_eq!(
            first.process.exit_error().as_deref(),
            Some("exit status: 1: Input/output error")
        );

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_at_max_retry() {
        let h = started(DispatcherConfig::default(), |l| l.crashing());

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(3))
            .unwrap();

        // One launch plus three retries, 2s, 4s and 6s apart.
        assert!(wait_until(Duration::from_secs(60), || h.launcher.launch_count() == 4).await);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.launcher.launch_count(), 4);
        assert!(wait_until(Duration::from_secs(5), || h.manager.active_count() == 0).await);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_grows() {
        let h = started(DispatcherConfig::default(), |l| l.crashing());

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(3))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || h.launcher.launch_count() == 1).await);

        // The first retry waits 2s.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.launcher.launch_count(), 1);
        assert!(wait_until(Duration::from_secs(1), || h.launcher.launch_count() == 2).await);

        // The second waits 4s.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(h.launcher.launch_count(), 2);
        assert!(wait_until(Duration::from_secs(1), || h.launcher.launch_count() == 3).await);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_retried() {
        let h = started(DispatcherConfig::default(), |l| l.failing(2));

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(3))
            .unwrap();

        assert!(wait_until(Duration::from_secs(30), || h.manager.is_active("s1")).await);
        assert_eq!(h.launcher.launch_count(), 1);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_into_full_queue_is_dropped() {
        let config = DispatcherConfig {
            worker_count: 1,
            queue_capacity: 1,
            ..DispatcherConfig::default()
        };
        let h = started(config, |l| l.slow(Duration::from_secs(5)).failing(1));

        // s1 fails at 5s and its retry comes due at 7s.
        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(1))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.manager.dispatch(StreamCommand::start("s2", SOURCE)).unwrap();
        // s2 left the queue at 5s; s3 fills it again before the retry.
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.manager.dispatch(StreamCommand::start("s3", SOURCE)).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;

        let launched: Vec<String> = h
            .launcher
            .launched()
            .iter()
            .map(|l| l.request.stream_id.clone())
            .collect();
        assert_eq!(launched, vec!["s2", "s3"]);
        assert!(!h.manager.is_active("s1"));

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_retry_never_retries() {
        let h = started(DispatcherConfig::default(), |l| l.crashing());

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(0))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || h.launcher.launch_count() == 1).await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.launcher.launch_count(), 1);

        h.manager.shutdown().await;
    }
}

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_rejects_command() {
        let config = DispatcherConfig {
            queue_capacity: 2,
            ..DispatcherConfig::default()
        };
        // Workers are not started, so nothing drains the queue.
        let h = harness(config, |l| l);

        h.manager.dispatch(StreamCommand::start("a", SOURCE)).unwrap();
        h.manager.dispatch(StreamCommand::start("b", SOURCE)).unwrap();
        let err = h
            .manager
            .dispatch(StreamCommand::start("c", SOURCE))
            .unwrap_err();

        assert!(matches!(err, Error::Dispatch(_)));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let h = started(DispatcherConfig::default(), |l| l);
        h.manager.shutdown().await;

        let err = h
            .manager
            .dispatch(StreamCommand::start("s1", SOURCE))
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
        assert_eq!(h.launcher.launch_count(), 0);
    }
}

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_every_stream() {
        let h = started(DispatcherConfig::default(), |l| l);

        for id in ["a", "b", "c"] {
            h.manager.dispatch(StreamCommand::start(id, SOURCE)).unwrap();
        }
        assert!(wait_until(WAIT, || h.manager.active_count() == 3).await);

        h.manager.shutdown().await;

        assert_eq!(h.manager.active_count(), 0);
        for launched in h.launcher.launched() {
            assert!(launched.process.is_manual_stop());
            assert!(launched.process.is_done());
        }
        assert_eq!(h.launcher.launch_count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let h = started(DispatcherConfig::default(), |l| l.stubborn());

        h.manager.dispatch(StreamCommand::start("s1", SOURCE)).unwrap();
        assert!(wait_until(WAIT, || h.manager.is_active("s1")).await);
        let process = h.manager.process("s1").unwrap();

        h.manager.shutdown().await;

        assert!(process.is_done());
        assert_eq!(process.shutdown_stage(), Some(ShutdownStage::ForceKill));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let h = started(DispatcherConfig::default(), |l| l.crashing());

        h.manager
            .dispatch(StreamCommand::start("s1", SOURCE).with_max_retry(3))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || h.launcher.launch_count() == 1).await);

        h.manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.launcher.launch_count(), 1);
    }
}
