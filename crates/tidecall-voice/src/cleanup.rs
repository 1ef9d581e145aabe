//! Periodic maintenance task.
//!
//! Each pass:
//! 1. Prunes quality snapshots and transitions older than the retention window
//! 2. Ends calls with no activity for longer than the idle timeout
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token is cancelled. A pass that is
//! already running completes first.

use crate::CallServer;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tidecall_common::config::CleanupConfig;
use tidecall_common::error::CallError;
use tokio_util::sync::CancellationToken;

/// Reason recorded on calls ended by the idle sweep.
pub const IDLE_TIMEOUT_REASON: &str = "idle_timeout";

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pruned_entries: usize,
    pub ended_calls: usize,
}

/// Run maintenance passes every `interval_secs` until `cancel` fires.
pub async fn run(server: CallServer, config: CleanupConfig, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = config.interval_secs,
        history_retention_secs = config.history_retention_secs,
        idle_call_timeout_secs = config.idle_call_timeout_secs,
        "Starting call cleanup task"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_once(&server, &config, Utc::now()).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Call cleanup task received shutdown signal, exiting");
                break;
            }
        }
    }

    tracing::info!("Call cleanup task stopped");
}

/// One maintenance pass as of `now`.
pub async fn run_once(server: &CallServer, config: &CleanupConfig, now: DateTime<Utc>) -> CleanupReport {
    let mut report = CleanupReport::default();

    let history_cutoff = cutoff(now, config.history_retention_secs);
    report.pruned_entries = server.fallback().prune_history(history_cutoff).await;
    if report.pruned_entries > 0 {
        tracing::debug!(pruned = report.pruned_entries, "Pruned quality history");
    }

    let idle_cutoff = cutoff(now, config.idle_call_timeout_secs);
    for call_id in server.registry().idle_calls(idle_cutoff).await {
        match server.end_call(call_id, IDLE_TIMEOUT_REASON).await {
            Ok(_) => report.ended_calls += 1,
            // Ended by a participant since the sweep looked.
            Err(CallError::CallNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(call = %call_id, error = %e, "Failed to end idle call");
            }
        }
    }
    if report.ended_calls > 0 {
        tracing::info!(ended = report.ended_calls, "Ended idle calls");
    }

    report
}

/// `now - secs`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ClientProfile, CodecCatalog};
    use crate::fallback::FallbackController;
    use crate::quality::{sample, QualityScorer};
    use crate::registry::{CallSessionRegistry, CallType};
    use tidecall_common::call_event::CallEvent;
    use tidecall_common::config::{FallbackConfig, QualityConfig};
    use uuid::Uuid;

    fn server() -> CallServer {
        let fallback = FallbackController::new(
            QualityScorer::new(QualityConfig::default()),
            CodecCatalog::builtin(),
            FallbackConfig::default(),
        );
        CallServer::new(CallSessionRegistry::new(), fallback, Vec::new(), 8)
    }

    #[tokio::test]
    async fn idle_calls_are_ended() {
        let server = server();
        let mut events = server.subscribe();
        let call = server
            .create_call(Uuid::now_v7(), Uuid::now_v7(), CallType::Video)
            .await
            .unwrap();

        let config = CleanupConfig::default();
        let report = run_once(&server, &config, Utc::now()).await;
        assert_eq!(report.ended_calls, 0);
        assert!(server.registry().contains(call.call_id).await);

        let later = Utc::now() + TimeDelta::seconds(config.idle_call_timeout_secs as i64 + 1);
        let report = run_once(&server, &config, later).await;
        assert_eq!(report.ended_calls, 1);
        assert!(!server.registry().contains(call.call_id).await);
        assert!(!server.fallback().is_registered(call.call_id).await);

        let _started = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            CallEvent::CallEnded { reason, .. } => assert_eq!(reason, IDLE_TIMEOUT_REASON),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn old_history_is_pruned_but_state_kept() {
        let server = server();
        let call = server
            .create_call(Uuid::now_v7(), Uuid::now_v7(), CallType::Video)
            .await
            .unwrap();
        let good = sample(30.0, 0.5, 5.0, 5000.0, Some(90.0));
        server
            .evaluate(call.call_id, &good, &ClientProfile::default())
            .await
            .unwrap();

        let config = CleanupConfig {
            idle_call_timeout_secs: u64::MAX,
            ..CleanupConfig::default()
        };
        let later = Utc::now() + TimeDelta::seconds(config.history_retention_secs as i64 + 1);
        let report = run_once(&server, &config, later).await;
        assert_eq!(report.pruned_entries, 1);
        assert_eq!(report.ended_calls, 0);

        let state = server.fallback_state(call.call_id).await.unwrap();
        assert!(state.quality_history.is_empty());
    }

    #[test]
    fn cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(cutoff(now, 60), now - TimeDelta::seconds(60));
        assert_eq!(cutoff(now, u64::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn cancelled_task_exits() {
        let server = server();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(server, CleanupConfig::default(), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cleanup task should stop")
            .unwrap();
    }
}
