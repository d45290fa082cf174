use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::context::MonitorContext;
use super::poller::StatusPoller;
use super::recovery::{RecoveryAction, ResetOutcome, ResetTrigger};
use super::watch_registry::{PollerTask, WatchRegistry};
use crate::domain::error::AppError;
use crate::domain::job::{JobKind, JobStatus};
use crate::domain::settings::MonitorSettings;
use crate::domain::status_view::StatusView;
use crate::domain::watch::WatchState;
use crate::infra::clock::Clock;
use crate::infra::events::JobEvent;
use crate::infra::metrics::MetricsSummary;
use crate::infra::store::JobStore;

const COMMAND_BUFFER: usize = 4;

/// ジョブ監視サービス（ホストの状態管理層が1つだけ保持する）
pub struct JobMonitor {
    ctx: MonitorContext,
    registry: WatchRegistry,
    shutdown: CancellationToken,
}

impl JobMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        settings: MonitorSettings,
    ) -> Result<Self, AppError> {
        settings.validate()?;
        Ok(Self {
            ctx: MonitorContext::new(store, clock, settings),
            registry: WatchRegistry::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.ctx.settings
    }

    /// 監視イベントの購読
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.ctx.bus.subscribe()
    }

    // ==================== Watch ====================

    /// ジョブの監視を開始する。
    /// hint が in_progress 以外なら何もせず None。動作中の監視があればそれを共有する
    /// （同時に呼ばれてもポーラーは1つだけ起動する）
    pub async fn watch_job(
        &self,
        job_id: &str,
        kind: JobKind,
        hint: JobStatus,
    ) -> Result<Option<watch::Receiver<WatchState>>, AppError> {
        if job_id.is_empty() {
            return Err(AppError::invalid_state("job_id が空です"));
        }
        if self.shutdown.is_cancelled() {
            return Err(AppError::invalid_state("監視サービスは停止済みです"));
        }
        if hint != JobStatus::InProgress {
            log::debug!("in_progress ではないため監視しません [{job_id}]: {hint}");
            return Ok(None);
        }
        let ctx = self.ctx.clone();
        let cancel = self.shutdown.child_token();
        let state_rx = self
            .registry
            .get_or_start(job_id, kind, move || {
                let (poller, state) = StatusPoller::new(job_id, ctx);
                let (commands, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
                let handle = tokio::spawn(poller.run(cancel.clone(), cmd_rx));
                PollerTask {
                    cancel,
                    commands,
                    state,
                    handle,
                }
            })
            .await;

        Ok(Some(state_rx))
    }

    /// 監視停止（ホスト側のアンマウント）
    pub async fn unwatch(&self, job_id: &str) -> bool {
        self.registry.cancel(job_id).await
    }

    /// 全監視を停止し、以後の watch_job を拒否する
    pub async fn shutdown(&self) -> Vec<String> {
        let canceled = self.registry.cancel_all().await;
        self.shutdown.cancel();
        canceled
    }

    // ==================== Reset ====================

    /// 手動リセット。動作中のポーラーがあればそちらで実行する
    pub async fn reset_job(&self, job_id: &str) -> Result<ResetOutcome, AppError> {
        if let Some(result) = self.registry.request_reset(job_id).await {
            return result;
        }

        // 監視外（上限到達後など）はレコードを直接確認する
        let record = self.ctx.store.read_job(job_id).await?;
        if record.status != JobStatus::InProgress {
            return Err(AppError::invalid_state(format!(
                "{} 状態のジョブはリセットできません",
                record.status
            )));
        }
        let severity = self
            .ctx
            .settings
            .thresholds()
            .classify(record.staleness_secs(self.ctx.clock.now()));
        if !severity.allows_manual_reset() {
            return Err(AppError::invalid_state(format!(
                "{} 段階のジョブはリセットできません",
                severity.as_str()
            )));
        }

        RecoveryAction::new(self.ctx.clone())
            .run(job_id, ResetTrigger::Manual)
            .await
    }

    // ==================== Query ====================

    pub async fn state(&self, job_id: &str) -> Option<WatchState> {
        self.registry.state(job_id).await.map(|(_, state)| state)
    }

    /// 表示モデル
    pub async fn view(&self, job_id: &str) -> Option<StatusView> {
        self.registry
            .state(job_id)
            .await
            .map(|(kind, state)| StatusView::project(kind, &state))
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.ctx.metrics.summary()
    }

    /// 終了済み監視の削除
    pub async fn cleanup_finished(&self) -> usize {
        self.registry.cleanup_finished().await
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::domain::job::JobRecord;
    use crate::infra::clock::TokioClock;
    use crate::infra::store::MemoryJobStore;

    async fn setup() -> (Arc<MemoryJobStore>, Arc<TokioClock>, JobMonitor) {
        let clock = Arc::new(TokioClock::new());
        let store = Arc::new(MemoryJobStore::new());
        store
            .insert(JobRecord::new("j1".to_string(), JobStatus::InProgress, clock.now()))
            .await;
        let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
        (store, clock, monitor)
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = MonitorSettings {
            fast_poll_interval_secs: 0,
            ..Default::default()
        };
        let result = JobMonitor::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(crate::infra::clock::SystemClock),
            settings,
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_running_hint_is_ignored() {
        let (store, _clock, monitor) = setup().await;
        let rx = monitor
            .watch_job("j1", JobKind::Voice, JobStatus::Pending)
            .await
            .unwrap();
        assert!(rx.is_none());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_watch_shares_poller() {
        let (store, _clock, monitor) = setup().await;
        monitor
            .watch_job("j1", JobKind::Voice, JobStatus::InProgress)
            .await
            .unwrap();
        monitor
            .watch_job("j1", JobKind::Voice, JobStatus::InProgress)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        // t=0, 30, 60 の3回だけ（ポーラーは1つ）
        assert_eq!(store.read_count(), 3);
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_watch_starts_one_poller() {
        let (store, _clock, monitor) = setup().await;
        let (a, b) = tokio::join!(
            monitor.watch_job("j1", JobKind::Voice, JobStatus::InProgress),
            monitor.watch_job("j1", JobKind::Voice, JobStatus::InProgress),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(store.read_count(), 3);
        // どちらの購読者も同じ監視を見ている
        assert_eq!(a.borrow().as_str(), "watching");
        assert_eq!(b.borrow().as_str(), "watching");
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_follows_severity() {
        let (_store, _clock, monitor) = setup().await;
        monitor
            .watch_job("j1", JobKind::Video, JobStatus::InProgress)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let view = monitor.view("j1").await.unwrap();
        assert!(!view.can_reset);

        tokio::time::sleep(Duration::from_secs(300)).await;
        let view = monitor.view("j1").await.unwrap();
        assert!(view.can_reset);
        assert_eq!(view.title, "Generation appears stuck");
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_without_poller_checks_record() {
        let (store, _clock, monitor) = setup().await;

        let err = monitor.reset_job("j1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let outcome = monitor.reset_job("j1").await.unwrap();
        assert_eq!(outcome.trigger, ResetTrigger::Manual);
        assert!(store.get("j1").await.unwrap().is_reset());

        // リセット済みジョブへの再リセットは状態エラー
        let err = monitor.reset_job("j1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        let err = monitor.reset_job("missing").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_after_shutdown_is_rejected() {
        let (_store, _clock, monitor) = setup().await;
        monitor.shutdown().await;
        let err = monitor
            .watch_job("j1", JobKind::Image, JobStatus::InProgress)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }
}
