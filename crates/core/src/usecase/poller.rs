//! 1ジョブ分のステータスポーラー。
//!
//! 1つの tokio タスクが1つのジョブを担当し、前のティックの処理が終わってから
//! 次のティックを予約する。停止はすべて `CancellationToken` 経由。

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::MonitorContext;
use super::recovery::{RecoveryAction, ResetOutcome, ResetTrigger};
use crate::domain::error::AppError;
use crate::domain::job::JobStatus;
use crate::domain::severity::{Severity, SeverityThresholds};
use crate::domain::watch::{WatchEvent, WatchState};
use crate::infra::events::JobEvent;

/// ポーラーへの外部コマンド
#[derive(Debug)]
pub enum PollerCommand {
    /// stuck 以上のときだけ受け付ける手動リセット
    ResetNow(oneshot::Sender<Result<ResetOutcome, AppError>>),
}

/// ポーラー終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Completed,
    Failed,
    Reset,
    /// in_progress 以外（not_started / pending）に戻った
    Left,
    Expired,
    Cancelled,
}

pub struct StatusPoller {
    job_id: String,
    ctx: MonitorContext,
    recovery: RecoveryAction,
    thresholds: SeverityThresholds,
    state: WatchState,
    state_tx: watch::Sender<WatchState>,
}

impl StatusPoller {
    pub fn new(job_id: impl Into<String>, ctx: MonitorContext) -> (Self, watch::Receiver<WatchState>) {
        let job_id = job_id.into();
        let state = WatchState::initial(job_id.clone(), JobStatus::InProgress);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let poller = Self {
            recovery: RecoveryAction::new(ctx.clone()),
            thresholds: ctx.settings.thresholds(),
            job_id,
            ctx,
            state,
            state_tx,
        };
        (poller, state_rx)
    }

    /// ポーリングループ本体
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::Receiver<PollerCommand>,
    ) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + self.ctx.settings.max_watch();
        let mut next_tick = started;
        log::info!("監視開始 [{}]", self.job_id);

        loop {
            let wake_at = next_tick.min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                Some(cmd) = commands.recv() => {
                    if self.handle_command(cmd, &cancel).await {
                        return self.cancelled();
                    }
                    if let Some(outcome) = self.finished() {
                        return outcome;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            if wake_at >= deadline {
                return self.expire();
            }

            let watched = next_tick.saturating_duration_since(started);
            let interrupted = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = self.tick(watched) => false,
            };
            if interrupted {
                return self.cancelled();
            }
            if let Some(outcome) = self.finished() {
                return outcome;
            }

            next_tick += self.ctx.settings.poll_interval(watched);
        }
    }

    async fn tick(&mut self, watched: Duration) {
        self.ctx.metrics.inc_polls_issued();
        let start = std::time::Instant::now();
        let record = match self.ctx.store.read_job(&self.job_id).await {
            Ok(record) => record,
            Err(e) => {
                // 再試行はしない。次のティックで読み直す
                log::warn!("ポーリング読み取り失敗、このティックをスキップ [{}]: {e}", self.job_id);
                self.ctx.metrics.inc_read_failures();
                return;
            }
        };
        self.ctx
            .metrics
            .record_latency("read", start.elapsed().as_millis() as u64);

        let prev_severity = self.state.severity();
        let status = record.status;
        self.apply(WatchEvent::Observed {
            record,
            now: self.ctx.clock.now(),
            watched,
        });

        match self.state.clone() {
            WatchState::Watching(s) => {
                self.ctx.bus.emit(JobEvent::Progress {
                    job_id: self.job_id.clone(),
                    elapsed_seconds: s.elapsed_seconds,
                    watched_seconds: s.watched_seconds,
                    severity: s.severity,
                    status,
                });
                self.report_severity(prev_severity.unwrap_or(Severity::Normal), s.severity);

                if s.severity == Severity::AutoReset
                    && self.ctx.settings.auto_reset_enabled
                    && !s.auto_reset_attempted
                {
                    log::warn!(
                        "自動リセット発動 [{}]: {}秒間更新なし",
                        self.job_id,
                        s.elapsed_seconds
                    );
                    // 失敗時はイベント通知済み。手動リセットを待つ
                    let _ = self.reset(ResetTrigger::Automatic).await;
                }
            }
            WatchState::Completed { output, .. } => {
                log::info!("ジョブ完了 [{}]", self.job_id);
                self.ctx.metrics.inc_jobs_completed();
                self.ctx.bus.emit(JobEvent::Completed {
                    job_id: self.job_id.clone(),
                    output,
                });
            }
            WatchState::Failed { .. } => {
                log::info!("ジョブ失敗をランナーが報告 [{}]", self.job_id);
                self.ctx.metrics.inc_jobs_failed();
                self.ctx.bus.emit(JobEvent::Failed {
                    job_id: self.job_id.clone(),
                });
            }
            WatchState::Idle { status, .. } => {
                log::info!("in_progress ではなくなったため監視終了 [{}]: {status}", self.job_id);
            }
            _ => {}
        }
    }

    fn report_severity(&self, from: Severity, to: Severity) {
        if from == to {
            return;
        }
        if to > from {
            log::info!(
                "深刻度が上昇 [{}]: {} -> {}",
                self.job_id,
                from.as_str(),
                to.as_str()
            );
            self.ctx.metrics.inc_severity_escalations();
        }
        self.ctx.bus.emit(JobEvent::SeverityChanged {
            job_id: self.job_id.clone(),
            from,
            to,
        });
    }

    /// コマンド処理。処理中にキャンセルされたら true
    async fn handle_command(&mut self, cmd: PollerCommand, cancel: &CancellationToken) -> bool {
        match cmd {
            PollerCommand::ResetNow(reply) => {
                let allowed = matches!(
                    &self.state,
                    WatchState::Watching(s) if s.severity.allows_manual_reset()
                );
                let (result, interrupted) = if allowed {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => (
                            Err(AppError::invalid_state("リセット中に監視が停止されました")),
                            true,
                        ),
                        result = self.reset(ResetTrigger::Manual) => (result, false),
                    }
                } else {
                    let error = AppError::invalid_state(format!(
                        "{} 状態ではリセットできません",
                        self.state.as_str()
                    ));
                    (Err(error), false)
                };
                if reply.send(result).is_err() {
                    log::debug!("リセット結果の受信側が既に閉じています [{}]", self.job_id);
                }
                interrupted
            }
        }
    }

    async fn reset(&mut self, trigger: ResetTrigger) -> Result<ResetOutcome, AppError> {
        self.apply(WatchEvent::ResetStarted {
            automatic: trigger == ResetTrigger::Automatic,
        });
        match self.recovery.run(&self.job_id, trigger).await {
            Ok(outcome) => {
                self.apply(WatchEvent::ResetFinished {
                    confirmed: outcome.confirmed,
                });
                Ok(outcome)
            }
            Err(e) => {
                self.apply(WatchEvent::ResetFailed(e.clone()));
                Err(e)
            }
        }
    }

    fn apply(&mut self, event: WatchEvent) {
        let next = self.state.clone().reduce(event, &self.thresholds);
        if next.as_str() != self.state.as_str() {
            log::debug!(
                "監視状態遷移 [{}]: {} -> {}",
                self.job_id,
                self.state.as_str(),
                next.as_str()
            );
        }
        self.state = next;
        self.state_tx.send_replace(self.state.clone());
    }

    fn finished(&self) -> Option<PollOutcome> {
        match &self.state {
            WatchState::Completed { .. } => Some(PollOutcome::Completed),
            WatchState::Failed { .. } => Some(PollOutcome::Failed),
            WatchState::Reset { .. } => Some(PollOutcome::Reset),
            WatchState::Expired { .. } => Some(PollOutcome::Expired),
            WatchState::Cancelled { .. } => Some(PollOutcome::Cancelled),
            // 開始時は Awaiting なので Idle は読み取り結果からしか来ない
            WatchState::Idle { .. } => Some(PollOutcome::Left),
            WatchState::Awaiting { .. } | WatchState::Watching(_) | WatchState::Resetting(_) => None,
        }
    }

    fn cancelled(mut self) -> PollOutcome {
        log::info!("監視キャンセル [{}]", self.job_id);
        self.apply(WatchEvent::Cancelled);
        self.ctx.bus.emit(JobEvent::WatchCancelled {
            job_id: self.job_id.clone(),
        });
        PollOutcome::Cancelled
    }

    fn expire(mut self) -> PollOutcome {
        log::info!(
            "監視上限 {}秒に到達、ポーリング停止 [{}]",
            self.ctx.settings.max_watch_secs,
            self.job_id
        );
        self.apply(WatchEvent::CeilingReached);
        self.ctx.metrics.inc_watches_expired();
        self.ctx.bus.emit(JobEvent::WatchExpired {
            job_id: self.job_id.clone(),
        });
        PollOutcome::Expired
    }
}
