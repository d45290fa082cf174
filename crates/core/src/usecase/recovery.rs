use serde::Serialize;

use super::context::MonitorContext;
use crate::domain::error::AppError;
use crate::domain::job::JobRecord;
use crate::infra::events::JobEvent;

/// リセットの起点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetTrigger {
    Automatic,
    Manual,
}

/// リセット結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub job_id: String,
    pub trigger: ResetTrigger,
    /// 診断用のリセット前レコード（読めなかった場合は None）
    pub previous: Option<JobRecord>,
    /// 書き込み後の読み直しで not_started を確認できたか
    pub confirmed: bool,
}

/// 停滞ジョブを not_started に戻す。
/// トランザクションではなくベストエフォートで、何度実行しても同じ結果になる。
pub struct RecoveryAction {
    ctx: MonitorContext,
}

impl RecoveryAction {
    pub fn new(ctx: MonitorContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, job_id: &str, trigger: ResetTrigger) -> Result<ResetOutcome, AppError> {
        let previous = match self.ctx.store.read_job(job_id).await {
            Ok(record) => {
                log::info!(
                    "リセット前の状態 [{job_id}]: status={} updated_at={} output={:?}",
                    record.status,
                    record.updated_at.to_rfc3339(),
                    record.output
                );
                Some(record)
            }
            Err(e) => {
                log::warn!("リセット前の読み取りに失敗 [{job_id}]: {e}");
                None
            }
        };

        let start = std::time::Instant::now();
        if let Err(e) = self
            .ctx
            .store
            .write_job_reset(job_id, self.ctx.clock.now())
            .await
        {
            log::error!("リセット書き込み失敗 [{job_id}]: {e}");
            self.ctx.metrics.inc_reset_failures();
            let error = AppError::reset_failed(format!("ジョブをリセットできませんでした: {e}"));
            self.ctx.bus.emit(JobEvent::ResetFailed {
                job_id: job_id.to_string(),
                error: error.clone(),
            });
            return Err(error);
        }
        self.ctx
            .metrics
            .record_latency("reset", start.elapsed().as_millis() as u64);
        self.ctx.metrics.inc_resets(trigger == ResetTrigger::Automatic);

        let confirmed = match self.ctx.store.read_job(job_id).await {
            Ok(record) if record.is_reset() => true,
            Ok(record) => {
                log::warn!(
                    "リセット確認不一致 [{job_id}]: status={} output={:?}",
                    record.status,
                    record.output
                );
                false
            }
            Err(e) => {
                log::warn!("リセット確認の読み取りに失敗 [{job_id}]: {e}");
                false
            }
        };
        if !confirmed {
            self.ctx.metrics.inc_confirm_mismatches();
        }

        // 不一致でも再読み込みはする（ホスト側が最新値を取り直す）
        self.ctx.bus.emit(JobEvent::ReloadRequested {
            job_id: job_id.to_string(),
            confirmed,
        });

        Ok(ResetOutcome {
            job_id: job_id.to_string(),
            trigger,
            previous,
            confirmed,
        })
    }
}
