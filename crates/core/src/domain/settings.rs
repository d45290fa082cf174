use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::AppError;
use super::severity::SeverityThresholds;

/// ジョブ監視設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// 監視開始直後のポーリング間隔（秒）
    pub fast_poll_interval_secs: u64,
    /// fast_phase_secs 経過後のポーリング間隔（秒）
    pub slow_poll_interval_secs: u64,
    /// 高頻度ポーリングを続ける期間（秒）
    pub fast_phase_secs: u64,
    /// 監視の上限（秒）。結果に関係なくここでポーリングを打ち切る
    pub max_watch_secs: u64,
    pub warning_after_secs: u64,
    pub stuck_after_secs: u64,
    pub auto_reset_after_secs: u64,
    /// auto_reset 段階で自動的にリセットするか
    pub auto_reset_enabled: bool,
}

impl MonitorSettings {
    /// 監視開始からの経過時間に応じた次のポーリング間隔
    pub fn poll_interval(&self, watched: Duration) -> Duration {
        if watched < Duration::from_secs(self.fast_phase_secs) {
            Duration::from_secs(self.fast_poll_interval_secs)
        } else {
            Duration::from_secs(self.slow_poll_interval_secs)
        }
    }

    pub fn max_watch(&self) -> Duration {
        Duration::from_secs(self.max_watch_secs)
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        SeverityThresholds {
            warning_after_secs: self.warning_after_secs,
            stuck_after_secs: self.stuck_after_secs,
            auto_reset_after_secs: self.auto_reset_after_secs,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.fast_poll_interval_secs == 0 || self.slow_poll_interval_secs == 0 {
            return Err(AppError::config("ポーリング間隔は1秒以上にしてください"));
        }
        if self.max_watch_secs == 0 {
            return Err(AppError::config("max_watch_secs は1秒以上にしてください"));
        }
        if !(self.warning_after_secs < self.stuck_after_secs
            && self.stuck_after_secs < self.auto_reset_after_secs)
        {
            return Err(AppError::config(format!(
                "閾値は warning < stuck < auto_reset の順である必要があります ({} / {} / {})",
                self.warning_after_secs, self.stuck_after_secs, self.auto_reset_after_secs
            )));
        }
        Ok(())
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let thresholds = SeverityThresholds::default();
        Self {
            fast_poll_interval_secs: 30,
            slow_poll_interval_secs: 60,
            fast_phase_secs: 300,
            max_watch_secs: 900,
            warning_after_secs: thresholds.warning_after_secs,
            stuck_after_secs: thresholds.stuck_after_secs,
            auto_reset_after_secs: thresholds.auto_reset_after_secs,
            auto_reset_enabled: true,
        }
    }
}
