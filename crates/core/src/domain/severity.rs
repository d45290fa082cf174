//! 停滞ジョブ検出器。
//!
//! 最終更新からの経過秒数だけを入力に取る純関数で、副作用を持たない。

use serde::{Deserialize, Serialize};

/// 停滞の深刻度（宣言順に深刻になる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Stuck,
    AutoReset,
}

impl Severity {
    /// 既定の閾値（3分 / 5分 / 10分）で分類する
    pub fn classify(elapsed_secs: u64) -> Self {
        SeverityThresholds::default().classify(elapsed_secs)
    }

    /// 手動リセットを提示してよい段階か
    pub fn allows_manual_reset(&self) -> bool {
        matches!(self, Self::Stuck | Self::AutoReset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Stuck => "stuck",
            Self::AutoReset => "auto_reset",
        }
    }
}

/// 深刻度の閾値（秒、いずれも下限を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityThresholds {
    pub warning_after_secs: u64,
    pub stuck_after_secs: u64,
    pub auto_reset_after_secs: u64,
}

impl SeverityThresholds {
    pub fn classify(&self, elapsed_secs: u64) -> Severity {
        if elapsed_secs >= self.auto_reset_after_secs {
            Severity::AutoReset
        } else if elapsed_secs >= self.stuck_after_secs {
            Severity::Stuck
        } else if elapsed_secs >= self.warning_after_secs {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            warning_after_secs: 180,
            stuck_after_secs: 300,
            auto_reset_after_secs: 600,
        }
    }
}
