use serde::Serialize;

/// アプリケーション共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_TRANSIENT")]
    Transient,
    #[serde(rename = "E_RESET_FAILED")]
    ResetFailed,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_STORAGE")]
    Storage,
    #[serde(rename = "E_CONFIG")]
    Config,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

/// アプリケーションエラー（トースト通知ペイロード兼用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Transient,
            message: msg.into(),
            recoverable: true,
        }
    }

    /// リセット書き込みの失敗。ジョブは stuck のまま残り、手動で再試行できる
    pub fn reset_failed(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ResetFailed,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidState,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Storage,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Config,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: msg.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
