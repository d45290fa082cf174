mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::AppError;
use crate::domain::job::JobRecord;

/// ストアエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Transient store failure: {0}")]
    Transient(String),
    #[error("Write rejected: {0}")]
    Write(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(_) => AppError::not_found(err.to_string()),
            StoreError::Transient(_) => AppError::transient(err.to_string()),
            StoreError::Write(_) => AppError::reset_failed(err.to_string()),
            StoreError::Storage(_) => AppError::storage(err.to_string()),
        }
    }
}

/// ジョブレコードのリモートストア trait。
/// レコードの所有者は外部ランナーで、こちらはロックなしの読み書きクライアント。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 未知の id は NotFound、通信失敗は Transient
    async fn read_job(&self, id: &str) -> Result<JobRecord, StoreError>;

    /// status を not_started に戻し output を消し、updated_at を `at` にする。
    /// 既にリセット済みでも同じ結果になる（冪等）
    async fn write_job_reset(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}
