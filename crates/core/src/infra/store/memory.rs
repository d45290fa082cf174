use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{JobStore, StoreError};
use crate::domain::job::{JobRecord, JobStatus};

/// インメモリのジョブストア。
/// ランナー側の更新ヘルパーと障害注入を持ち、ホストのプレビューやテストで使う。
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    failing_reads: AtomicUsize,
    rejecting_writes: AtomicBool,
    dropping_writes: AtomicBool,
    reads: AtomicUsize,
    resets: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            failing_reads: AtomicUsize::new(0),
            rejecting_writes: AtomicBool::new(false),
            dropping_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    pub async fn insert(&self, record: JobRecord) {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(record.id.clone(), record);
    }

    /// 新しいジョブを作成（id はストア側で採番）
    pub async fn create_job(&self, status: JobStatus, at: DateTime<Utc>) -> JobRecord {
        let record = JobRecord::new(uuid::Uuid::new_v4().to_string(), status, at);
        self.insert(record.clone()).await;
        record
    }

    /// ランナー側の状態更新
    pub async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.status = status;
        record.output = output;
        record.updated_at = at;
        Ok(())
    }

    /// ランナー側の進捗通知（updated_at だけ進める）
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.updated_at = at;
        Ok(())
    }

    /// カウンタや障害注入を通さずに現在値を覗く
    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).cloned()
    }

    /// 次の n 回の読み取りを Transient で失敗させる
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.rejecting_writes.store(reject, Ordering::SeqCst);
    }

    /// 書き込みを成功扱いにして反映しない（結果整合なバックエンドの再現）
    pub fn drop_writes(&self, drop: bool) {
        self.dropping_writes.store(drop, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn read_job(&self, id: &str) -> Result<JobRecord, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected read failure".to_string()));
        }

        let jobs = self.jobs.lock().await;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn write_job_reset(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.resets.fetch_add(1, Ordering::SeqCst);

        if self.rejecting_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write(format!("reset of {id} rejected")));
        }

        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if self.dropping_writes.load(Ordering::SeqCst) {
            return Ok(());
        }

        record.status = JobStatus::NotStarted;
        record.output = None;
        record.updated_at = at;
        Ok(())
    }
}
