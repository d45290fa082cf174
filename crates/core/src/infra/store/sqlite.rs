use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{JobStore, StoreError};
use crate::domain::error::AppError;
use crate::domain::job::{JobRecord, JobStatus};
use crate::domain::settings::MonitorSettings;

/// SQLite ストア（jobs + settings）
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("DB接続に失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory DB作成に失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id         TEXT PRIMARY KEY,
                    status     TEXT NOT NULL DEFAULT 'not_started',
                    output     TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status
                    ON jobs(status);

                CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;
        Ok(())
    }

    // --- Jobs（ランナー側） ---

    pub fn insert_job(&self, record: &JobRecord) -> Result<(), AppError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO jobs (id, status, output, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id,
                    record.status.as_str(),
                    record.output,
                    record.updated_at.to_rfc3339()
                ],
            )
            .map_err(|e| AppError::storage(format!("ジョブ挿入失敗: {e}")))?;
        Ok(())
    }

    /// 新しいジョブを作成（id はストア側で採番）
    pub fn create_job(&self, status: JobStatus, at: DateTime<Utc>) -> Result<JobRecord, AppError> {
        let record = JobRecord::new(uuid::Uuid::new_v4().to_string(), status, at);
        self.insert_job(&record)?;
        Ok(record)
    }

    pub fn update_job(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let affected = self
            .conn
            .lock()
            .execute(
                "UPDATE jobs SET status = ?1, output = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), output, at.to_rfc3339(), id],
            )
            .map_err(|e| AppError::storage(format!("ジョブ更新失敗: {e}")))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("ジョブが見つかりません: {id}")));
        }
        Ok(())
    }

    // --- Settings ---

    pub fn get_settings(&self) -> Result<MonitorSettings, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;

        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;

        if rows.is_empty() {
            return Ok(MonitorSettings::default());
        }

        // key-value をJSONに組み立て、存在するキーだけ既定値に上書きする
        let mut map = serde_json::Map::new();
        for (key, value) in rows {
            let v = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            map.insert(key, v);
        }

        match serde_json::from_value::<MonitorSettings>(serde_json::Value::Object(map)) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("保存済み設定を読めないため既定値を使います: {e}");
                Ok(MonitorSettings::default())
            }
        }
    }

    pub fn save_settings(&self, settings: &MonitorSettings) -> Result<(), AppError> {
        settings.validate()?;
        let json = serde_json::to_value(settings)
            .map_err(|e| AppError::internal(format!("settings serialize: {e}")))?;

        let conn = self.conn.lock();
        if let Some(obj) = json.as_object() {
            for (key, value) in obj {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value.to_string()],
                )
                .map_err(|e| AppError::storage(format!("設定保存失敗: {e}")))?;
            }
        }

        Ok(())
    }
}

fn parse_record(
    id: String,
    status: String,
    output: Option<String>,
    updated_at: String,
) -> Result<JobRecord, StoreError> {
    let status = status.parse::<JobStatus>().map_err(StoreError::Storage)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| StoreError::Storage(format!("updated_at parse: {e}")))?
        .with_timezone(&Utc);
    Ok(JobRecord {
        id,
        status,
        updated_at,
        output,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn read_job(&self, id: &str) -> Result<JobRecord, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, status, output, updated_at FROM jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::Transient(format!("ジョブ読み取り失敗: {e}")))?;

        let (id_col, status, output, updated_at) =
            row.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        parse_record(id_col, status, output, updated_at)
    }

    async fn write_job_reset(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let affected = self
            .conn
            .lock()
            .execute(
                "UPDATE jobs SET status = 'not_started', output = NULL, updated_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .map_err(|e| StoreError::Write(format!("リセット書き込み失敗: {e}")))?;
        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
