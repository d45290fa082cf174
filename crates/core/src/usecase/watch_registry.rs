use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::poller::{PollOutcome, PollerCommand};
use super::recovery::ResetOutcome;
use crate::domain::error::AppError;
use crate::domain::job::JobKind;
use crate::domain::watch::WatchState;

/// 最後の状態を参照できるよう残しておく終了済み監視の上限
const MAX_FINISHED_WATCHES: usize = 64;

/// 起動済みポーラータスクのハンドル一式
pub struct PollerTask {
    pub cancel: CancellationToken,
    pub commands: mpsc::Sender<PollerCommand>,
    pub state: watch::Receiver<WatchState>,
    pub handle: JoinHandle<PollOutcome>,
}

/// 監視レジストリ: ジョブごとのポーラータスクの登録・追跡・キャンセル
pub struct WatchRegistry {
    watches: Arc<Mutex<HashMap<String, WatchEntry>>>,
}

struct WatchEntry {
    kind: JobKind,
    task: PollerTask,
    registered_at: Instant,
}

impl WatchEntry {
    fn is_live(&self) -> bool {
        !self.task.handle.is_finished() && !self.task.cancel.is_cancelled()
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// ポーラータスクを登録する。同じジョブの古い監視はキャンセルして置き換える
    pub async fn register(&self, job_id: String, kind: JobKind, task: PollerTask) {
        let mut watches = self.watches.lock().await;
        Self::insert(&mut watches, job_id, kind, task);
    }

    /// 動作中の監視があればその状態を返し、なければ start で起動して登録する。
    /// 確認と登録は同じロック内で行う
    pub async fn get_or_start<F>(
        &self,
        job_id: &str,
        kind: JobKind,
        start: F,
    ) -> watch::Receiver<WatchState>
    where
        F: FnOnce() -> PollerTask,
    {
        let mut watches = self.watches.lock().await;
        if let Some(entry) = watches.get(job_id).filter(|e| e.is_live()) {
            return entry.task.state.clone();
        }

        let task = start();
        let state = task.state.clone();
        Self::insert(&mut watches, job_id.to_string(), kind, task);
        state
    }

    fn insert(
        watches: &mut HashMap<String, WatchEntry>,
        job_id: String,
        kind: JobKind,
        task: PollerTask,
    ) {
        let entry = WatchEntry {
            kind,
            task,
            registered_at: Instant::now(),
        };
        if let Some(old) = watches.insert(job_id, entry) {
            old.task.cancel.cancel();
        }
        Self::prune_finished(watches);
    }

    /// 終了済み監視が上限を超えたら古いものから捨てる
    fn prune_finished(watches: &mut HashMap<String, WatchEntry>) {
        let mut finished: Vec<(Instant, String)> = watches
            .iter()
            .filter(|(_, e)| e.task.handle.is_finished())
            .map(|(id, e)| (e.registered_at, id.clone()))
            .collect();
        if finished.len() <= MAX_FINISHED_WATCHES {
            return;
        }

        finished.sort();
        let excess = finished.len() - MAX_FINISHED_WATCHES;
        for (_, job_id) in finished.into_iter().take(excess) {
            watches.remove(&job_id);
        }
        log::debug!("終了済み監視を {excess} 件削除");
    }

    /// ポーラーが動作中か
    pub async fn is_watching(&self, job_id: &str) -> bool {
        let watches = self.watches.lock().await;
        watches.get(job_id).is_some_and(WatchEntry::is_live)
    }

    /// 監視状態の購読（終了済みでも最後の状態が読める）
    pub async fn subscribe_state(&self, job_id: &str) -> Option<watch::Receiver<WatchState>> {
        let watches = self.watches.lock().await;
        watches.get(job_id).map(|e| e.task.state.clone())
    }

    /// 現在の監視状態
    pub async fn state(&self, job_id: &str) -> Option<(JobKind, WatchState)> {
        let watches = self.watches.lock().await;
        watches
            .get(job_id)
            .map(|e| (e.kind, e.task.state.borrow().clone()))
    }

    /// 監視をキャンセル（ホスト側のアンマウント）
    pub async fn cancel(&self, job_id: &str) -> bool {
        let watches = self.watches.lock().await;
        match watches.get(job_id) {
            Some(entry) if entry.is_live() => {
                entry.task.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// 全監視をキャンセル
    pub async fn cancel_all(&self) -> Vec<String> {
        let watches = self.watches.lock().await;
        let mut canceled = vec![];

        for (job_id, entry) in watches.iter() {
            if entry.is_live() {
                entry.task.cancel.cancel();
                canceled.push(job_id.clone());
            }
        }

        canceled
    }

    /// 動作中のポーラーに手動リセットを依頼する。ポーラーがいなければ None
    pub async fn request_reset(&self, job_id: &str) -> Option<Result<ResetOutcome, AppError>> {
        let commands = {
            let watches = self.watches.lock().await;
            let entry = watches.get(job_id).filter(|e| e.is_live())?;
            entry.task.commands.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(PollerCommand::ResetNow(reply_tx)).await.is_err() {
            return None;
        }
        // 受け付け後にポーラーが止まった場合は監視外の経路に回さない
        Some(reply_rx.await.unwrap_or_else(|_| {
            Err(AppError::invalid_state(format!(
                "リセット処理前に監視が終了しました: {job_id}"
            )))
        }))
    }

    /// 終了済みの監視を削除（メモリ解放）
    pub async fn cleanup_finished(&self) -> usize {
        let mut watches = self.watches.lock().await;
        let before = watches.len();
        watches.retain(|_, entry| !entry.task.handle.is_finished());
        before - watches.len()
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}
