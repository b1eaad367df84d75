// 执行记录追踪
//
// OutputTracker 持有所有 ExecutionRecord：
// - 表锁只在插入 / 查找 / 清理时短暂持有
// - 输出追加只锁对应的单条记录
// - 状态变化通过 watch 通道通知等待方

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BrokerError, Result};
use crate::models::settings::TrackerSettings;
use crate::models::{
    ExecutionRecord, ExecutionSnapshot, ExecutionStatus, ExecutionSummary, Failure, Owner,
};

/// 单条记录及其状态通知
struct TrackedExecution {
    record: Mutex<ExecutionRecord>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl TrackedExecution {
    fn lock(&self) -> MutexGuard<'_, ExecutionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ExecutionSnapshot {
        self.lock().snapshot()
    }
}

/// 执行记录写入端（交给执行器）
/// 记录进入 DONE / ERROR 后所有写入都会被忽略
#[derive(Clone)]
pub struct RecordWriter {
    id: String,
    entry: Arc<TrackedExecution>,
}

impl RecordWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.entry.lock().status
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.entry.snapshot()
    }

    /// PENDING → RUNNING，记录已结束时返回 false
    pub fn mark_running(&self) -> bool {
        let mut record = self.entry.lock();
        match record.status {
            ExecutionStatus::Pending => {
                record.status = ExecutionStatus::Running;
                self.entry.status_tx.send_replace(ExecutionStatus::Running);
                true
            }
            ExecutionStatus::Running => true,
            _ => false,
        }
    }

    pub fn append_stdout(&self, data: &[u8]) {
        let mut record = self.entry.lock();
        if !record.status.is_terminal() {
            record.stdout.extend_from_slice(data);
        }
    }

    pub fn append_stderr(&self, data: &[u8]) {
        let mut record = self.entry.lock();
        if !record.status.is_terminal() {
            record.stderr.extend_from_slice(data);
        }
    }

    /// 正常结束（DONE + 退出码）
    pub fn finish(&self, exit_code: i32) -> bool {
        self.complete(ExecutionStatus::Done, Some(exit_code), None)
    }

    /// 失败结束（ERROR，无退出码）
    pub fn fail(&self, failure: Failure) -> bool {
        self.complete(ExecutionStatus::Error, None, Some(failure))
    }

    fn complete(
        &self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        failure: Option<Failure>,
    ) -> bool {
        let mut record = self.entry.lock();
        if record.status.is_terminal() {
            return false;
        }
        record.status = status;
        record.exit_code = exit_code;
        record.failure = failure;
        record.finished_at = Some(Local::now());
        self.entry.status_tx.send_replace(status);
        true
    }
}

/// 执行记录追踪器
pub struct OutputTracker {
    records: RwLock<HashMap<String, Arc<TrackedExecution>>>,
    /// 已结束记录的保留时间
    retention: Duration,
}

impl OutputTracker {
    pub fn new(settings: &TrackerSettings) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention: Duration::from_secs(settings.retention_secs),
        }
    }

    /// 注册新的执行记录（状态 PENDING）
    pub fn register(&self, owner: Owner, command: &str) -> RecordWriter {
        let id = uuid::Uuid::new_v4().to_string();
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        let entry = Arc::new(TrackedExecution {
            record: Mutex::new(ExecutionRecord::new(id.clone(), owner, command.to_string())),
            status_tx,
        });

        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), entry.clone());

        debug!("[Tracker] Registered execution {}", id);
        RecordWriter { id, entry }
    }

    fn entry(&self, execution_id: &str) -> Result<Arc<TrackedExecution>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownExecution(execution_id.to_string()))
    }

    /// 获取当前快照（不阻塞）
    pub fn peek(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        Ok(self.entry(execution_id)?.snapshot())
    }

    /// 等待记录结束（DONE / ERROR），None 表示不限时
    pub async fn wait_for(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionSnapshot> {
        let entry = self.entry(execution_id)?;
        let mut status_rx = entry.status_tx.subscribe();
        let finished = status_rx.wait_for(|status| status.is_terminal());

        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, finished).await.is_err() {
                    return Err(BrokerError::Timeout {
                        execution_id: execution_id.to_string(),
                        timeout: limit,
                    });
                }
            }
            None => {
                // Sender 与 entry 同生命周期，不会提前关闭
                let _ = finished.await.map(|_| ());
            }
        }

        Ok(entry.snapshot())
    }

    /// 将某个所有者所有未结束的记录标记为 ERROR
    pub fn fail_owned(&self, owner: &Owner, failure: Failure) -> usize {
        let entries: Vec<Arc<TrackedExecution>> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut failed = 0;
        for entry in entries {
            let writer = {
                let record = entry.lock();
                if record.owner != *owner || record.status.is_terminal() {
                    continue;
                }
                RecordWriter {
                    id: record.id.clone(),
                    entry: entry.clone(),
                }
            };
            if writer.fail(failure.clone()) {
                failed += 1;
            }
        }

        if failed > 0 {
            info!(
                "[Tracker] Marked {} execution(s) of {} as ERROR: {}",
                failed, owner, failure.reason
            );
        }
        failed
    }

    /// 清理超过保留时间的已结束记录
    pub fn purge_expired(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        match Local::now().checked_sub_signed(retention) {
            Some(cutoff) => self.purge_finished_before(cutoff),
            None => 0,
        }
    }

    /// 清理在 cutoff 之前结束的记录；未结束的记录不会被清理
    pub fn purge_finished_before(&self, cutoff: DateTime<Local>) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, entry| {
            let record = entry.lock();
            !matches!(record.finished_at, Some(finished) if finished <= cutoff)
        });
        let purged = before - records.len();
        if purged > 0 {
            debug!("[Tracker] Purged {} expired execution(s)", purged);
        }
        purged
    }

    /// 列出记录摘要（按开始时间排序）
    pub fn list(&self, owner: Option<&Owner>) -> Vec<ExecutionSummary> {
        let entries: Vec<Arc<TrackedExecution>> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut summaries: Vec<ExecutionSummary> = entries
            .iter()
            .map(|entry| entry.lock().summary())
            .filter(|summary| owner.map_or(true, |o| summary.owner == *o))
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动后台清理任务，cancel 触发后退出
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            info!("[Tracker] GC started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.purge_expired();
            }
            info!("[Tracker] GC stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    fn tracker(retention_secs: u64) -> OutputTracker {
        OutputTracker::new(&TrackerSettings {
            retention_secs,
            gc_interval_secs: 0,
        })
    }

    #[test]
    fn test_peek_unknown_execution() {
        let tracker = tracker(60);
        let err = tracker.peek("missing").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExecution(ref id) if id == "missing"));
    }

    #[test]
    fn test_lifecycle_and_immutability() {
        let tracker = tracker(60);
        let writer = tracker.register(Owner::Local, "echo hi");
        assert_eq!(tracker.peek(writer.id()).unwrap().status, ExecutionStatus::Pending);

        assert!(writer.mark_running());
        writer.append_stdout(b"hi");
        let snapshot = tracker.peek(writer.id()).unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert_eq!(snapshot.stdout, b"hi");

        assert!(writer.finish(0));
        // 结束后的写入全部忽略
        writer.append_stdout(b" more");
        assert!(!writer.fail(Failure::new(FailureKind::Transfer, "late")));
        assert!(!writer.mark_running());

        let snapshot = tracker.peek(writer.id()).unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Done);
        assert_eq!(snapshot.exit_code, Some(0));
        assert_eq!(snapshot.stdout, b"hi");
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let tracker = Arc::new(tracker(60));
        let writer = tracker.register(Owner::Local, "sleep");
        writer.mark_running();

        let finisher = writer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finisher.append_stdout(b"done\n");
            finisher.finish(3);
        });

        let snapshot = tracker
            .wait_for(writer.id(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Done);
        assert_eq!(snapshot.exit_code, Some(3));
        assert_eq!(snapshot.stdout_text(), "done\n");
    }

    #[tokio::test]
    async fn test_wait_for_timeout_leaves_running() {
        let tracker = tracker(60);
        let writer = tracker.register(Owner::Local, "sleep 100");
        writer.mark_running();

        let err = tracker
            .wait_for(writer.id(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { ref execution_id, .. } if execution_id == writer.id()));
        assert_eq!(tracker.peek(writer.id()).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_fail_owned_only_touches_owner() {
        let tracker = tracker(60);
        let owner = Owner::Session("s1".into());
        let running = tracker.register(owner.clone(), "sleep 10");
        running.mark_running();
        let queued = tracker.register(owner.clone(), "uptime");
        let done = tracker.register(owner.clone(), "true");
        done.finish(0);
        let other = tracker.register(Owner::Session("s2".into()), "sleep 10");
        other.mark_running();

        let failed = tracker.fail_owned(&owner, Failure::new(FailureKind::Transfer, "session closed"));
        assert_eq!(failed, 2);

        let snapshot = tracker.peek(running.id()).unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Error);
        assert_eq!(snapshot.failure.unwrap().reason, "session closed");
        assert_eq!(tracker.peek(queued.id()).unwrap().status, ExecutionStatus::Error);
        assert_eq!(tracker.peek(done.id()).unwrap().status, ExecutionStatus::Done);
        assert_eq!(tracker.peek(other.id()).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_purge_expired_keeps_unfinished() {
        let tracker = tracker(0);
        let finished = tracker.register(Owner::Local, "true");
        finished.finish(0);
        let running = tracker.register(Owner::Local, "sleep 10");
        running.mark_running();

        assert_eq!(tracker.purge_expired(), 1);
        assert!(matches!(
            tracker.peek(finished.id()),
            Err(BrokerError::UnknownExecution(_))
        ));
        assert!(tracker.peek(running.id()).is_ok());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_purge_respects_retention() {
        let tracker = tracker(3600);
        let finished = tracker.register(Owner::Local, "true");
        finished.finish(0);
        assert_eq!(tracker.purge_expired(), 0);
        assert!(tracker.peek(finished.id()).is_ok());
    }

    #[test]
    fn test_list_filters_by_owner() {
        let tracker = tracker(60);
        tracker.register(Owner::Local, "a");
        tracker.register(Owner::Session("s1".into()), "b");
        tracker.register(Owner::Local, "c");

        assert_eq!(tracker.list(None).len(), 3);
        let local: Vec<_> = tracker
            .list(Some(&Owner::Local))
            .into_iter()
            .map(|s| s.command)
            .collect();
        assert_eq!(local.len(), 2);
        assert!(local.contains(&"a".to_string()));
        assert!(local.contains(&"c".to_string()));
    }
}
