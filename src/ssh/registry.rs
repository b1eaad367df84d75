// 会话注册表
//
// 负责会话的创建、查找与销毁：
// - 同一目标 (host, port, username) 的连接按目标串行，不同目标互不阻塞
// - 已有 OPEN 会话时直接返回已有 ID
// - 断开会话时取消正在执行的命令，并把未结束的执行记录标记为 ERROR
// - 已关闭的会话移出表，只保留最近的 ID 用于重复断开

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::channel::Connector;
use super::config::{TargetDescriptor, TargetKey};
use super::session::{Session, SessionInfo, SessionState};
use crate::error::{BrokerError, Result};
use crate::models::{Failure, FailureKind, Owner};
use crate::services::tracker::OutputTracker;

/// 会话关闭时写入执行记录的原因
pub const SESSION_CLOSED: &str = "session closed";

/// 记住的已关闭会话 ID 数量
const CLOSED_ID_CAPACITY: usize = 1024;

/// 最近关闭的会话 ID（超出容量时淘汰最早的）
struct ClosedIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ClosedIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// 会话注册表
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    tracker: Arc<OutputTracker>,
    /// OPEN 与 FAILED 会话；FAILED 会话在断开或同目标重连时移除
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    closed: Mutex<ClosedIds>,
    /// 每个目标一把连接锁，无人使用时移除
    target_locks: Mutex<HashMap<TargetKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, tracker: Arc<OutputTracker>) -> Self {
        Self {
            connector,
            tracker,
            sessions: RwLock::new(HashMap::new()),
            closed: Mutex::new(ClosedIds::new(CLOSED_ID_CAPACITY)),
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    fn target_lock(&self, key: TargetKey) -> Arc<tokio::sync::Mutex<()>> {
        self.target_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    /// 没有其他连接在等待时移除目标锁
    fn release_target_lock(&self, key: &TargetKey, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.target_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 表里一份，调用方一份
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// 建立连接并返回会话 ID
    /// 目标已有 OPEN 会话时返回已有 ID
    pub async fn connect(&self, target: TargetDescriptor) -> Result<String> {
        let key = target.key();
        let lock = self.target_lock(key.clone());
        let result = {
            let _guard = lock.lock().await;
            self.connect_locked(target).await
        };
        self.release_target_lock(&key, &lock);
        result
    }

    async fn connect_locked(&self, target: TargetDescriptor) -> Result<String> {
        let session = match self.reserve(&target) {
            Ok(session) => session,
            Err(BrokerError::AlreadyConnected { session_id }) => {
                info!("[Registry] Reusing session {} for {}", session_id, target);
                return Ok(session_id);
            }
            Err(e) => return Err(e),
        };

        info!(
            "[Registry] Connecting to {} ({})",
            target,
            target.auth().label()
        );
        let channel = match self.connector.connect(&target).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("[Registry] Failed to connect to {}: {}", target, e);
                return Err(e);
            }
        };

        session.open(Arc::from(channel));
        let session_id = session.id().to_string();
        let replaced: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<String> = sessions
                .values()
                .filter(|s| s.target() == &target && s.state() == SessionState::Failed)
                .map(|s| s.id().to_string())
                .collect();
            sessions.insert(session_id.clone(), session);
            stale.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for stale in replaced {
            debug!("[Registry] Dropping failed session {} replaced by {}", stale.id(), session_id);
            stale.close();
            self.remember_closed(stale.id());
        }

        info!("[Registry] Session {} opened for {}", session_id, target);
        Ok(session_id)
    }

    /// 为目标预留新会话（CONNECTING）
    /// 已有可用会话时返回 AlreadyConnected
    fn reserve(&self, target: &TargetDescriptor) -> Result<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let existing = sessions
            .values()
            .find(|session| session.target() == target && session.is_live());
        if let Some(session) = existing {
            return Err(BrokerError::AlreadyConnected {
                session_id: session.id().to_string(),
            });
        }
        Ok(Arc::new(Session::new(target.clone())))
    }

    /// 查找会话；不存在或已关闭时返回 UnknownSession，FAILED 会话照常返回
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = self.lookup(session_id)?;
        if session.state() == SessionState::Closed {
            return Err(BrokerError::UnknownSession(session_id.to_string()));
        }
        Ok(session)
    }

    fn remember_closed(&self, session_id: &str) {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
    }

    fn is_closed_id(&self, session_id: &str) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))
    }

    /// 断开会话；已关闭的会话再次断开不做任何事
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        let session = match self.lookup(session_id) {
            Ok(session) => session,
            Err(_) if self.is_closed_id(session_id) => {
                debug!("[Registry] Session {} already closed", session_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let (changed, channel) = session.close();
        if !changed {
            debug!("[Registry] Session {} already closed", session_id);
            return Ok(());
        }
        // 先记录 ID 再移出表，并发的重复断开总能看到其中之一
        self.remember_closed(session_id);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        self.tracker.fail_owned(
            &Owner::Session(session_id.to_string()),
            Failure::new(FailureKind::Transfer, SESSION_CLOSED),
        );

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("[Registry] Error closing session {}: {}", session_id, e);
            }
        }

        info!("[Registry] Session {} disconnected", session_id);
        Ok(())
    }

    /// 传输层故障：会话转为 FAILED 并释放连接，不重试
    pub async fn mark_failed(&self, session_id: &str, reason: &str) -> Result<()> {
        let session = self.lookup(session_id)?;
        let Some(channel) = session.mark_failed(reason) else {
            return Ok(());
        };
        warn!("[Registry] Session {} failed: {}", session_id, reason);
        if let Err(e) = channel.close().await {
            debug!("[Registry] Error releasing failed session {}: {}", session_id, e);
        }
        Ok(())
    }

    /// 未关闭的会话列表（按创建时间排序）
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|session| session.state() != SessionState::Closed)
            .map(|session| session.info())
            .collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    /// 断开所有会话（退出时调用）
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|session| session.state() != SessionState::Closed)
            .map(|session| session.id().to_string())
            .collect();
        if ids.is_empty() {
            return;
        }

        info!("[Registry] Disconnecting {} session(s)", ids.len());
        let results = futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("[Registry] Failed to disconnect {}: {}", id, e);
            }
        }
    }
}
