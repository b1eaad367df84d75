// SSH 会话
// 一个已认证的连接 + 生命周期状态 + 执行历史

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::RemoteChannel;
use super::config::TargetDescriptor;
use crate::error::{BrokerError, Result};

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

struct SessionInner {
    state: SessionState,
    /// 只有 OPEN 状态持有连接
    channel: Option<Arc<dyn RemoteChannel>>,
    last_used_at: DateTime<Local>,
    /// 本会话产生的执行记录 ID
    history: Vec<String>,
    failure: Option<String>,
}

/// SSH 会话
pub struct Session {
    id: String,
    target: TargetDescriptor,
    created_at: DateTime<Local>,
    inner: Mutex<SessionInner>,
    /// 命令通道，同一时间只运行一条命令
    lane: Arc<tokio::sync::Mutex<()>>,
    /// 断开时取消正在执行的命令
    cancel: CancellationToken,
}

impl Session {
    /// 创建会话（CONNECTING 状态）
    pub fn new(target: TargetDescriptor) -> Self {
        let now = Local::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                channel: None,
                last_used_at: now,
                history: Vec::new(),
                failure: None,
            }),
            lane: Arc::new(tokio::sync::Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// CONNECTING → OPEN，接管连接
    pub fn open(&self, channel: Arc<dyn RemoteChannel>) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Connecting {
            return false;
        }
        inner.state = SessionState::Open;
        inner.channel = Some(channel);
        inner.last_used_at = Local::now();
        true
    }

    /// 是否为可用的 OPEN 会话
    pub fn is_live(&self) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Open
            && inner.channel.as_ref().is_some_and(|channel| !channel.is_closed())
    }

    /// 获取连接句柄
    /// - CLOSED / CONNECTING: UnknownSession
    /// - FAILED 或底层连接已断开: Unreachable
    pub fn channel(&self) -> Result<Arc<dyn RemoteChannel>> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Open => {}
            SessionState::Failed => {
                return Err(BrokerError::Unreachable(format!(
                    "session {} failed: {}",
                    self.id,
                    inner.failure.as_deref().unwrap_or("connection lost")
                )));
            }
            SessionState::Closed | SessionState::Connecting => {
                return Err(BrokerError::UnknownSession(self.id.clone()));
            }
        }

        match inner.channel.clone() {
            Some(channel) if !channel.is_closed() => Ok(channel),
            _ => {
                warn!("[SSH] Session {} lost its connection", self.id);
                inner.state = SessionState::Failed;
                inner.channel = None;
                inner.failure = Some("connection lost".to_string());
                Err(BrokerError::Unreachable(format!(
                    "session {} lost its connection",
                    self.id
                )))
            }
        }
    }

    pub fn touch(&self) {
        self.lock().last_used_at = Local::now();
    }

    pub fn record_execution(&self, execution_id: &str) {
        let mut inner = self.lock();
        inner.last_used_at = Local::now();
        inner.history.push(execution_id.to_string());
    }

    pub fn lane(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.lane.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// OPEN → FAILED，返回需要释放的连接
    pub fn mark_failed(&self, reason: &str) -> Option<Arc<dyn RemoteChannel>> {
        let mut inner = self.lock();
        if matches!(inner.state, SessionState::Closed | SessionState::Failed) {
            return None;
        }
        inner.state = SessionState::Failed;
        inner.failure = Some(reason.to_string());
        inner.channel.take()
    }

    /// 转为 CLOSED 并取消正在执行的命令
    /// 返回 (是否发生了状态变化, 需要释放的连接)
    pub fn close(&self) -> (bool, Option<Arc<dyn RemoteChannel>>) {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return (false, None);
        }
        self.cancel.cancel();
        inner.state = SessionState::Closed;
        debug!("[SSH] Session {} closed ({} executions)", self.id, inner.history.len());
        (true, inner.channel.take())
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            session_id: self.id.clone(),
            target: self.target.to_string(),
            host: self.target.host().to_string(),
            port: self.target.port(),
            username: self.target.username().to_string(),
            auth: self.target.auth().label(),
            state: inner.state,
            created_at: self.created_at,
            last_used_at: inner.last_used_at,
            executions: inner.history.len(),
            failure: inner.failure.clone(),
        }
    }
}

/// 会话摘要（ssh_list_sessions 返回值）
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub target: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: &'static str,
    pub state: SessionState,
    pub created_at: DateTime<Local>,
    pub last_used_at: DateTime<Local>,
    pub executions: usize,
    pub failure: Option<String>,
}
