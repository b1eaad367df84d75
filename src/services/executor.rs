// 命令调度
//
// dispatch 流程：
// 1. 安全过滤（拒绝时不创建执行记录）
// 2. 注册执行记录；能立即执行的在返回前进入 RUNNING，排队的保持 PENDING
// 3. 后台任务执行命令：本地进程或会话已有的连接
// 4. SYNC 模式等待记录结束；ASYNC 模式立即返回执行 ID

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::local::LocalRunner;
use super::safety::SafetyFilter;
use super::shell::with_env_prefix;
use super::tracker::{OutputTracker, RecordWriter};
use crate::error::{BrokerError, Result};
use crate::models::settings::BrokerSettings;
use crate::models::{BusyPolicy, DispatchMode, Dispatched, ExecutionStatus, Failure, FailureKind, Owner};
use crate::ssh::registry::{SessionRegistry, SESSION_CLOSED};
use crate::ssh::session::Session;
use crate::ssh::ExecOutcome;

/// 命令调度器
pub struct CommandExecutor {
    registry: Arc<SessionRegistry>,
    tracker: Arc<OutputTracker>,
    safety: SafetyFilter,
    local: LocalRunner,
    /// 远程命令的环境变量前缀
    env: Vec<(String, String)>,
    busy_policy: BusyPolicy,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        tracker: Arc<OutputTracker>,
        settings: &BrokerSettings,
    ) -> Self {
        Self {
            registry,
            tracker,
            safety: SafetyFilter::new(&settings.safety),
            local: LocalRunner::new(&settings.execution),
            env: settings.execution.non_interactive_env.clone(),
            busy_policy: settings.execution.busy_policy,
        }
    }

    /// 调度一条命令
    /// timeout 只对 SYNC 生效，None 表示一直等待
    pub async fn dispatch(
        &self,
        owner: Owner,
        command: &str,
        mode: DispatchMode,
        timeout: Option<Duration>,
    ) -> Result<Dispatched> {
        let command = command.trim();
        if command.is_empty() {
            return Err(BrokerError::Config("command must not be empty".to_string()));
        }
        self.safety.check(command)?;

        let writer = match &owner {
            Owner::Local => self.start_local(command),
            Owner::Session(session_id) => self.start_remote(session_id, command)?,
        };
        info!(
            "[Exec] Dispatched {} on {} ({:?}): {}",
            writer.id(),
            owner,
            mode,
            command
        );

        match mode {
            DispatchMode::Async => Ok(Dispatched::Started {
                execution_id: writer.id().to_string(),
            }),
            DispatchMode::Sync => {
                let record = self.tracker.wait_for(writer.id(), timeout).await?;
                if record.status == ExecutionStatus::Error {
                    if let Some(failure) = record.failure {
                        return Err(failure.into_error());
                    }
                }
                Ok(Dispatched::Completed { record })
            }
        }
    }

    fn start_local(&self, command: &str) -> RecordWriter {
        let writer = self.tracker.register(Owner::Local, command);
        let runner = self.local.clone();
        let command = command.to_string();
        let task_writer = writer.clone();
        writer.mark_running();

        tokio::spawn(async move {
            let result = runner.run(&command, &task_writer).await;
            settle(&task_writer, result);
        });

        writer
    }

    fn start_remote(&self, session_id: &str, command: &str) -> Result<RecordWriter> {
        let session = self.registry.get(session_id)?;
        session.channel()?;

        let lane = session.lane();
        // 会话空闲时直接占用命令通道，保证顺序
        let permit = match lane.clone().try_lock_owned() {
            Ok(permit) => Some(permit),
            Err(_) if self.busy_policy == BusyPolicy::Reject => {
                return Err(BrokerError::SessionBusy(session_id.to_string()));
            }
            Err(_) => {
                debug!("[Exec] Session {} busy, queueing command", session_id);
                None
            }
        };

        let writer = self
            .tracker
            .register(Owner::Session(session_id.to_string()), command);
        session.record_execution(writer.id());
        if permit.is_some() {
            writer.mark_running();
        }

        tokio::spawn(run_remote(
            self.registry.clone(),
            session,
            permit,
            with_env_prefix(&self.env, command),
            writer.clone(),
        ));

        Ok(writer)
    }
}

/// 在会话连接上执行命令（后台任务）
async fn run_remote(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    permit: Option<OwnedMutexGuard<()>>,
    command: String,
    writer: RecordWriter,
) {
    let cancel = session.cancel_token();
    let _permit = match permit {
        Some(permit) => permit,
        None => {
            let lane = session.lane();
            tokio::select! {
                _ = cancel.cancelled() => {
                    writer.fail(Failure::new(FailureKind::Transfer, SESSION_CLOSED));
                    return;
                }
                permit = lane.lock_owned() => permit,
            }
        }
    };

    // 排队期间会话可能已关闭或失败
    let channel = match session.channel() {
        Ok(channel) => channel,
        Err(e) => {
            writer.fail(failure_from(&e));
            return;
        }
    };
    if !writer.mark_running() {
        return;
    }
    session.touch();

    let result = channel.exec(&command, &writer, &cancel).await;
    if let Err(e) = &result {
        warn!("[Exec] Transport failure on session {}: {}", session.id(), e);
        if let Err(err) = registry.mark_failed(session.id(), &e.to_string()).await {
            debug!("[Exec] Could not mark session {} failed: {}", session.id(), err);
        }
    }
    settle(&writer, result);
}

/// 根据执行结果写入最终状态
fn settle(writer: &RecordWriter, result: Result<ExecOutcome>) {
    match result {
        Ok(ExecOutcome::Exited(code)) => {
            writer.finish(code);
            debug!("[Exec] {} exited with {}", writer.id(), code);
        }
        Ok(ExecOutcome::Signaled(signal)) => {
            writer.fail(Failure::new(
                FailureKind::Signal,
                format!("terminated by signal {}", signal),
            ));
        }
        Ok(ExecOutcome::Cancelled) => {
            writer.fail(Failure::new(FailureKind::Transfer, SESSION_CLOSED));
        }
        Err(e) => {
            writer.fail(failure_from(&e));
        }
    }
}

fn failure_from(err: &BrokerError) -> Failure {
    match err {
        BrokerError::UnknownSession(_) => Failure::new(FailureKind::Transfer, SESSION_CLOSED),
        BrokerError::Transfer(reason) => Failure::new(FailureKind::Transfer, reason.clone()),
        BrokerError::Unreachable(reason) => Failure::new(FailureKind::Unreachable, reason.clone()),
        BrokerError::Spawn(reason) => Failure::new(FailureKind::Spawn, reason.clone()),
        other => Failure::new(FailureKind::Transfer, other.to_string()),
    }
}
