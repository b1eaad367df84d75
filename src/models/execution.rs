// 执行记录数据结构

use std::fmt;

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::LOCAL_OWNER;
use crate::error::BrokerError;

/// 执行所有者：本机或某个会话
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Local,
    Session(String),
}

impl Owner {
    /// 解析工具调用中的所有者字符串（"local" 或会话 ID）
    pub fn parse(value: &str) -> Self {
        if value == LOCAL_OWNER {
            Owner::Local
        } else {
            Owner::Session(value.to_string())
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Owner::Local => None,
            Owner::Session(id) => Some(id),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Local => f.write_str(LOCAL_OWNER),
            Owner::Session(id) => f.write_str(id),
        }
    }
}

impl Serialize for Owner {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// 已注册，等待会话空闲
    Pending,
    Running,
    Done,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// 失败类别，决定同步调用方收到的错误类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 通道中断、会话关闭
    Transfer,
    /// 无法打开通道、连接已断开
    Unreachable,
    /// 本地进程无法启动
    Spawn,
    /// 远程进程被信号终止
    Signal,
}

/// 执行失败原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn into_error(self) -> BrokerError {
        match self.kind {
            FailureKind::Transfer | FailureKind::Signal => BrokerError::Transfer(self.reason),
            FailureKind::Unreachable => BrokerError::Unreachable(self.reason),
            FailureKind::Spawn => BrokerError::Spawn(self.reason),
        }
    }
}

/// 执行记录（由 OutputTracker 持有）
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub id: String,
    pub owner: Owner,
    pub command: String,
    pub status: ExecutionStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub failure: Option<Failure>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl ExecutionRecord {
    pub fn new(id: String, owner: Owner, command: String) -> Self {
        Self {
            id,
            owner,
            command,
            status: ExecutionStatus::Pending,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            failure: None,
            started_at: Local::now(),
            finished_at: None,
        }
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id.clone(),
            owner: self.owner.clone(),
            command: self.command.clone(),
            status: self.status,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            exit_code: self.exit_code,
            failure: self.failure.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            owner: self.owner.clone(),
            command: self.command.clone(),
            status: self.status,
            exit_code: self.exit_code,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI regex")
});

/// 去除 ANSI 转义序列
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// 执行记录快照（peek / await 的返回值）
#[derive(Clone, Debug)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub owner: Owner,
    pub command: String,
    pub status: ExecutionStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub failure: Option<Failure>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl ExecutionSnapshot {
    /// 标准输出文本（已去除 ANSI 转义）
    pub fn stdout_text(&self) -> String {
        strip_ansi(&String::from_utf8_lossy(&self.stdout))
    }

    /// 标准错误文本（已去除 ANSI 转义）
    pub fn stderr_text(&self) -> String {
        strip_ansi(&String::from_utf8_lossy(&self.stderr))
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Done && self.exit_code == Some(0)
    }
}

/// 快照的 JSON 形式
#[derive(Serialize)]
struct SnapshotView<'a> {
    id: &'a str,
    owner: &'a Owner,
    command: &'a str,
    status: ExecutionStatus,
    stdout: String,
    stderr: String,
    stdout_bytes: usize,
    stderr_bytes: usize,
    exit_code: Option<i32>,
    failure: Option<&'a Failure>,
    started_at: DateTime<Local>,
    finished_at: Option<DateTime<Local>>,
}

impl Serialize for ExecutionSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SnapshotView {
            id: &self.id,
            owner: &self.owner,
            command: &self.command,
            status: self.status,
            stdout: self.stdout_text(),
            stderr: self.stderr_text(),
            stdout_bytes: self.stdout.len(),
            stderr_bytes: self.stderr.len(),
            exit_code: self.exit_code,
            failure: self.failure.as_ref(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
        .serialize(serializer)
    }
}

/// 执行记录摘要（列表用，不含输出）
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub owner: Owner,
    pub command: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

/// 调度模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Sync,
    Async,
}

/// 调度结果
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Dispatched {
    /// 同步模式：命令已结束
    Completed { record: ExecutionSnapshot },
    /// 异步模式：返回执行 ID，稍后通过 peek 查询
    Started { execution_id: String },
}

impl Dispatched {
    pub fn execution_id(&self) -> &str {
        match self {
            Dispatched::Completed { record } => &record.id,
            Dispatched::Started { execution_id } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_owner_parse() {
        assert_eq!(Owner::parse("local"), Owner::Local);
        assert_eq!(Owner::parse("abc"), Owner::Session("abc".to_string()));
        assert_eq!(Owner::Session("abc".into()).to_string(), "abc");
    }

    #[test]
    fn test_failure_into_error() {
        let err = Failure::new(FailureKind::Unreachable, "channel open failed").into_error();
        assert_eq!(err.kind(), "UnreachableError");
        let err = Failure::new(FailureKind::Transfer, "session closed").into_error();
        assert_eq!(err.kind(), "TransferError");
    }

    #[test]
    fn test_snapshot_serializes_text() {
        let mut record = ExecutionRecord::new("e1".into(), Owner::Local, "echo hi".into());
        record.stdout = b"\x1b[31mhi\x1b[0m\n".to_vec();
        record.status = ExecutionStatus::Done;
        record.exit_code = Some(0);
        let value = serde_json::to_value(record.snapshot()).unwrap();
        assert_eq!(value["stdout"], "hi\n");
        assert_eq!(value["status"], "DONE");
        assert_eq!(value["owner"], "local");
        assert_eq!(value["exit_code"], 0);
    }
}
