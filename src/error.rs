// 代理错误类型定义

use std::time::Duration;

use thiserror::Error;

/// 代理统一结果类型
pub type Result<T> = std::result::Result<T, BrokerError>;

/// 代理错误类型
#[derive(Debug, Error)]
pub enum BrokerError {
    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 网络不可达或连接超时
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// 会话不存在或已关闭
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// 同一目标已有打开的会话
    #[error("Already connected (session {session_id})")]
    AlreadyConnected { session_id: String },

    /// 会话正在执行其他命令
    #[error("Session {0} is busy with another command")]
    SessionBusy(String),

    /// 命令被安全过滤器拒绝
    #[error("Command rejected: {reason}")]
    UnsafeCommand { command: String, reason: String },

    /// 执行记录不存在（从未注册或已被清理）
    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    /// 等待超时（执行记录仍可查询）
    #[error("Timed out after {timeout:?} waiting for execution {execution_id}")]
    Timeout {
        execution_id: String,
        timeout: Duration,
    },

    /// 文件不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 权限不足
    #[error("Permission denied: {0}")]
    Permission(String),

    /// 传输失败（通道中断、写入不完整等）
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 本地进程启动失败
    #[error("Failed to spawn local command: {0}")]
    Spawn(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// 将路径相关的 IO 错误映射为 NotFound / Permission / Transfer
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BrokerError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => BrokerError::Permission(path.to_string()),
            _ => BrokerError::Transfer(format!("{}: {}", path, err)),
        }
    }

    /// 错误类别名称（用于工具调用响应）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AuthError",
            Self::Unreachable(_) => "UnreachableError",
            Self::UnknownSession(_) => "UnknownSessionError",
            Self::AlreadyConnected { .. } => "AlreadyConnectedError",
            Self::SessionBusy(_) => "SessionBusyError",
            Self::UnsafeCommand { .. } => "UnsafeCommandError",
            Self::UnknownExecution(_) => "UnknownExecutionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::NotFound(_) => "NotFoundError",
            Self::Permission(_) => "PermissionError",
            Self::Transfer(_) => "TransferError",
            Self::Config(_) => "ConfigError",
            Self::Spawn(_) => "SpawnError",
            Self::Io(_) => "IoError",
        }
    }
}

impl From<russh::Error> for BrokerError {
    fn from(e: russh::Error) -> Self {
        BrokerError::Transfer(e.to_string())
    }
}

impl From<russh::keys::Error> for BrokerError {
    fn from(e: russh::keys::Error) -> Self {
        BrokerError::Config(format!("Invalid key material: {}", e))
    }
}

impl From<russh_sftp::client::error::Error> for BrokerError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as SftpError;
        use russh_sftp::protocol::StatusCode;

        match e {
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => BrokerError::NotFound(status.error_message),
                StatusCode::PermissionDenied => BrokerError::Permission(status.error_message),
                _ => BrokerError::Transfer(status.error_message),
            },
            other => BrokerError::Transfer(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_maps_kinds() {
        let err = BrokerError::from_io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, BrokerError::NotFound(ref p) if p == "/tmp/x"));

        let err = BrokerError::from_io(
            "/root",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, BrokerError::Permission(_)));

        let err = BrokerError::from_io("/x", std::io::Error::other("broken pipe"));
        assert_eq!(err.kind(), "TransferError");
    }
}
