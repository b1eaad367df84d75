// 远程通道抽象
//
// Connector 负责建立连接，RemoteChannel 是会话独占的连接句柄：
// - exec: 在已有连接上执行一条命令，输出增量写入执行记录
// - read_file / write_file: 通过会话传输文件
// - close: 释放连接

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::config::TargetDescriptor;
use crate::error::Result;
use crate::models::{ReadRange, WriteMode};
use crate::services::tracker::RecordWriter;

/// 远程命令的结束方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    /// 正常退出
    Exited(i32),
    /// 被信号终止
    Signaled(String),
    /// 会话关闭导致执行被放弃
    Cancelled,
}

/// 会话持有的连接句柄
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// 执行命令；返回 Err 表示传输层故障（会话将被标记为 FAILED）
    async fn exec(
        &self,
        command: &str,
        output: &RecordWriter,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome>;

    /// 按范围读取，实现方应只传输范围内的字节
    async fn read_file(&self, path: &str, range: ReadRange) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// 底层连接是否已断开
    fn is_closed(&self) -> bool;
}

/// 连接建立器
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>>;
}
