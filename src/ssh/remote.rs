// russh 连接句柄
// 在同一条 SSH 连接上执行命令、按需打开 SFTP 子系统

use async_trait::async_trait;
use russh::client::Handle;
use russh::ChannelMsg;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{ExecOutcome, RemoteChannel};
use super::handler::SshClientHandler;
use crate::error::{BrokerError, Result};
use crate::models::{ReadRange, WriteMode};
use crate::services::sftp::SftpService;
use crate::services::tracker::RecordWriter;

/// 已认证的 SSH 连接
pub struct SshRemote {
    handle: Handle<SshClientHandler>,
    /// user@host:port（用于日志）
    label: String,
    /// SFTP 子系统，首次文件操作时打开
    sftp: OnceCell<SftpService>,
}

impl SshRemote {
    pub fn new(handle: Handle<SshClientHandler>, label: String) -> Self {
        Self {
            handle,
            label,
            sftp: OnceCell::new(),
        }
    }

    async fn sftp(&self) -> Result<&SftpService> {
        self.sftp
            .get_or_try_init(|| SftpService::open(&self.label, &self.handle))
            .await
    }
}

#[async_trait]
impl RemoteChannel for SshRemote {
    async fn exec(
        &self,
        command: &str,
        output: &RecordWriter,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| BrokerError::Unreachable(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| BrokerError::Transfer(format!("Failed to start command: {}", e)))?;

        let mut exit_code = None;
        let mut signal = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                msg = channel.wait() => Some(msg),
            };

            let Some(msg) = next else {
                debug!("[SSH] [{}] Abandoning in-flight command", self.label);
                let _ = channel.close().await;
                return Ok(ExecOutcome::Cancelled);
            };

            match msg {
                Some(ChannelMsg::Data { data }) => output.append_stdout(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 为 stderr
                    if ext == 1 {
                        output.append_stderr(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    signal = Some(format!("{:?}", signal_name));
                }
                // exit-status 可能在 EOF 之后到达，等到 Close 再结束
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        match (exit_code, signal) {
            (Some(code), _) => Ok(ExecOutcome::Exited(code)),
            (None, Some(signal)) => Ok(ExecOutcome::Signaled(signal)),
            (None, None) => Err(BrokerError::Transfer(
                "Channel closed before exit status was received".to_string(),
            )),
        }
    }

    async fn read_file(&self, path: &str, range: ReadRange) -> Result<Vec<u8>> {
        self.sftp().await?.read_file(path, range).await
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        self.sftp().await?.write_file(path, data, mode).await
    }

    async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("[SSH] [{}] Disconnect failed: {}", self.label, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
