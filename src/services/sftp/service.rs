// SFTP 服务 - 封装 russh-sftp 客户端

use std::io::SeekFrom;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{BrokerError, Result};
use crate::models::{ReadRange, WriteMode};
use crate::ssh::handler::SshClientHandler;

/// SFTP 服务
/// 每个会话最多一个，复用会话已有的 SSH 连接
pub struct SftpService {
    /// user@host:port（用于日志）
    label: String,
    sftp: SftpSession,
}

impl SftpService {
    /// 在已有连接上打开 SFTP 子系统
    pub async fn open(label: &str, handle: &Handle<SshClientHandler>) -> Result<Self> {
        info!("[SFTP] Opening SFTP subsystem for {}", label);

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| BrokerError::Unreachable(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| BrokerError::Transfer(format!("Failed to request sftp subsystem: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| BrokerError::Transfer(format!("Failed to create SFTP session: {}", e)))?;

        Ok(Self {
            label: label.to_string(),
            sftp,
        })
    }

    /// 读取文件内容，Head / Tail 只传输需要的字节
    pub async fn read_file(&self, path: &str, range: ReadRange) -> Result<Vec<u8>> {
        debug!("[SFTP] [{}] Reading file: {} ({:?})", self.label, path, range);

        let mut file = self.sftp.open(path).await?;
        let read_err = |e: std::io::Error| BrokerError::Transfer(format!("Failed to read {}: {}", path, e));

        let mut content = Vec::new();
        match range {
            ReadRange::Full => {
                file.read_to_end(&mut content).await.map_err(read_err)?;
            }
            ReadRange::Head(n) => {
                file.take(n as u64)
                    .read_to_end(&mut content)
                    .await
                    .map_err(read_err)?;
            }
            ReadRange::Tail(n) => {
                let size = file.metadata().await?.size.unwrap_or(0);
                let start = size.saturating_sub(n as u64);
                file.seek(SeekFrom::Start(start)).await.map_err(read_err)?;
                file.read_to_end(&mut content).await.map_err(read_err)?;
            }
        }

        debug!("[SFTP] Read {} bytes from {}", content.len(), path);
        Ok(content)
    }

    /// 写入文件内容（覆盖或追加）
    /// 中途断开时文件内容不确定，调用方需要重新读取确认
    pub async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        debug!(
            "[SFTP] [{}] Writing {} bytes to {} ({:?})",
            self.label,
            data.len(),
            path,
            mode
        );

        let flags = match mode {
            WriteMode::Overwrite => OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            WriteMode::Append => OpenFlags::CREATE | OpenFlags::APPEND | OpenFlags::WRITE,
        };

        let mut file = self.sftp.open_with_flags(path, flags).await?;

        file.write_all(data)
            .await
            .map_err(|e| BrokerError::Transfer(format!("Failed to write {}: {}", path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| BrokerError::Transfer(format!("Failed to close {}: {}", path, e)))?;

        Ok(())
    }
}

impl Drop for SftpService {
    fn drop(&mut self) {
        info!("[SFTP] Dropping SFTP service for {}", self.label);
    }
}
