// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait

use std::future::Future;

use russh::keys::PublicKey;
use tracing::{debug, info};

/// SSH 客户端 Handler
/// 处理 SSH 连接过程中的回调
pub struct SshClientHandler {
    /// 目标（host:port，用于日志）
    target: String,
}

impl SshClientHandler {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
        }
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    /// 与 AutoAddPolicy 一致：记录指纹后接受
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);

        info!(
            "[SSH] Server key fingerprint for {}: {}",
            self.target, fingerprint
        );
        debug!(
            "[SSH] Server key type: {}",
            server_public_key.algorithm()
        );

        async { Ok(true) }
    }
}
