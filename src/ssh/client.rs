// SSH 客户端核心实现

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::channel::{Connector, RemoteChannel};
use super::config::{AuthMethod, ClientOptions, TargetDescriptor};
use super::handler::SshClientHandler;
use super::remote::SshRemote;
use crate::error::{BrokerError, Result};

/// SSH 客户端
/// 负责建立并认证 SSH 连接
pub struct SshClient {
    options: ClientOptions,
}

impl SshClient {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// 执行连接（TCP → 握手 → 认证）
    pub async fn connect(&self, target: &TargetDescriptor) -> Result<Handle<SshClientHandler>> {
        info!("[SSH] Connecting to {}...", target);

        let connect_timeout = self.options.connect_timeout();

        // 解析地址
        let socket_addr = timeout(
            connect_timeout,
            tokio::net::lookup_host((target.host(), target.port())),
        )
        .await
        .map_err(|_| {
            BrokerError::Unreachable(format!("DNS lookup for {} timed out", target.host()))
        })?
        .map_err(|e| {
            BrokerError::Unreachable(format!("Failed to resolve {}: {}", target.host(), e))
        })?
        .next()
        .ok_or_else(|| {
            BrokerError::Unreachable(format!("No address found for {}", target.host()))
        })?;

        // TCP 连接
        let tcp_stream = timeout(connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| {
                BrokerError::Unreachable(format!(
                    "Connection to {} timed out after {}s",
                    socket_addr, self.options.connect_timeout
                ))
            })?
            .map_err(|e| BrokerError::Unreachable(format!("{}: {}", socket_addr, e)))?;

        debug!("[SSH] TCP connection established to {}", socket_addr);

        // SSH 握手
        let russh_config = Arc::new(self.options.to_russh_config());
        let handler = SshClientHandler::new(target.host(), target.port());

        let mut handle = timeout(
            connect_timeout,
            russh::client::connect_stream(russh_config, tcp_stream, handler),
        )
        .await
        .map_err(|_| {
            BrokerError::Unreachable(format!("SSH handshake with {} timed out", target))
        })?
        .map_err(|e| BrokerError::Unreachable(format!("SSH handshake failed: {}", e)))?;

        debug!("[SSH] Handshake completed with {}", target);

        // 认证
        self.authenticate(&mut handle, target).await?;

        info!(
            "[SSH] Authenticated to {} ({})",
            target,
            target.auth().label()
        );
        Ok(handle)
    }

    /// 执行认证
    async fn authenticate(
        &self,
        handle: &mut Handle<SshClientHandler>,
        target: &TargetDescriptor,
    ) -> Result<()> {
        use russh::client::AuthResult;

        let auth_result = match target.auth() {
            AuthMethod::Password(password) => {
                debug!("[SSH] Using password authentication");
                handle
                    .authenticate_password(target.username(), password)
                    .await
                    .map_err(|e| BrokerError::Unreachable(format!("Authentication aborted: {}", e)))?
            }
            AuthMethod::PublicKey {
                key_path,
                passphrase,
            } => {
                debug!("[SSH] Using public key authentication: {:?}", key_path);
                let key = Self::load_private_key(key_path, passphrase.as_deref()).await?;
                Self::authenticate_key(handle, target.username(), key).await?
            }
            AuthMethod::KeyMaterial { pem, passphrase } => {
                debug!("[SSH] Using in-memory key authentication");
                let key = russh::keys::decode_secret_key(pem, passphrase.as_deref())?;
                Self::authenticate_key(handle, target.username(), key).await?
            }
        };

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                if partial_success {
                    return Err(BrokerError::Auth(
                        "Partial authentication - additional auth required".to_string(),
                    ));
                }
                Err(BrokerError::Auth(format!(
                    "{} authentication rejected for '{}'. Server suggests: {:?}",
                    target.auth().label(),
                    target.username(),
                    remaining_methods
                )))
            }
        }
    }

    async fn authenticate_key(
        handle: &mut Handle<SshClientHandler>,
        username: &str,
        key: russh::keys::PrivateKey,
    ) -> Result<russh::client::AuthResult> {
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
        handle
            .authenticate_publickey(username, key_with_alg)
            .await
            .map_err(|e| BrokerError::Unreachable(format!("Authentication aborted: {}", e)))
    }

    /// 加载私钥文件
    async fn load_private_key(
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<russh::keys::PrivateKey> {
        let key_data = tokio::fs::read(key_path).await.map_err(|e| {
            BrokerError::Config(format!("Failed to read key file {:?}: {}", key_path, e))
        })?;

        let key = russh::keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)?;
        debug!("[SSH] Private key loaded from {:?}", key_path);
        Ok(key)
    }
}

/// 基于 russh 的连接建立器
pub struct SshConnector {
    client: SshClient,
}

impl SshConnector {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            client: SshClient::new(options),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>> {
        let handle = self.client.connect(target).await?;
        Ok(Box::new(SshRemote::new(handle, target.to_string())))
    }
}
