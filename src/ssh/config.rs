// SSH 连接目标描述

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::defaults;
use crate::error::{BrokerError, Result};
use crate::models::settings::ConnectionSettings;

/// 连接目标描述（创建后不可变）
/// 相等性只比较 (host, port, username)
#[derive(Clone)]
pub struct TargetDescriptor {
    host: String,
    port: u16,
    username: String,
    auth: AuthMethod,
}

/// 认证方式
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 公钥认证（私钥文件）
    PublicKey {
        /// 私钥文件路径
        key_path: PathBuf,
        /// 私钥密码（如果有）
        passphrase: Option<String>,
    },
    /// 公钥认证（内存中的私钥内容）
    KeyMaterial {
        pem: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey-file",
            AuthMethod::KeyMaterial { .. } => "publickey",
        }
    }
}

// 不打印任何密钥内容
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey { key_path, .. } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .finish_non_exhaustive(),
            AuthMethod::KeyMaterial { .. } => f.write_str("KeyMaterial(***)"),
        }
    }
}

impl TargetDescriptor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Result<Self> {
        let host = host.into();
        let username = username.into();
        if host.trim().is_empty() {
            return Err(BrokerError::Config("host must not be empty".to_string()));
        }
        if username.trim().is_empty() {
            return Err(BrokerError::Config("username must not be empty".to_string()));
        }
        if port == 0 {
            return Err(BrokerError::Config("port must be non-zero".to_string()));
        }
        Ok(Self {
            host,
            port,
            username,
            auth,
        })
    }

    /// 使用默认端口 22
    pub fn with_default_port(
        host: impl Into<String>,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Result<Self> {
        Self::new(host, defaults::SSH_PORT, username, auth)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

impl PartialEq for TargetDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.username == other.username
    }
}

impl Eq for TargetDescriptor {}

impl Hash for TargetDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.username.hash(state);
    }
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// 会话去重键 (host, port, username)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            max_retries: 3,
        }
    }
}

/// 客户端连接参数（来自 ConnectionSettings）
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// 连接超时（秒）
    pub connect_timeout: u64,
    pub keepalive: KeepaliveConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl From<&ConnectionSettings> for ClientOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout: settings.connection_timeout_secs as u64,
            keepalive: KeepaliveConfig {
                enabled: settings.keepalive_interval_secs > 0,
                interval: settings.keepalive_interval_secs as u64,
                max_retries: settings.keepalive_max,
            },
        }
    }
}

/// russh 客户端配置构建
impl ClientOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // 会话长期空闲是正常情况，不设置 inactivity_timeout，依靠心跳检测断线
        config.inactivity_timeout = None;
        if self.keepalive.enabled {
            config.keepalive_interval = Some(Duration::from_secs(self.keepalive.interval));
            config.keepalive_max = self.keepalive.max_retries as usize;
        }
        config
    }
}
