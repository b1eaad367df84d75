// SSH 连接模块
//
// 模块结构:
// - config: 连接目标 (TargetDescriptor, AuthMethod) 与客户端参数
// - channel: 连接抽象 (Connector, RemoteChannel)
// - handler: russh Handler 实现
// - client: russh 客户端 (SshClient, SshConnector)
// - remote: 基于 russh Handle 的 RemoteChannel
// - session: 会话状态与执行历史
// - registry: 会话注册表

pub mod channel;
pub mod client;
pub mod config;
pub mod handler;
pub mod registry;
pub mod remote;
pub mod session;

// 公开导出
pub use channel::{Connector, ExecOutcome, RemoteChannel};
pub use client::{SshClient, SshConnector};
pub use config::{AuthMethod, ClientOptions, KeepaliveConfig, TargetDescriptor, TargetKey};
pub use registry::SessionRegistry;
pub use session::{Session, SessionInfo, SessionState};
