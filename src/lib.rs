// sshbroker - SSH 远程执行代理
//
// 管理长连接会话，在本地或远程会话上调度命令，并支持异步查询执行结果。

pub mod constants;
pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod ssh;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BrokerError, Result};
pub use models::BrokerSettings;
pub use tools::{Broker, FileEdit, ToolCall, ToolResponse};
