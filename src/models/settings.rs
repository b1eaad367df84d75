// Settings 配置数据结构

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::defaults;

// ======================== 主配置结构 ========================

/// 代理设置（持久化用）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub connection: ConnectionSettings,
    pub execution: ExecutionSettings,
    pub tracker: TrackerSettings,
    pub safety: SafetySettings,
    pub files: FileSettings,
}

// ======================== 连接设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub default_port: u16,
    pub connection_timeout_secs: u32,
    /// 0 表示关闭心跳
    pub keepalive_interval_secs: u32,
    pub keepalive_max: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            default_port: defaults::SSH_PORT,
            connection_timeout_secs: 30,
            keepalive_interval_secs: 60,
            keepalive_max: 3,
        }
    }
}

// ======================== 执行设置 ========================

/// 会话忙碌时的调度策略
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// 排队等待前一个命令结束
    #[default]
    Queue,
    /// 直接返回 SessionBusy
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// 本地执行使用的 shell
    pub shell: String,
    /// 工具调用未指定超时时的同步等待时间
    pub default_timeout_secs: u64,
    pub busy_policy: BusyPolicy,
    /// 注入每条命令的非交互环境变量
    pub non_interactive_env: Vec<(String, String)>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            default_timeout_secs: 30,
            busy_policy: BusyPolicy::Queue,
            non_interactive_env: defaults::NON_INTERACTIVE_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ExecutionSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

// ======================== 执行记录设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// 已完成记录的保留时间
    pub retention_secs: u64,
    /// 后台清理间隔，0 表示不启动清理任务
    pub gc_interval_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            gc_interval_secs: 60,
        }
    }
}

// ======================== 安全过滤设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub enabled: bool,
    /// 总是拒绝的交互式程序（编辑器、分页器、终端复用器等）
    pub denylist: Vec<String>,
    /// 无脚本参数时拒绝的 shell
    pub shells: Vec<String>,
    /// 无参数时拒绝的 REPL
    pub repls: Vec<String>,
    /// 需要剥离的包装命令（sudo、env 等）
    pub wrappers: Vec<String>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            enabled: true,
            denylist: owned(defaults::DENYLIST),
            shells: owned(defaults::SHELLS),
            repls: owned(defaults::REPLS),
            wrappers: owned(defaults::WRAPPERS),
        }
    }
}

// ======================== 文件设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// 本地文件操作的根目录（设置后所有路径都限制在其下）
    pub local_root: Option<PathBuf>,
    pub create_parents: bool,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            local_root: None,
            create_parents: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let json = r#"{ "execution": { "busy_policy": "reject" }, "tracker": { "retention_secs": 5 } }"#;
        let settings: BrokerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.execution.busy_policy, BusyPolicy::Reject);
        assert_eq!(settings.execution.shell, "sh");
        assert_eq!(settings.tracker.retention_secs, 5);
        assert_eq!(settings.tracker.gc_interval_secs, 60);
        assert_eq!(settings.connection.default_port, 22);
        assert!(settings.safety.denylist.iter().any(|p| p == "vim"));
    }
}
