// sshbroker - 应用入口
// 从标准输入读取 JSON 工具调用，结果写到标准输出；日志输出到标准错误

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use sshbroker::services::storage;
use sshbroker::Broker;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug sshbroker
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false) // 不显示 target（模块路径）
        .with_writer(std::io::stderr)
        .init();

    // 可选参数：设置文件路径，默认使用配置目录下的 settings.json
    let settings = match std::env::args().nth(1) {
        Some(path) => storage::load_settings_from(Path::new(&path))?,
        None => storage::load_settings()?,
    };
    tracing::info!(
        "[Broker] Starting (shell: {}, busy policy: {:?})",
        settings.execution.shell,
        settings.execution.busy_policy
    );

    let broker = Arc::new(Broker::new(settings));
    let result = sshbroker::server::serve(
        broker.clone(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;

    broker.shutdown().await;
    result
}
