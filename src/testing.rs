// 测试用的假连接
// 命令交给本地 shell 执行，文件保存在内存里

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, Result};
use crate::models::settings::ExecutionSettings;
use crate::models::{ReadRange, WriteMode};
use crate::services::local::LocalRunner;
use crate::services::tracker::RecordWriter;
use crate::ssh::channel::{Connector, ExecOutcome, RemoteChannel};
use crate::ssh::config::{AuthMethod, TargetDescriptor};

pub const PASSWORD: &str = "correct-horse";
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";
/// 以此结尾的命令或文件路径模拟连接中断
pub const CONNECTION_RESET: &str = "simulate-connection-reset";

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// 假连接建立器，所有连接共享同一个内存文件系统
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    files: FileMap,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>> {
        if target.host() == UNREACHABLE_HOST {
            return Err(BrokerError::Unreachable(format!("{}: connection refused", target)));
        }
        match target.auth() {
            AuthMethod::Password(password) if password == PASSWORD => {}
            _ => return Err(BrokerError::Auth(format!("{} rejected credentials", target))),
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            files: self.files.clone(),
            ..Default::default()
        }))
    }
}

/// 假连接
pub struct FakeChannel {
    runner: LocalRunner,
    files: FileMap,
    closed: AtomicBool,
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self {
            runner: LocalRunner::new(&ExecutionSettings::default()),
            files: FileMap::default(),
            closed: AtomicBool::new(false),
        }
    }
}

impl FakeChannel {
    fn check_reset(&self, subject: &str) -> Result<()> {
        if subject.ends_with(CONNECTION_RESET) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(BrokerError::Transfer("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn exec(
        &self,
        command: &str,
        output: &RecordWriter,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        self.check_reset(command)?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(ExecOutcome::Cancelled),
            outcome = self.runner.run(command, output) => outcome,
        }
    }

    async fn read_file(&self, path: &str, range: ReadRange) -> Result<Vec<u8>> {
        self.check_reset(path)?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .map(|data| range.apply(data))
            .ok_or_else(|| BrokerError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        self.check_reset(path)?;
        let mut files = self.files.lock().unwrap();
        match mode {
            WriteMode::Overwrite => {
                files.insert(path.to_string(), data.to_vec());
            }
            WriteMode::Append => files.entry(path.to_string()).or_default().extend_from_slice(data),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
