// 工具调用入口
//
// Broker 持有注册表、执行记录追踪器、调度器和文件传输，
// 对外提供 ssh_* / run_shell_command / edit_file / curl_check_url 等操作，
// handle_call 把 JSON 工具调用分发到对应操作。

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::models::settings::BrokerSettings;
use crate::models::{DispatchMode, Dispatched, ExecutionSnapshot, Owner, ReadRange, WriteMode};
use crate::services::curl::{parse_response, CurlRequest, HttpResponse};
use crate::services::{CommandExecutor, FileTransfer, OutputTracker};
use crate::ssh::{AuthMethod, ClientOptions, Connector, SessionInfo, SessionRegistry, SshConnector, TargetDescriptor};

/// 本地文件操作
#[derive(Clone, Debug)]
pub enum FileEdit {
    Read(ReadRange),
    Write(Vec<u8>),
    Append(Vec<u8>),
}

/// 远程执行代理
pub struct Broker {
    settings: BrokerSettings,
    registry: Arc<SessionRegistry>,
    tracker: Arc<OutputTracker>,
    executor: CommandExecutor,
    transfer: FileTransfer,
    shutdown: CancellationToken,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// 使用 russh 连接远程主机
    pub fn new(settings: BrokerSettings) -> Self {
        let connector = SshConnector::new(ClientOptions::from(&settings.connection));
        Self::with_connector(settings, Arc::new(connector))
    }

    /// 在 tokio 运行时中调用时会启动执行记录清理任务
    pub fn with_connector(settings: BrokerSettings, connector: Arc<dyn Connector>) -> Self {
        let tracker = Arc::new(OutputTracker::new(&settings.tracker));
        let registry = Arc::new(SessionRegistry::new(connector, tracker.clone()));
        let executor = CommandExecutor::new(registry.clone(), tracker.clone(), &settings);
        let transfer = FileTransfer::new(registry.clone(), &settings.files);
        let shutdown = CancellationToken::new();

        let gc = if settings.tracker.gc_interval_secs > 0
            && tokio::runtime::Handle::try_current().is_ok()
        {
            Some(tracker.spawn_gc(
                Duration::from_secs(settings.tracker.gc_interval_secs),
                shutdown.clone(),
            ))
        } else {
            None
        };

        Self {
            settings,
            registry,
            tracker,
            executor,
            transfer,
            shutdown,
            gc: Mutex::new(gc),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<OutputTracker> {
        &self.tracker
    }

    /// 未指定超时时使用设置中的默认值
    fn sync_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        Some(timeout.unwrap_or_else(|| self.settings.execution.default_timeout()))
    }

    // ======================== SSH 工具 ========================

    /// 连接远程主机，返回会话 ID（目标已连接时返回已有 ID）
    pub async fn ssh_connect(
        &self,
        host: &str,
        port: Option<u16>,
        username: &str,
        auth: AuthMethod,
    ) -> Result<String> {
        let port = port.unwrap_or(self.settings.connection.default_port);
        let target = TargetDescriptor::new(host, port, username, auth)?;
        self.registry.connect(target).await
    }

    pub async fn ssh_execute(
        &self,
        session_id: &str,
        command: &str,
        mode: DispatchMode,
        timeout: Option<Duration>,
    ) -> Result<Dispatched> {
        self.executor
            .dispatch(
                Owner::Session(session_id.to_string()),
                command,
                mode,
                self.sync_timeout(timeout),
            )
            .await
    }

    /// 查询执行结果；指定 wait 时最多等待该时长，到时返回当前快照
    pub async fn ssh_check_output(
        &self,
        execution_id: &str,
        wait: Option<Duration>,
    ) -> Result<ExecutionSnapshot> {
        let Some(wait) = wait else {
            return self.tracker.peek(execution_id);
        };
        match self.tracker.wait_for(execution_id, Some(wait)).await {
            Err(BrokerError::Timeout { .. }) => self.tracker.peek(execution_id),
            other => other,
        }
    }

    pub async fn ssh_read_file(&self, session_id: &str, path: &str, range: ReadRange) -> Result<Vec<u8>> {
        self.transfer
            .read(&Owner::Session(session_id.to_string()), path, range)
            .await
    }

    pub async fn ssh_write_file(
        &self,
        session_id: &str,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.transfer
            .write(&Owner::Session(session_id.to_string()), path, data, mode)
            .await
    }

    pub async fn ssh_disconnect(&self, session_id: &str) -> Result<()> {
        self.registry.disconnect(session_id).await
    }

    pub fn ssh_list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    // ======================== 本地工具 ========================

    pub async fn run_shell_command(
        &self,
        command: &str,
        mode: DispatchMode,
        timeout: Option<Duration>,
    ) -> Result<Dispatched> {
        self.executor
            .dispatch(Owner::Local, command, mode, self.sync_timeout(timeout))
            .await
    }

    /// 本地文件读写；读取时返回内容
    pub async fn edit_file(&self, path: &str, edit: FileEdit) -> Result<Option<Vec<u8>>> {
        match edit {
            FileEdit::Read(range) => Ok(Some(self.transfer.read(&Owner::Local, path, range).await?)),
            FileEdit::Write(data) => {
                self.transfer
                    .write(&Owner::Local, path, &data, WriteMode::Overwrite)
                    .await?;
                Ok(None)
            }
            FileEdit::Append(data) => {
                self.transfer
                    .write(&Owner::Local, path, &data, WriteMode::Append)
                    .await?;
                Ok(None)
            }
        }
    }

    /// 通过 curl 检查 URL；指定会话时在远程主机上执行
    pub async fn curl_check_url(
        &self,
        request: &CurlRequest,
        session_id: Option<&str>,
    ) -> Result<HttpResponse> {
        let command = request.to_command()?;
        let owner = session_id.map_or(Owner::Local, |id| Owner::Session(id.to_string()));

        let dispatched = self
            .executor
            .dispatch(owner, &command, DispatchMode::Sync, Some(request.wait_timeout()))
            .await?;
        let Dispatched::Completed { record } = dispatched else {
            return Err(BrokerError::Transfer("curl did not complete".to_string()));
        };

        match record.exit_code {
            Some(0) => Ok(parse_response(&record.stdout_text())?.project(request.output)),
            code => {
                let stderr = record.stderr_text();
                let stderr = stderr.trim();
                Err(BrokerError::Unreachable(if stderr.is_empty() {
                    format!("curl exited with code {:?}", code)
                } else {
                    stderr.to_string()
                }))
            }
        }
    }

    /// 停止清理任务并断开所有会话
    pub async fn shutdown(&self) {
        info!("[Broker] Shutting down");
        self.shutdown.cancel();
        self.registry.disconnect_all().await;

        let gc = self.gc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(gc) = gc {
            if let Err(e) = gc.await {
                warn!("[Broker] GC task ended abnormally: {}", e);
            }
        }
    }

    // ======================== JSON 工具调用 ========================

    /// 处理一次工具调用，错误也转换为响应
    pub async fn handle_call(&self, call: ToolCall) -> ToolResponse {
        let tool = call.name();
        debug!("[Broker] Tool call: {}", tool);
        match self.dispatch_call(call).await {
            Ok(result) => ToolResponse::Ok { result },
            Err(e) => {
                debug!("[Broker] Tool {} failed: {}", tool, e);
                ToolResponse::from_error(&e)
            }
        }
    }

    async fn dispatch_call(&self, call: ToolCall) -> Result<Value> {
        match call {
            ToolCall::SshConnect {
                host,
                port,
                username,
                password,
                key_path,
                key,
                passphrase,
            } => {
                let auth = match (password, key_path, key) {
                    (Some(password), None, None) => AuthMethod::Password(password),
                    (None, Some(key_path), None) => AuthMethod::PublicKey { key_path, passphrase },
                    (None, None, Some(pem)) => AuthMethod::KeyMaterial { pem, passphrase },
                    _ => {
                        return Err(BrokerError::Config(
                            "exactly one of password, key_path or key is required".to_string(),
                        ))
                    }
                };
                let session_id = self.ssh_connect(&host, port, &username, auth).await?;
                Ok(json!({ "session_id": session_id }))
            }
            ToolCall::SshExecute {
                session_id,
                command,
                mode,
                timeout_secs,
            } => to_value(
                self.ssh_execute(&session_id, &command, mode, timeout_secs.map(Duration::from_secs))
                    .await?,
            ),
            ToolCall::SshCheckOutput {
                execution_id,
                wait_secs,
            } => to_value(
                self.ssh_check_output(&execution_id, wait_secs.map(Duration::from_secs))
                    .await?,
            ),
            ToolCall::SshReadFile {
                session_id,
                path,
                range,
            } => {
                let data = self.ssh_read_file(&session_id, &path, range).await?;
                Ok(content_value(&path, &data))
            }
            ToolCall::SshWriteFile {
                session_id,
                path,
                content,
                mode,
            } => {
                self.ssh_write_file(&session_id, &path, content.as_bytes(), mode)
                    .await?;
                Ok(json!({ "ack": true, "bytes": content.len() }))
            }
            ToolCall::SshDisconnect { session_id } => {
                self.ssh_disconnect(&session_id).await?;
                Ok(json!({ "ack": true }))
            }
            ToolCall::SshListSessions => Ok(json!({ "sessions": to_value(self.ssh_list_sessions())? })),
            ToolCall::RunShellCommand {
                command,
                mode,
                timeout_secs,
            } => to_value(
                self.run_shell_command(&command, mode, timeout_secs.map(Duration::from_secs))
                    .await?,
            ),
            ToolCall::EditFile {
                path,
                action,
                content,
                range,
            } => {
                let edit = match (action, content) {
                    (EditAction::Read, _) => FileEdit::Read(range),
                    (EditAction::Write, Some(content)) => FileEdit::Write(content.into_bytes()),
                    (EditAction::Append, Some(content)) => FileEdit::Append(content.into_bytes()),
                    (_, None) => {
                        return Err(BrokerError::Config(
                            "content is required for write and append".to_string(),
                        ))
                    }
                };
                match self.edit_file(&path, edit).await? {
                    Some(data) => Ok(content_value(&path, &data)),
                    None => Ok(json!({ "ack": true })),
                }
            }
            ToolCall::CurlCheckUrl {
                request,
                session_id,
            } => to_value(self.curl_check_url(&request, session_id.as_deref()).await?),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| BrokerError::Config(format!("failed to encode result: {}", e)))
}

fn content_value(path: &str, data: &[u8]) -> Value {
    json!({
        "path": path,
        "content": String::from_utf8_lossy(data),
        "bytes": data.len(),
    })
}

/// edit_file 的操作类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    Read,
    Write,
    Append,
}

/// JSON 工具调用：{"tool": "...", "args": {...}}
/// 含密码字段，不实现 Debug
#[derive(Clone, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    SshConnect {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_path: Option<PathBuf>,
        /// PEM 格式私钥
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        passphrase: Option<String>,
    },
    SshExecute {
        session_id: String,
        command: String,
        #[serde(default)]
        mode: DispatchMode,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    SshCheckOutput {
        execution_id: String,
        #[serde(default)]
        wait_secs: Option<u64>,
    },
    SshReadFile {
        session_id: String,
        path: String,
        #[serde(default)]
        range: ReadRange,
    },
    SshWriteFile {
        session_id: String,
        path: String,
        content: String,
        #[serde(default)]
        mode: WriteMode,
    },
    SshDisconnect {
        session_id: String,
    },
    SshListSessions,
    RunShellCommand {
        command: String,
        #[serde(default)]
        mode: DispatchMode,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    EditFile {
        path: String,
        action: EditAction,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        range: ReadRange,
    },
    CurlCheckUrl {
        request: CurlRequest,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::SshConnect { .. } => "ssh_connect",
            ToolCall::SshExecute { .. } => "ssh_execute",
            ToolCall::SshCheckOutput { .. } => "ssh_check_output",
            ToolCall::SshReadFile { .. } => "ssh_read_file",
            ToolCall::SshWriteFile { .. } => "ssh_write_file",
            ToolCall::SshDisconnect { .. } => "ssh_disconnect",
            ToolCall::SshListSessions => "ssh_list_sessions",
            ToolCall::RunShellCommand { .. } => "run_shell_command",
            ToolCall::EditFile { .. } => "edit_file",
            ToolCall::CurlCheckUrl { .. } => "curl_check_url",
        }
    }
}

/// 工具调用响应
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    Ok { result: Value },
    Error { kind: String, message: String },
}

impl ToolResponse {
    pub fn from_error(err: &BrokerError) -> Self {
        ToolResponse::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolResponse::Ok { .. })
    }
}
