// 本地命令执行
// 通过 `<shell> -c` 启动进程，stdout / stderr 边读边写入执行记录

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::models::settings::ExecutionSettings;
use crate::services::tracker::RecordWriter;
use crate::ssh::channel::ExecOutcome;

const READ_CHUNK: usize = 8192;

/// 本地命令执行器
#[derive(Clone, Debug)]
pub struct LocalRunner {
    shell: String,
    env: Vec<(String, String)>,
}

impl LocalRunner {
    pub fn new(settings: &ExecutionSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            env: settings.non_interactive_env.clone(),
        }
    }

    /// 运行命令直到结束
    /// 标准输入关闭，避免命令等待输入而挂起
    pub async fn run(&self, command: &str, output: &RecordWriter) -> Result<ExecOutcome> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 执行被放弃（future 被丢弃）时结束子进程
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrokerError::Spawn(format!("{}: {}", self.shell, e)))?;

        debug!(
            "[Exec] Spawned local process {:?} for {}",
            child.id(),
            output.id()
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            pump(stdout, |chunk| output.append_stdout(chunk)),
            pump(stderr, |chunk| output.append_stderr(chunk)),
        );

        let status = child.wait().await?;
        Ok(ExecOutcome::Exited(exit_code(status)))
    }
}

/// 把管道内容持续追加到记录
async fn pump<R, F>(reader: Option<R>, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink(&buf[..n]),
            Err(e) => {
                warn!("[Exec] Failed to read process output: {}", e);
                break;
            }
        }
    }
}

/// 被信号终止的进程按 shell 惯例返回 128 + 信号值
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::settings::TrackerSettings;
    use crate::models::Owner;
    use crate::services::tracker::OutputTracker;

    fn runner() -> LocalRunner {
        LocalRunner::new(&ExecutionSettings::default())
    }

    #[tokio::test]
    async fn test_run_captures_streams_and_exit_code() {
        let tracker = OutputTracker::new(&TrackerSettings::default());
        let writer = tracker.register(Owner::Local, "script");
        let outcome = runner()
            .run("echo out; echo err >&2; exit 7", &writer)
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Exited(7));
        let snapshot = writer.snapshot();
        assert_eq!(snapshot.stdout, b"out\n");
        assert_eq!(snapshot.stderr, b"err\n");
    }

    #[tokio::test]
    async fn test_non_interactive_env_is_applied() {
        let tracker = OutputTracker::new(&TrackerSettings::default());
        let writer = tracker.register(Owner::Local, "env");
        runner().run("printf %s \"$PAGER\"", &writer).await.unwrap();
        assert_eq!(writer.snapshot().stdout, b"cat");
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let tracker = OutputTracker::new(&TrackerSettings::default());
        let writer = tracker.register(Owner::Local, "kill");
        let outcome = runner().run("kill -9 $$", &writer).await.unwrap();
        assert_eq!(outcome, ExecOutcome::Exited(137));
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let settings = ExecutionSettings {
            shell: "/nonexistent/shell".to_string(),
            ..Default::default()
        };
        let tracker = OutputTracker::new(&TrackerSettings::default());
        let writer = tracker.register(Owner::Local, "x");
        let err = LocalRunner::new(&settings).run("true", &writer).await.unwrap_err();
        assert!(matches!(err, BrokerError::Spawn(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_run_kills_process() {
        let tracker = OutputTracker::new(&TrackerSettings::default());
        let writer = tracker.register(Owner::Local, "sleep");
        let runner = runner();

        let run = runner.run("echo $$; exec sleep 30", &writer);
        let waited = tokio::time::timeout(Duration::from_millis(300), run).await;
        assert!(waited.is_err());

        let pid = writer.snapshot().stdout_text().trim().to_string();
        assert!(!pid.is_empty());
        // 进程消失或只剩待回收的僵尸
        let exited = || match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(false, |rest| rest.trim_start().starts_with('Z')),
        };
        let mut gone = false;
        for _ in 0..40 {
            if exited() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "process {pid} still running");
    }
}
