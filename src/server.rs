// JSON Lines 服务
//
// 每行一个请求 {"id": ..., "call": {"tool": "...", "args": {...}}}，
// 每个请求在独立任务中处理，响应按完成顺序写回，用 id 对应。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::tools::{Broker, ToolCall, ToolResponse};

#[derive(Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    call: ToolCall,
}

#[derive(Serialize)]
struct Reply {
    id: Option<Value>,
    #[serde(flatten)]
    response: ToolResponse,
}

/// 处理请求直到输入结束，并等待所有进行中的请求写回
pub async fn serve<R, W>(broker: Arc<Broker>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(64);

    let write_task = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply_tx = reply_tx.clone();
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let response = broker.handle_call(request.call).await;
                    send(&reply_tx, Reply {
                        id: request.id,
                        response,
                    })
                    .await;
                });
            }
            Err(e) => {
                warn!("[Broker] Invalid request: {}", e);
                send(&reply_tx, Reply {
                    id: None,
                    response: ToolResponse::Error {
                        kind: "InvalidRequest".to_string(),
                        message: e.to_string(),
                    },
                })
                .await;
            }
        }
    }

    debug!("[Broker] Input closed, waiting for pending replies");
    drop(reply_tx);
    write_task.await??;
    Ok(())
}

async fn send(reply_tx: &mpsc::Sender<String>, reply: Reply) {
    match serde_json::to_string(&reply) {
        Ok(line) => {
            if reply_tx.send(line).await.is_err() {
                warn!("[Broker] Output closed, dropping reply");
            }
        }
        Err(e) => warn!("[Broker] Failed to encode reply: {}", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::BrokerSettings;
    use crate::testing::FakeConnector;

    #[tokio::test]
    async fn test_serve_json_lines() {
        let broker = Arc::new(Broker::with_connector(
            BrokerSettings::default(),
            Arc::new(FakeConnector::new()),
        ));
        let input = concat!(
            r#"{"id": 1, "call": {"tool": "run_shell_command", "args": {"command": "echo hi"}}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"id": "b", "call": {"tool": "ssh_list_sessions"}}"#,
            "\n",
        );

        let (client, server_side) = tokio::io::duplex(64 * 1024);
        serve(broker, input.as_bytes(), server_side).await.unwrap();

        let mut output = String::new();
        let mut reader = tokio::io::BufReader::new(client);
        let mut replies = Vec::new();
        while reader.read_line(&mut output).await.unwrap() > 0 {
            replies.push(serde_json::from_str::<Value>(output.trim()).unwrap());
            output.clear();
        }

        assert_eq!(replies.len(), 3);
        let by_id = |id: Value| replies.iter().find(|r| r["id"] == id).unwrap();
        let first = by_id(Value::from(1));
        assert_eq!(first["status"], "ok");
        assert_eq!(first["result"]["record"]["stdout"], "hi\n");
        let second = by_id(Value::from("b"));
        assert_eq!(second["result"]["sessions"], Value::Array(vec![]));
        let invalid = by_id(Value::Null);
        assert_eq!(invalid["kind"], "InvalidRequest");
    }
}
