// HTTP 检查：构造 curl 命令并解析输出
//
// 输出格式：`-D -` 先输出响应头（跟随重定向时每一跳一段），
// 然后是响应体，最后由 `-w` 追加状态码标记行。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::shell::shell_quote;
use crate::error::{BrokerError, Result};

const STATUS_MARKER: &str = "__STATUS__:";
/// curl 超时上限（一天）
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// 返回内容的范围
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurlOutput {
    #[default]
    Full,
    Headers,
    Body,
    Status,
}

/// curl 请求参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurlRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// "Key: Value" 格式
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub output: CurlOutput,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_follow_redirects() -> bool {
    true
}

impl CurlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: Vec::new(),
            data: None,
            timeout_secs: default_timeout_secs(),
            follow_redirects: default_follow_redirects(),
            output: CurlOutput::Full,
        }
    }

    /// 生成 shell 命令（所有参数都经过引用）
    pub fn to_command(&self) -> Result<String> {
        if self.url.trim().is_empty() {
            return Err(BrokerError::Config("url must not be empty".to_string()));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(BrokerError::Config(format!(
                "timeout_secs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            )));
        }

        let mut args: Vec<String> = vec![
            "curl".into(),
            "-sS".into(),
            "-D".into(),
            "-".into(),
            "-w".into(),
            format!("\\n{}%{{http_code}}", STATUS_MARKER),
        ];
        let method = self.method.trim().to_ascii_uppercase();
        if !method.is_empty() && method != "GET" {
            args.extend(["-X".to_string(), method]);
        }
        for header in &self.headers {
            args.extend(["-H".to_string(), header.clone()]);
        }
        if let Some(data) = &self.data {
            args.extend(["--data-binary".to_string(), data.clone()]);
        }
        args.extend(["--max-time".to_string(), self.timeout_secs.to_string()]);
        if self.follow_redirects {
            args.push("-L".into());
        }
        args.push("--".into());
        args.push(self.url.clone());

        Ok(args
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// 等待命令结束的时间（比 curl 自身超时多留 5 秒）
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.saturating_add(5))
    }
}

/// HTTP 响应
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status_code: u16,
    /// 状态行，如 "HTTP/1.1 200 OK"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpResponse {
    /// 按 output 只保留需要的部分
    pub fn project(mut self, output: CurlOutput) -> Self {
        match output {
            CurlOutput::Full => {}
            CurlOutput::Headers => self.body = None,
            CurlOutput::Body => {
                self.headers.clear();
                self.status_line = None;
            }
            CurlOutput::Status => {
                self.headers.clear();
                self.status_line = None;
                self.body = None;
            }
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// 解析 curl 输出
pub fn parse_response(output: &str) -> Result<HttpResponse> {
    let Some(marker) = output.rfind(STATUS_MARKER) else {
        return Err(BrokerError::Transfer(
            "curl output is missing the status trailer".to_string(),
        ));
    };
    let status_code = output[marker + STATUS_MARKER.len()..]
        .trim()
        .parse::<u16>()
        .map_err(|e| BrokerError::Transfer(format!("invalid status code from curl: {}", e)))?;

    let mut rest = output[..marker].strip_suffix('\n').unwrap_or(&output[..marker]);
    let mut last_block = None;

    // 跳过所有响应头块，只保留最后一跳
    while rest.starts_with("HTTP/") {
        let (block, remainder) = split_header_block(rest);
        last_block = Some(block);
        rest = remainder;
    }

    let mut response = HttpResponse {
        status_code,
        body: Some(rest.to_string()),
        ..Default::default()
    };
    if let Some(block) = last_block {
        let mut lines = block.lines().map(|line| line.trim_end_matches('\r'));
        response.status_line = lines.next().map(str::to_string);
        response.headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
    }
    Ok(response)
}

fn split_header_block(text: &str) -> (&str, &str) {
    let end = ["\r\n\r\n", "\n\n"]
        .iter()
        .filter_map(|separator| text.find(separator).map(|pos| (pos, separator.len())))
        .min_by_key(|(pos, _)| *pos);
    match end {
        Some((pos, len)) => (&text[..pos], &text[pos + len..]),
        None => (text, ""),
    }
}
