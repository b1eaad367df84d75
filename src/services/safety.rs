// 命令安全过滤
//
// 在调度前拒绝会挂起的交互式命令（编辑器、分页器、终端复用器、交互式 shell、REPL）。
// 只检查命令名，用于防止误操作导致的阻塞，不是沙箱。

use std::collections::HashSet;

use tracing::debug;

use super::shell::split_segments;
use crate::error::{BrokerError, Result};
use crate::models::settings::SafetySettings;

/// 递归解析 `sh -c '...'` 的最大深度
const MAX_NESTING: usize = 4;

/// 分类结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject(String),
}

/// 命令安全过滤器
pub struct SafetyFilter {
    enabled: bool,
    denylist: HashSet<String>,
    shells: HashSet<String>,
    repls: HashSet<String>,
    wrappers: HashSet<String>,
}

impl SafetyFilter {
    pub fn new(settings: &SafetySettings) -> Self {
        let set = |items: &[String]| items.iter().cloned().collect::<HashSet<_>>();
        Self {
            enabled: settings.enabled,
            denylist: set(&settings.denylist),
            shells: set(&settings.shells),
            repls: set(&settings.repls),
            wrappers: set(&settings.wrappers),
        }
    }

    /// 对命令分类（纯函数，不执行任何命令）
    pub fn classify(&self, command: &str) -> Verdict {
        if !self.enabled {
            return Verdict::Allow;
        }
        self.classify_nested(command, 0)
    }

    /// 分类并转换为错误
    pub fn check(&self, command: &str) -> Result<()> {
        match self.classify(command) {
            Verdict::Allow => Ok(()),
            Verdict::Reject(reason) => {
                debug!("[Safety] Rejected '{}': {}", command, reason);
                Err(BrokerError::UnsafeCommand {
                    command: command.to_string(),
                    reason,
                })
            }
        }
    }

    fn classify_nested(&self, command: &str, depth: usize) -> Verdict {
        for segment in split_segments(command) {
            let verdict = self.classify_segment(&segment.words, segment.piped, depth);
            if verdict != Verdict::Allow {
                return verdict;
            }
        }
        Verdict::Allow
    }

    /// piped 为 true 时标准输入来自管道，不会等待终端输入
    fn classify_segment(&self, words: &[String], piped: bool, depth: usize) -> Verdict {
        let mut idx = 0;

        // 前置的 VAR=value 赋值
        while idx < words.len() && is_assignment(&words[idx]) {
            idx += 1;
        }

        // 剥离 sudo / env / nohup 等包装命令
        while idx < words.len() {
            let wrapper = program_name(&words[idx]);
            if !self.wrappers.contains(wrapper) {
                break;
            }
            let (next, login_shell) = skip_wrapper_args(wrapper, words, idx + 1);
            if next >= words.len() {
                if login_shell {
                    return Verdict::Reject(format!(
                        "'{}' without a command opens an interactive shell",
                        words[idx..].join(" ")
                    ));
                }
                return Verdict::Allow;
            }
            idx = next;
        }

        let Some(first) = words.get(idx) else {
            return Verdict::Allow;
        };
        let program = program_name(first);
        let args = &words[idx + 1..];

        if self.denylist.contains(program) {
            return Verdict::Reject(format!(
                "'{}' is an interactive program (editor, pager or terminal multiplexer)",
                program
            ));
        }

        if program == "top" && !args.iter().any(|a| is_short_flag_with(a, 'b')) {
            return Verdict::Reject("'top' is only allowed in batch mode (-b)".to_string());
        }

        if program == "su" && !args.iter().any(|a| a == "-c" || a == "--command") {
            return Verdict::Reject("'su' without -c opens an interactive shell".to_string());
        }

        if program == "ssh" && ssh_positionals(args) <= 1 {
            return Verdict::Reject("'ssh' without a remote command opens an interactive shell".to_string());
        }

        if self.shells.contains(program) {
            return self.classify_shell(program, args, piped, depth);
        }

        if self.repls.contains(program) && args.is_empty() && !piped {
            return Verdict::Reject(format!("'{}' without arguments starts an interactive REPL", program));
        }

        Verdict::Allow
    }

    fn classify_shell(&self, program: &str, args: &[String], piped: bool, depth: usize) -> Verdict {
        if let Some(pos) = args.iter().position(|a| a == "-c" || is_short_flag_with(a, 'c')) {
            return match args.get(pos + 1) {
                Some(inner) if depth < MAX_NESTING => self.classify_nested(inner, depth + 1),
                Some(_) => Verdict::Reject("shell nesting too deep to inspect".to_string()),
                None => Verdict::Allow,
            };
        }

        let interactive_flag = args.iter().any(|a| is_short_flag_with(a, 'i'));
        let has_script = args.iter().any(|a| !a.starts_with('-'));
        let reads_stdin = piped || args.iter().any(|a| is_short_flag_with(a, 's'));
        if interactive_flag || (!has_script && !reads_stdin) {
            return Verdict::Reject(format!("'{}' would start an interactive shell", program));
        }
        Verdict::Allow
    }
}

/// 取命令的 basename（/usr/bin/vim → vim）
fn program_name(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// 是否为包含指定字母的短选项组（-b、-bn1、-ic）
fn is_short_flag_with(word: &str, flag: char) -> bool {
    word.len() > 1
        && word.starts_with('-')
        && !word.starts_with("--")
        && word[1..].chars().take_while(|c| c.is_ascii_alphabetic()).any(|c| c == flag)
}

/// 跳过包装命令自身的参数，返回 (被包装命令的位置, 是否请求登录 shell)
fn skip_wrapper_args(wrapper: &str, words: &[String], mut idx: usize) -> (usize, bool) {
    // 需要额外参数值的选项
    let valued: &[&str] = match wrapper {
        "sudo" | "doas" => &["-u", "-g", "-U", "-C", "-p", "-r", "-t", "-D", "-R", "-h"],
        "env" => &["-u", "-C", "-S"],
        "nice" => &["-n"],
        "timeout" => &["-s", "-k"],
        _ => &[],
    };
    let mut login_shell = false;

    while idx < words.len() {
        let word = &words[idx];
        if word == "--" {
            idx += 1;
            break;
        }
        if word.starts_with('-') && word.len() > 1 {
            if matches!(wrapper, "sudo" | "doas")
                && (is_short_flag_with(word, 'i') || is_short_flag_with(word, 's'))
            {
                login_shell = true;
            }
            idx += if valued.contains(&word.as_str()) { 2 } else { 1 };
            continue;
        }
        if wrapper == "env" && is_assignment(word) {
            idx += 1;
            continue;
        }
        break;
    }

    // timeout 的第一个位置参数是时长
    if wrapper == "timeout" && idx < words.len() {
        idx += 1;
    }

    (idx, login_shell)
}

/// 统计 ssh 的位置参数（主机 + 远程命令）
fn ssh_positionals(args: &[String]) -> usize {
    const VALUED: &[&str] = &[
        "-p", "-i", "-l", "-o", "-F", "-J", "-L", "-R", "-D", "-W", "-b", "-c", "-E", "-e", "-m",
        "-O", "-Q", "-S", "-w", "-B", "-I",
    ];
    let mut count = 0;
    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        if arg.starts_with('-') && arg.len() > 1 {
            idx += if VALUED.contains(&arg.as_str()) { 2 } else { 1 };
            continue;
        }
        count += 1;
        idx += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SafetyFilter {
        SafetyFilter::new(&SafetySettings::default())
    }

    fn rejected(command: &str) -> bool {
        matches!(filter().classify(command), Verdict::Reject(_))
    }

    #[test]
    fn test_rejects_editors_and_pagers() {
        assert!(rejected("vim /etc/hosts"));
        assert!(rejected("less file.txt"));
        assert!(rejected("/usr/bin/nano notes"));
        assert!(rejected("tmux attach"));
        assert!(rejected("cat log | less"));
        assert!(rejected("cd /etc && vi hosts"));
        assert!(rejected("htop"));
    }

    #[test]
    fn test_rejects_wrapped_commands() {
        assert!(rejected("sudo vim /etc/hosts"));
        assert!(rejected("sudo -u postgres less /var/log/x"));
        assert!(rejected("EDITOR=x env TERM=xterm nano a"));
        assert!(rejected("nohup nice -n 5 vim"));
        assert!(rejected("timeout 10 less file"));
        assert!(rejected("sudo -i"));
        assert!(rejected("sudo su"));
    }

    #[test]
    fn test_interactive_shells() {
        assert!(rejected("bash"));
        assert!(rejected("bash -i"));
        assert!(rejected("zsh -l"));
        assert!(rejected("sh -c 'vim /tmp/x'"));
        assert!(rejected("bash -lc \"cat a | less\""));
        assert!(rejected("su root"));
        assert!(rejected("ssh other-host"));
        assert!(rejected("python3"));

        assert!(!rejected("bash deploy.sh"));
        assert!(!rejected("sh -c 'echo hello'"));
        assert!(!rejected("su postgres -c 'psql -c \"select 1\"'"));
        assert!(!rejected("ssh other-host uptime"));
        assert!(!rejected("python3 script.py"));
        assert!(!rejected("bash -s < install.sh"));
    }

    #[test]
    fn test_piped_shells_and_repls() {
        assert!(!rejected("curl -fsSL https://get.docker.com | sh"));
        assert!(!rejected("echo 'print(1)' | python3"));
        assert!(!rejected("cat setup.sql | psql"));
        assert!(!rejected("curl -s https://example.com/install | sudo bash"));
        assert!(!rejected("make |& sh"));

        assert!(rejected("cat script | bash -i"));
        assert!(rejected("test -f a || sh"));
        assert!(rejected("echo hi; python3"));
        assert!(rejected("cat log | less"));
    }

    #[test]
    fn test_allows_regular_commands() {
        assert!(!rejected("echo hello"));
        assert!(!rejected("ls -la /var/log | grep syslog"));
        assert!(!rejected("sudo systemctl restart nginx"));
        assert!(!rejected("top -b -n 1"));
        assert!(!rejected("top -bn1"));
        assert!(!rejected("echo 'vim is great'"));
        assert!(!rejected("grep -r less src/"));
        assert!(!rejected("sudo -v"));
        assert!(rejected("top"));
    }

    #[test]
    fn test_check_returns_unsafe_command_error() {
        let err = filter().check("sudo vim /etc/hosts").unwrap_err();
        match err {
            BrokerError::UnsafeCommand { command, reason } => {
                assert_eq!(command, "sudo vim /etc/hosts");
                assert!(reason.contains("vim"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_configurable_tables() {
        let settings = SafetySettings {
            denylist: vec!["deploy-tui".to_string()],
            ..Default::default()
        };
        let filter = SafetyFilter::new(&settings);
        assert!(matches!(filter.classify("deploy-tui --env prod"), Verdict::Reject(_)));
        assert_eq!(filter.classify("vim a"), Verdict::Allow);

        let disabled = SafetyFilter::new(&SafetySettings {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(disabled.classify("vim a"), Verdict::Allow);
    }
}
