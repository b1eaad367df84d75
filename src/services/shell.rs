// Shell 文本工具：引用、环境变量前缀、命令行切分

/// 单引号包裹，内部单引号转义为 '\''
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '%' | '+'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 为远程命令添加非交互环境变量
/// 使用 export 使变量作用于整条命令行（包括 && / | 之后的命令）
pub fn with_env_prefix(env: &[(String, String)], command: &str) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let assignments: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{}={}", key, shell_quote(value)))
        .collect();
    format!("export {}; {}", assignments.join(" "), command)
}

/// 命令行中的一段简单命令
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// 去掉引号后的词列表
    pub words: Vec<String>,
    /// 前一个控制符是管道 `|` / `|&`，标准输入来自上一段
    pub piped: bool,
}

/// 按 shell 控制符（| ; & && || 换行 括号 反引号）切分命令
pub fn split_segments(command: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut piped = false;
    let mut chars = command.chars().peekable();

    fn end_word(words: &mut Vec<String>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            words.push(std::mem::take(word));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        _ => word.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    if escaped != '\n' {
                        word.push(escaped);
                    }
                }
            }
            '|' | ';' | '&' | '\n' | '(' | ')' | '`' => {
                end_word(&mut words, &mut word, &mut in_word);
                // 管道后的续行不改变管道关系
                if c == '\n' && words.is_empty() {
                    continue;
                }
                if !words.is_empty() {
                    segments.push(Segment {
                        words: std::mem::take(&mut words),
                        piped,
                    });
                }
                piped = match c {
                    '|' => match chars.peek() {
                        // ||
                        Some('|') => {
                            chars.next();
                            false
                        }
                        // |&
                        Some('&') => {
                            chars.next();
                            true
                        }
                        _ => true,
                    },
                    _ => false,
                };
            }
            c if c.is_whitespace() => end_word(&mut words, &mut word, &mut in_word),
            _ => {
                in_word = true;
                word.push(c);
            }
        }
    }

    end_word(&mut words, &mut word, &mut in_word);
    if !words.is_empty() {
        segments.push(Segment { words, piped });
    }
    segments
}
