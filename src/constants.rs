// 常量定义

/// 本地执行的所有者标识
pub const LOCAL_OWNER: &str = "local";

pub mod defaults {
    pub const SSH_PORT: u16 = 22;

    /// 禁止分页器、交互式安装提示
    pub const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
        ("PAGER", "cat"),
        ("SYSTEMD_PAGER", ""),
        ("GIT_PAGER", "cat"),
        ("DEBIAN_FRONTEND", "noninteractive"),
    ];

    // 编辑器 / 分页器 / 终端复用器 / 全屏监控
    pub const DENYLIST: &[&str] = &[
        "vi", "vim", "nvim", "view", "vimdiff", "nano", "pico", "emacs", "joe", "micro", "ed",
        "less", "more", "most", "man", "tmux", "screen", "byobu", "zellij", "htop", "btop",
        "atop", "iotop", "nmtui", "watch", "mc", "ranger",
    ];

    pub const SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "ksh", "csh", "tcsh"];

    pub const REPLS: &[&str] = &[
        "python", "python3", "python2", "ipython", "node", "irb", "ghci", "lua", "R", "mysql",
        "psql", "sqlite3", "redis-cli", "ftp", "telnet",
    ];

    pub const WRAPPERS: &[&str] = &[
        "sudo", "doas", "env", "nohup", "time", "nice", "exec", "command", "stdbuf", "timeout",
    ];
}
