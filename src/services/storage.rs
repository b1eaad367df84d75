// 本地配置持久化

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::BrokerSettings;

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/sshbroker
/// Linux: ~/.config/sshbroker
/// Windows: C:\Users\<用户名>\AppData\Roaming\sshbroker
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("sshbroker");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).context("无法创建配置目录")?;
    }
    Ok(config_dir)
}

/// 获取设置配置文件路径
pub fn get_settings_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// 加载设置（默认位置）
pub fn load_settings() -> Result<BrokerSettings> {
    load_settings_from(&get_settings_file()?)
}

/// 从指定文件加载设置，文件不存在时返回默认值
pub fn load_settings_from(path: &Path) -> Result<BrokerSettings> {
    if !path.exists() {
        return Ok(BrokerSettings::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("无法读取设置配置文件: {}", path.display()))?;
    let settings: BrokerSettings = serde_json::from_str(&content)
        .with_context(|| format!("无法解析设置配置文件: {}", path.display()))?;
    Ok(settings)
}

/// 保存设置（默认位置）
pub fn save_settings(settings: &BrokerSettings) -> Result<()> {
    save_settings_to(&get_settings_file()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &BrokerSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("无法创建配置目录")?;
    }
    let content = serde_json::to_string_pretty(settings).context("无法序列化设置配置")?;
    fs::write(path, content).context("无法写入设置配置文件")?;
    Ok(())
}
