// 文件传输参数

use serde::{Deserialize, Serialize};

/// 写入模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// 读取范围（按字节）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "bytes", rename_all = "snake_case")]
pub enum ReadRange {
    #[default]
    Full,
    Head(usize),
    Tail(usize),
}

impl ReadRange {
    /// 截取内容
    pub fn apply(self, mut data: Vec<u8>) -> Vec<u8> {
        match self {
            ReadRange::Full => data,
            ReadRange::Head(n) => {
                data.truncate(n);
                data
            }
            ReadRange::Tail(n) => {
                let start = data.len().saturating_sub(n);
                data.split_off(start)
            }
        }
    }
}
