// 服务模块

pub mod curl;
pub mod executor;
pub mod local;
pub mod safety;
pub mod sftp;
pub mod shell;
pub mod storage;
pub mod tracker;
pub mod transfer;

pub use curl::{CurlOutput, CurlRequest, HttpResponse};
pub use executor::CommandExecutor;
pub use local::LocalRunner;
pub use safety::{SafetyFilter, Verdict};
pub use tracker::{OutputTracker, RecordWriter};
pub use transfer::FileTransfer;
