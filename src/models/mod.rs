// 数据模型模块

pub mod execution;
pub mod file;
pub mod settings;

pub use execution::{
    DispatchMode, Dispatched, ExecutionRecord, ExecutionSnapshot, ExecutionStatus,
    ExecutionSummary, Failure, FailureKind, Owner,
};
pub use file::{ReadRange, WriteMode};
pub use settings::{BrokerSettings, BusyPolicy};
