//! 执行调度
//!
//! `TriggerIntake` 把外部事件写成 `queued` 执行记录，
//! `ExecutionScheduler` 轮询并推进它们。

mod executor;
mod intake;

pub use executor::ExecutionScheduler;
pub use intake::{InboundReply, StartRequest, TriggerIntake};
