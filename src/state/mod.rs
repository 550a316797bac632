// 执行状态模块

mod context;
mod effects;

pub use context::{ContextRecord, ExecutionContext};
pub use effects::{MessageContent, SideEffect};
