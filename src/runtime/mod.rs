// 运行时：节点执行器与引擎

pub mod engine;
pub mod executors;

pub use engine::{FlowEngine, RunOutcome};
pub use executors::{
    ActionExecutor, ConditionExecutor, EndExecutor, ExecutorRegistry, MessageExecutor,
    NodeExecutor, QuickReplyExecutor, ResumePoint, StepOutcome, WaitExecutor,
};
