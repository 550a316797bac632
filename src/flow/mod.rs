// Flow 模块 - 流程定义、校验与加载

pub mod builder;
pub mod conditions;
pub mod constants;
pub mod loader;
pub mod nodes;
pub mod registry;
pub mod types;
pub mod validator;

// 重新导出核心类型
pub use builder::FlowBuilder;
pub use conditions::{Condition, Operator};
pub use loader::{load_flow_from_file, load_flow_from_str, load_flow_from_value};
pub use nodes::{
    ActionNode, ConditionNode, MessageNode, Node, NodeKind, QuickReplyNode, QuickReplyOption,
    WaitNode,
};
pub use registry::FlowRegistry;
pub use types::{FlowDefinition, FlowSpec};
pub use validator::{FlowValidator, ValidationReport, ValidationWarning};
