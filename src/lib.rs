pub mod config;
pub mod error;
pub mod flow;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod utils;

pub use config::{EngineConfig, EnvConfig, QueueConfig, SchedulerConfig};
pub use error::{ConvoFlowError, DeliveryError, Result};
pub use flow::{
    load_flow_from_file, load_flow_from_str, load_flow_from_value, Condition, FlowBuilder,
    FlowDefinition, FlowRegistry, FlowSpec, FlowValidator, Node, NodeKind, Operator,
    ValidationReport, ValidationWarning,
};
pub use queue::{
    ApiHandler, ApiHandlerRegistry, ApiItemStatus, ApiQueueItem, ApiQueueWorker, BackoffPolicy,
    DeliveryReceipt, ExecutionStatus, FlowExecution, LoggingHandler, LoggingProvider,
    MessageDispatcher, MessageStatus, MessagingProvider, OutboundMessage, PollReport,
    ProviderRequest, QueueStores, RateLimiter, RetryDecision, SendMessageHandler,
};
#[cfg(feature = "http-provider")]
pub use queue::WebhookProvider;
pub use runtime::{ExecutorRegistry, FlowEngine, NodeExecutor, RunOutcome, StepOutcome};
pub use scheduler::{ExecutionScheduler, InboundReply, StartRequest, TriggerIntake};
pub use state::{ContextRecord, ExecutionContext, MessageContent, SideEffect};
pub use store::{MemoryStore, Record, RecordStore};
#[cfg(feature = "redis-store")]
pub use store::RedisStore;
pub use utils::logging;
