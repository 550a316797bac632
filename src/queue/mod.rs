// 持久化队列：出站消息队列与外部 API 队列

pub mod api;
pub mod backoff;
pub mod outbound;
pub mod rate_limit;
pub mod records;

use std::sync::Arc;

use crate::store::{MemoryStore, RecordStore};

pub use api::{
    ApiHandler, ApiHandlerRegistry, ApiQueueWorker, DeliveryReceipt, LoggingHandler,
    LoggingProvider, MessagingProvider, ProviderRequest, SendMessageHandler,
};
#[cfg(feature = "http-provider")]
pub use api::WebhookProvider;
pub use backoff::{BackoffPolicy, RetryDecision};
pub use outbound::MessageDispatcher;
pub use rate_limit::RateLimiter;
pub use records::{
    new_id, ApiItemStatus, ApiQueueItem, ExecutionStatus, FlowExecution, MessageStatus,
    OutboundMessage,
};

/// 三张队列表
#[derive(Clone)]
pub struct QueueStores {
    pub executions: Arc<dyn RecordStore<FlowExecution>>,
    pub messages: Arc<dyn RecordStore<OutboundMessage>>,
    pub api_queue: Arc<dyn RecordStore<ApiQueueItem>>,
}

impl QueueStores {
    pub fn in_memory() -> Self {
        Self {
            executions: Arc::new(MemoryStore::new()),
            messages: Arc::new(MemoryStore::new()),
            api_queue: Arc::new(MemoryStore::new()),
        }
    }
}

/// 单轮轮询的统计
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// 成功取得租约的记录数
    pub leased: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// 因限流留到下一轮的记录数
    pub deferred: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.leased == 0 && self.deferred == 0
    }

    pub fn merge(&mut self, other: PollReport) {
        self.leased += other.leased;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }
}
