use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::state::{ContextRecord, ExecutionContext, MessageContent};
use crate::store::Record;

/// 队列记录类型定义

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 流程执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Processing,
    WaitingInput,
    Completed,
    Failed,
}

/// 持久化的流程执行
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: String,
    pub flow_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    #[serde(default)]
    pub account_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub version: u64,
    pub current_node_id: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub execution_path: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FlowExecution {
    pub fn new(
        flow_id: impl Into<String>,
        conversation_id: impl Into<String>,
        contact_id: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            flow_id: flow_id.into(),
            conversation_id: conversation_id.into(),
            contact_id: contact_id.into(),
            account_id: String::new(),
            status: ExecutionStatus::Queued,
            version: 0,
            current_node_id: entry.into(),
            variables: HashMap::new(),
            execution_path: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            scheduled_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// 从持久化字段恢复执行上下文
    pub fn to_context(&self) -> ExecutionContext {
        ExecutionContext::from_record(ContextRecord {
            flow_id: self.flow_id.clone(),
            conversation_id: self.conversation_id.clone(),
            contact_id: self.contact_id.clone(),
            current_node_id: self.current_node_id.clone(),
            variables: self.variables.clone(),
            execution_path: self.execution_path.clone(),
            started_at: self.started_at.unwrap_or(self.created_at),
        })
    }

    pub fn apply_context(&mut self, ctx: &ExecutionContext) {
        let record = ctx.to_record();
        self.current_node_id = record.current_node_id;
        self.variables = record.variables;
        self.execution_path = record.execution_path;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed
        )
    }
}

impl Record for FlowExecution {
    type Status = ExecutionStatus;
    const TABLE: &'static str = "flow_executions";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// 出站消息状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

/// 出站消息队列记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub flow_execution_id: Option<String>,
    #[serde(default)]
    pub account_id: String,
    pub recipient_id: String,
    pub content: MessageContent,
    pub status: MessageStatus,
    #[serde(default)]
    pub version: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub api_queue_item_id: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: MessageContent,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            flow_execution_id: None,
            account_id: String::new(),
            recipient_id: recipient_id.into(),
            content,
            status: MessageStatus::Pending,
            version: 0,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: now,
            created_at: now,
            api_queue_item_id: None,
            sent_at: None,
            error: None,
        }
    }

    pub fn for_execution(mut self, execution: &FlowExecution) -> Self {
        self.flow_execution_id = Some(execution.id.clone());
        self.account_id = execution.account_id.clone();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Record for OutboundMessage {
    type Status = MessageStatus;
    const TABLE: &'static str = "message_queue";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> MessageStatus {
        self.status
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// 外部 API 队列状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// 外部 API 队列记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiQueueItem {
    pub id: String,
    pub account_id: String,
    pub api_type: String,
    pub payload: Value,
    pub priority: i32,
    pub status: ApiItemStatus,
    #[serde(default)]
    pub version: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiQueueItem {
    pub fn new(
        account_id: impl Into<String>,
        api_type: impl Into<String>,
        payload: Value,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            account_id: account_id.into(),
            api_type: api_type.into(),
            payload,
            priority,
            status: ApiItemStatus::Pending,
            version: 0,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: now,
            created_at: now,
            completed_at: None,
            response: None,
            error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

impl Record for ApiQueueItem {
    type Status = ApiItemStatus;
    const TABLE: &'static str = "api_queue";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ApiItemStatus {
        self.status
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
