use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvoFlowError>;

/// 投递失败（由消息提供方返回）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConvoFlowError {
    #[error("structural error: {0}")]
    Structural(String),
    #[error("node `{node}` references unknown target `{target}`")]
    Reference { node: String, target: String },
    #[error("node `{node}` is malformed: {reason}")]
    NodeShape { node: String, reason: String },
    #[error("unknown node `{0}` in flow")]
    NodeNotFound(String),
    #[error("no executor registered for node kind `{0}`")]
    NoExecutor(String),
    #[error("unknown condition operator `{0}`")]
    UnknownOperator(String),
    #[error("unknown action type `{0}`")]
    UnknownAction(String),
    #[error("action `{action}` requires parameter `{param}`")]
    MissingParam { action: String, param: String },
    #[error("maximum steps {0} exceeded")]
    StepLimitExceeded(u32),
    #[error("flow `{0}` not registered")]
    FlowNotRegistered(String),
    #[error("flow `{0}` is not active")]
    FlowInactive(String),
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),
    #[error("cannot resume execution `{id}`: {reason}")]
    InvalidResume { id: String, reason: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvoFlowError {
    /// 稳定的错误码，写入执行记录的 `error` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            ConvoFlowError::Structural(_) => "structural_error",
            ConvoFlowError::Reference { .. } => "reference_error",
            ConvoFlowError::NodeShape { .. } => "node_shape_error",
            ConvoFlowError::NodeNotFound(_) => "node_not_found",
            ConvoFlowError::NoExecutor(_) => "no_executor",
            ConvoFlowError::UnknownOperator(_) => "unknown_operator",
            ConvoFlowError::UnknownAction(_) => "unknown_action",
            ConvoFlowError::MissingParam { .. } => "missing_param",
            ConvoFlowError::StepLimitExceeded(_) => "step_limit_exceeded",
            ConvoFlowError::FlowNotRegistered(_) => "flow_not_registered",
            ConvoFlowError::FlowInactive(_) => "flow_inactive",
            ConvoFlowError::ExecutionNotFound(_) => "execution_not_found",
            ConvoFlowError::InvalidResume { .. } => "invalid_resume",
            ConvoFlowError::Store(_) => "store_error",
            ConvoFlowError::Serialization(_) => "serialization_error",
            ConvoFlowError::Delivery(_) => "delivery_error",
            ConvoFlowError::Other(_) => "other",
        }
    }

    /// 配置类错误重试也不会成功
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ConvoFlowError::Structural(_)
                | ConvoFlowError::Reference { .. }
                | ConvoFlowError::NodeShape { .. }
                | ConvoFlowError::NodeNotFound(_)
                | ConvoFlowError::NoExecutor(_)
                | ConvoFlowError::UnknownOperator(_)
                | ConvoFlowError::UnknownAction(_)
                | ConvoFlowError::MissingParam { .. }
                | ConvoFlowError::StepLimitExceeded(_)
        )
    }
}

impl From<serde_json::Error> for ConvoFlowError {
    fn from(error: serde_json::Error) -> Self {
        ConvoFlowError::Serialization(error.to_string())
    }
}
