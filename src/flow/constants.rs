/// 流程相关的常量定义
///
/// 统一管理保留变量名、动作类型等字符串常量

/// 终止哨兵，任何 `go` 都可以指向它
pub const END: &str = "end";

/// 上下文中的保留变量
pub mod vars {
    pub const TAGS: &str = "_tags";
    pub const LAST_MESSAGE: &str = "_lastMessage";
    pub const QUICK_REPLY_OPTIONS: &str = "_quickReplyOptions";
    pub const AWAITING_INPUT: &str = "_awaitingInput";
    pub const AWAITING_INPUT_VARIABLE: &str = "_awaitingInputVariable";
    pub const WAIT_UNTIL: &str = "_waitUntil";
    pub const WAIT_DURATION_SECONDS: &str = "_waitDurationSeconds";
    pub const HTTP_REQUEST: &str = "_httpRequest";
    pub const TEAM_NOTIFICATION: &str = "_teamNotification";
    pub const FLOW_COMPLETED: &str = "_flowCompleted";
    pub const COMPLETED_AT: &str = "_completedAt";
}

/// Action 节点的动作类型
pub mod actions {
    pub const ADD_TAG: &str = "add_tag";
    pub const REMOVE_TAG: &str = "remove_tag";
    pub const SET_VARIABLE: &str = "set_variable";
    pub const HTTP_REQUEST: &str = "http_request";
    pub const NOTIFY_TEAM: &str = "notify_team";
    pub const CAPTURE_EMAIL: &str = "capture_email";

    /// `capture_email` 默认写入的变量
    pub const DEFAULT_CAPTURE_VARIABLE: &str = "email";
}

/// 外部 API 队列的调用类型
pub mod api_types {
    pub const SEND_MESSAGE: &str = "send_message";
    pub const HTTP_REQUEST: &str = "http_request";
    pub const NOTIFY_TEAM: &str = "notify_team";
}

/// API 队列 payload 字段名
pub mod fields {
    pub const MESSAGE_QUEUE_ID: &str = "message_queue_id";
    pub const RECIPIENT_ID: &str = "recipient_id";
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const CONTENT: &str = "content";
}
