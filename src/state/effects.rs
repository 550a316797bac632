use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::flow::constants::api_types;

/// 执行器产生的副作用，由调度器落库后异步完成
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    SendMessage {
        node_id: String,
        content: MessageContent,
    },
    HttpRequest {
        node_id: String,
        request: Value,
    },
    NotifyTeam {
        node_id: String,
        message: String,
    },
}

/// 待发送的消息内容
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quick_replies: Vec::new(),
        }
    }
}

impl SideEffect {
    pub fn node_id(&self) -> &str {
        match self {
            SideEffect::SendMessage { node_id, .. }
            | SideEffect::HttpRequest { node_id, .. }
            | SideEffect::NotifyTeam { node_id, .. } => node_id,
        }
    }

    /// 非消息类副作用直接进入外部 API 队列
    pub fn api_call(&self) -> Option<(&'static str, Value)> {
        match self {
            SideEffect::SendMessage { .. } => None,
            SideEffect::HttpRequest { node_id, request } => Some((
                api_types::HTTP_REQUEST,
                json!({ "node_id": node_id, "request": request }),
            )),
            SideEffect::NotifyTeam { node_id, message } => Some((
                api_types::NOTIFY_TEAM,
                json!({ "node_id": node_id, "message": message }),
            )),
        }
    }
}
