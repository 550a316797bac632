use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::constants::{actions, END};

/// Flow 节点类型定义

/// Flow 节点
///
/// 字段在解析时均为可选，缺失的必填字段由 [`FlowValidator`](super::FlowValidator)
/// 报告为 `NodeShape` 错误，而不是解析失败。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Message(MessageNode),
    QuickReply(QuickReplyNode),
    Condition(ConditionNode),
    Action(ActionNode),
    Wait(WaitNode),
    End,
}

/// 节点种类，执行器按种类注册
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Message,
    QuickReply,
    Condition,
    Action,
    Wait,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Message => "message",
            NodeKind::QuickReply => "quick_reply",
            NodeKind::Condition => "condition",
            NodeKind::Action => "action",
            NodeKind::Wait => "wait",
            NodeKind::End => "end",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickReplyNode {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<QuickReplyOption>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuickReplyOption {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionNode {
    #[serde(default)]
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_go: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_go: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionNode {
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go: Option<String>,
}

impl ActionNode {
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// `capture_email` 之类的动作需要等待用户输入
    pub fn captures_input(&self) -> bool {
        self.action_type == actions::CAPTURE_EMAIL
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitNode {
    #[serde(default)]
    pub duration_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go: Option<String>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Message(_) => NodeKind::Message,
            Node::QuickReply(_) => NodeKind::QuickReply,
            Node::Condition(_) => NodeKind::Condition,
            Node::Action(_) => NodeKind::Action,
            Node::Wait(_) => NodeKind::Wait,
            Node::End => NodeKind::End,
        }
    }

    /// 出边，按节点种类展开；缺省的 `go` 指向 `"end"`
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Node::Message(node) => vec![target_or_end(&node.go)],
            Node::QuickReply(node) => node
                .options
                .iter()
                .filter_map(|option| option.go.as_deref())
                .collect(),
            Node::Condition(node) => node
                .true_go
                .as_deref()
                .into_iter()
                .chain(node.false_go.as_deref())
                .collect(),
            Node::Action(node) => vec![target_or_end(&node.go)],
            Node::Wait(node) => vec![target_or_end(&node.go)],
            Node::End => Vec::new(),
        }
    }

    /// 同步遍历会在此节点停下
    pub fn is_suspend_point(&self) -> bool {
        match self {
            Node::QuickReply(_) | Node::Wait(_) | Node::End => true,
            Node::Action(action) => action.captures_input(),
            _ => false,
        }
    }
}

pub(crate) fn target_or_end(go: &Option<String>) -> &str {
    go.as_deref().filter(|target| !target.is_empty()).unwrap_or(END)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_camel_case_payloads() {
        let node: Node = serde_json::from_value(json!({
            "type": "condition",
            "expression": "score > 10",
            "trueGo": "a",
            "falseGo": "b"
        }))
        .unwrap();
        assert_eq!(node.kind(), NodeKind::Condition);
        assert_eq!(node.successors(), vec!["a", "b"]);
    }

    #[test]
    fn missing_go_defaults_to_end() {
        let node: Node = serde_json::from_value(json!({"type": "message", "text": "hi"})).unwrap();
        assert_eq!(node.successors(), vec![END]);
        assert!(!node.is_suspend_point());
    }

    #[test]
    fn capture_email_is_a_suspend_point() {
        let node: Node = serde_json::from_value(json!({
            "type": "action",
            "actionType": "capture_email",
            "go": "thanks"
        }))
        .unwrap();
        assert!(node.is_suspend_point());
    }
}
