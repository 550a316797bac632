use serde_json::{Map, Value};

use super::nodes::{
    ActionNode, ConditionNode, MessageNode, Node, QuickReplyNode, QuickReplyOption, WaitNode,
};
use super::types::FlowSpec;

/// FlowSpec 构建器
pub struct FlowBuilder {
    spec: FlowSpec,
}

impl FlowBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            spec: FlowSpec {
                version: version.into(),
                ..FlowSpec::default()
            },
        }
    }

    pub fn set_entry(&mut self, entry: impl Into<String>) -> &mut Self {
        self.spec.entry = entry.into();
        self
    }

    pub fn add_node(&mut self, id: impl Into<String>, node: Node) -> &mut Self {
        self.spec.nodes.insert(id.into(), node);
        self
    }

    pub fn add_message(
        &mut self,
        id: impl Into<String>,
        text: impl Into<String>,
        go: impl Into<String>,
    ) -> &mut Self {
        self.add_node(
            id,
            Node::Message(MessageNode {
                text: text.into(),
                go: Some(go.into()),
            }),
        )
    }

    pub fn add_quick_reply<T, G>(
        &mut self,
        id: impl Into<String>,
        text: impl Into<String>,
        options: impl IntoIterator<Item = (T, G)>,
    ) -> &mut Self
    where
        T: Into<String>,
        G: Into<String>,
    {
        let options = options
            .into_iter()
            .map(|(text, go)| QuickReplyOption {
                text: text.into(),
                go: Some(go.into()),
            })
            .collect();
        self.add_node(
            id,
            Node::QuickReply(QuickReplyNode {
                text: text.into(),
                options,
            }),
        )
    }

    pub fn add_condition(
        &mut self,
        id: impl Into<String>,
        expression: impl Into<String>,
        true_go: impl Into<String>,
        false_go: impl Into<String>,
    ) -> &mut Self {
        self.add_node(
            id,
            Node::Condition(ConditionNode {
                expression: expression.into(),
                true_go: Some(true_go.into()),
                false_go: Some(false_go.into()),
            }),
        )
    }

    pub fn add_action(
        &mut self,
        id: impl Into<String>,
        action_type: impl Into<String>,
        params: Value,
        go: impl Into<String>,
    ) -> &mut Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.add_node(
            id,
            Node::Action(ActionNode {
                action_type: action_type.into(),
                params,
                go: Some(go.into()),
            }),
        )
    }

    pub fn add_wait(
        &mut self,
        id: impl Into<String>,
        duration_seconds: i64,
        go: impl Into<String>,
    ) -> &mut Self {
        self.add_node(
            id,
            Node::Wait(WaitNode {
                duration_seconds,
                go: Some(go.into()),
            }),
        )
    }

    pub fn add_end(&mut self, id: impl Into<String>) -> &mut Self {
        self.add_node(id, Node::End)
    }

    pub fn build(&self) -> FlowSpec {
        self.spec.clone()
    }
}
