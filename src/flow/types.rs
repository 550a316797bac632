use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::nodes::Node;

/// Flow 核心类型定义

/// 不可变的流程图描述
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub nodes: HashMap<String, Node>,
}

impl FlowSpec {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.nodes
            .get(id)
            .map(|node| node.successors())
            .unwrap_or_default()
    }

    /// 排序后的节点 id，保证遍历结果稳定
    pub fn sorted_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// 已注册的流程（带元数据）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub spec: FlowSpec,
    #[serde(default = "FlowDefinition::default_active")]
    pub active: bool,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, spec: FlowSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            spec,
            active: true,
        }
    }

    fn default_active() -> bool {
        true
    }
}
