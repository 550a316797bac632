use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::effects::SideEffect;
use crate::flow::constants::vars;

/// 单次执行的可变状态
///
/// 只属于一个正在进行的执行，不在并发步骤之间共享。
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub flow_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub current_node_id: String,
    pub started_at: DateTime<Utc>,
    variables: HashMap<String, Value>,
    execution_path: Vec<String>,
    effects: Vec<SideEffect>,
}

/// 持久化用的上下文快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub flow_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub current_node_id: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub execution_path: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        flow_id: impl Into<String>,
        conversation_id: impl Into<String>,
        contact_id: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            conversation_id: conversation_id.into(),
            contact_id: contact_id.into(),
            current_node_id: entry.into(),
            started_at: Utc::now(),
            variables: HashMap::new(),
            execution_path: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn has_variable(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn remove_variable(&mut self, key: &str) -> Option<Value> {
        self.variables.remove(key)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn execution_path(&self) -> &[String] {
        &self.execution_path
    }

    pub fn record_step(&mut self, node_id: &str) {
        self.current_node_id = node_id.to_string();
        self.execution_path.push(node_id.to_string());
    }

    /// 替换 `{{identifier}}`；未绑定的占位符原样保留
    pub fn interpolate(&self, text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let replacement = after_open.find("}}").and_then(|end| {
                let name = after_open[..end].trim();
                if !is_identifier(name) {
                    return None;
                }
                self.variables
                    .get(name)
                    .map(|value| (render_value(value), end + 2))
            });
            match replacement {
                Some((value, consumed)) => {
                    output.push_str(&value);
                    rest = &after_open[consumed..];
                }
                None => {
                    output.push_str("{{");
                    rest = after_open;
                }
            }
        }
        output.push_str(rest);
        output
    }

    pub fn tags(&self) -> Vec<String> {
        match self.variables.get(vars::TAGS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// 重复添加不会产生重复标签
    pub fn add_tag(&mut self, tag: &str) {
        let mut tags = self.tags();
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
        self.variables.insert(vars::TAGS.to_string(), Value::from(tags));
    }

    pub fn remove_tag(&mut self, tag: &str) {
        let mut tags = self.tags();
        tags.retain(|existing| existing != tag);
        self.variables.insert(vars::TAGS.to_string(), Value::from(tags));
    }

    pub fn push_effect(&mut self, effect: SideEffect) {
        self.effects.push(effect);
    }

    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }

    pub fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn to_record(&self) -> ContextRecord {
        ContextRecord {
            flow_id: self.flow_id.clone(),
            conversation_id: self.conversation_id.clone(),
            contact_id: self.contact_id.clone(),
            current_node_id: self.current_node_id.clone(),
            variables: self.variables.clone(),
            execution_path: self.execution_path.clone(),
            started_at: self.started_at,
        }
    }

    pub fn from_record(record: ContextRecord) -> Self {
        Self {
            flow_id: record.flow_id,
            conversation_id: record.conversation_id,
            contact_id: record.contact_id,
            current_node_id: record.current_node_id,
            started_at: record.started_at,
            variables: record.variables,
            execution_path: record.execution_path,
            effects: Vec::new(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("flow", "conv", "contact", "n1");
        ctx.set_variable("name", "Ava");
        ctx.set_variable("score", 15);
        ctx
    }

    #[test]
    fn interpolates_bound_variables() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("Hi {{name}}!"), "Hi Ava!");
        assert_eq!(ctx.interpolate("{{ name }} scored {{score}}"), "Ava scored 15");
    }

    #[test]
    fn unknown_placeholders_are_left_verbatim() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("Hi {{nickname}}"), "Hi {{nickname}}");
        assert_eq!(ctx.interpolate("{{ {{name}}"), "{{ Ava");
        assert_eq!(ctx.interpolate("unclosed {{name"), "unclosed {{name");
        assert_eq!(ctx.interpolate("{{first-name}}"), "{{first-name}}");
    }

    #[test]
    fn interpolation_is_idempotent_once_bound() {
        let ctx = ctx();
        let once = ctx.interpolate("Hello {{name}}, {{score}} points, {{missing}}");
        assert_eq!(ctx.interpolate(&once), once);
    }

    #[test]
    fn last_write_wins() {
        let mut ctx = ctx();
        ctx.set_variable("name", "Bo");
        assert_eq!(ctx.get_variable("name"), Some(&json!("Bo")));
        ctx.set_variable("flag", Value::Null);
        assert!(ctx.has_variable("flag"));
        assert!(!ctx.has_variable("other"));
    }

    #[test]
    fn tags_are_idempotent() {
        let mut ctx = ctx();
        ctx.add_tag("vip");
        ctx.add_tag("vip");
        ctx.remove_tag("missing");
        assert_eq!(ctx.tags(), vec!["vip".to_string()]);
        ctx.remove_tag("vip");
        assert!(ctx.tags().is_empty());
    }

    #[test]
    fn record_round_trip_is_lossless() {
        let mut ctx = ctx();
        ctx.set_variable("nested", json!({"a": [1, 2.5, null, true], "b": {"c": "d"}}));
        ctx.set_variable("nothing", Value::Null);
        ctx.record_step("n1");

        let encoded = serde_json::to_string(&ctx.to_record()).unwrap();
        let decoded: ContextRecord = serde_json::from_str(&encoded).unwrap();
        let restored = ExecutionContext::from_record(decoded);

        assert_eq!(restored.variables(), ctx.variables());
        assert_eq!(restored.execution_path(), ["n1".to_string()]);
        assert_eq!(restored.started_at, ctx.started_at);
    }
}
