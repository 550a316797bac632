use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{ConvoFlowError, Result};
use crate::flow::types::FlowSpec;

/// 从 JSON 字符串加载流程
pub fn load_flow_from_str(input: &str) -> Result<FlowSpec> {
    let value: Value = serde_json::from_str(input)?;
    load_flow_from_value(value)
}

/// 从 JSON 值加载流程
///
/// 兼容外层包了一层 `{"spec": {...}}` 的导出格式。
pub fn load_flow_from_value(value: Value) -> Result<FlowSpec> {
    let value = match value {
        Value::Object(mut map) if map.contains_key("spec") && !map.contains_key("nodes") => {
            map.remove("spec").unwrap_or(Value::Null)
        }
        other => other,
    };
    if !value.is_object() {
        return Err(ConvoFlowError::Structural(
            "flow specification must be a JSON object".into(),
        ));
    }
    Ok(serde_json::from_value(value)?)
}

pub fn load_flow_from_file(path: impl AsRef<Path>) -> Result<FlowSpec> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        ConvoFlowError::Other(anyhow::anyhow!(
            "failed to read flow file `{}`: {}",
            path.display(),
            e
        ))
    })?;
    load_flow_from_str(&content)
}
