use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ConvoFlowError, Result};
use crate::flow::types::{FlowDefinition, FlowSpec};
use crate::flow::validator::{FlowValidator, ValidationReport};

/// Flow 注册表
///
/// 只有通过校验的流程才能注册；停用的流程不会再启动新的执行，
/// 但不会打断正在进行的执行。
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, flow: FlowDefinition) -> Result<ValidationReport> {
        let mut report = FlowValidator::new().validate(&flow.spec);
        if let Some(error) = report.error.take() {
            warn!(flow_id = %flow.id, error = %error, "refusing to register invalid flow");
            return Err(error);
        }
        for warning in &report.warnings {
            warn!(flow_id = %flow.id, warning = %warning, "flow validation warning");
        }
        info!(flow_id = %flow.id, nodes = flow.spec.nodes.len(), "flow registered");
        self.flows.write().insert(flow.id.clone(), Arc::new(flow));
        Ok(report)
    }

    pub fn get(&self, id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.read().get(id).cloned()
    }

    pub fn spec(&self, id: &str) -> Result<Arc<FlowDefinition>> {
        self.get(id)
            .ok_or_else(|| ConvoFlowError::FlowNotRegistered(id.to_string()))
    }

    /// 取出可以启动新执行的流程
    pub fn active(&self, id: &str) -> Result<Arc<FlowDefinition>> {
        let flow = self.spec(id)?;
        if flow.active {
            Ok(flow)
        } else {
            Err(ConvoFlowError::FlowInactive(id.to_string()))
        }
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut flows = self.flows.write();
        let flow = flows
            .get_mut(id)
            .ok_or_else(|| ConvoFlowError::FlowNotRegistered(id.to_string()))?;
        Arc::make_mut(flow).active = active;
        info!(flow_id = %id, active, "flow activation changed");
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<FlowDefinition>> {
        self.flows.read().values().cloned().collect()
    }

    pub fn register_spec(&self, id: &str, spec: FlowSpec) -> Result<ValidationReport> {
        self.register(FlowDefinition::new(id, id, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;

    fn greeting() -> FlowSpec {
        let mut builder = FlowBuilder::new("1");
        builder.set_entry("hello").add_message("hello", "Hi", "done").add_end("done");
        builder.build()
    }

    #[test]
    fn invalid_flows_are_rejected() {
        let registry = FlowRegistry::new();
        let mut spec = greeting();
        spec.entry = "missing".into();
        assert!(registry.register_spec("broken", spec).is_err());
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn deactivated_flow_cannot_start() {
        let registry = FlowRegistry::new();
        registry.register_spec("welcome", greeting()).unwrap();
        assert!(registry.active("welcome").is_ok());
        registry.set_active("welcome", false).unwrap();
        assert!(matches!(
            registry.active("welcome"),
            Err(ConvoFlowError::FlowInactive(_))
        ));
        assert!(registry.spec("welcome").is_ok());
    }
}
