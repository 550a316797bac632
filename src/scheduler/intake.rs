use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::{ConvoFlowError, Result};
use crate::flow::constants::{actions, vars};
use crate::flow::nodes::{target_or_end, Node, QuickReplyNode};
use crate::flow::FlowRegistry;
use crate::queue::{ExecutionStatus, FlowExecution};
use crate::store::RecordStore;

/// 启动一次执行的外部事件
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub flow_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// 定时触发；缺省为立即执行
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl StartRequest {
    pub fn new(
        flow_id: impl Into<String>,
        conversation_id: impl Into<String>,
        contact_id: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            conversation_id: conversation_id.into(),
            contact_id: contact_id.into(),
            ..Self::default()
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// 用户的入站回复
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundReply {
    #[serde(default)]
    pub text: String,
    /// 快捷回复按钮的序号，优先于文本匹配
    #[serde(default)]
    pub option_index: Option<usize>,
}

impl InboundReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            option_index: None,
        }
    }

    pub fn option(index: usize) -> Self {
        Self {
            text: String::new(),
            option_index: Some(index),
        }
    }
}

/// 触发入口：创建或恢复执行记录
pub struct TriggerIntake {
    flows: Arc<FlowRegistry>,
    executions: Arc<dyn RecordStore<FlowExecution>>,
    config: SchedulerConfig,
}

impl TriggerIntake {
    pub fn new(
        flows: Arc<FlowRegistry>,
        executions: Arc<dyn RecordStore<FlowExecution>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            flows,
            executions,
            config,
        }
    }

    pub async fn start(&self, request: StartRequest) -> Result<FlowExecution> {
        let flow = self.flows.active(&request.flow_id)?;
        let mut execution = FlowExecution::new(
            flow.id.clone(),
            request.conversation_id,
            request.contact_id,
            flow.spec.entry.clone(),
        )
        .with_account(request.account_id)
        .with_variables(request.variables)
        .with_max_retries(self.config.default_max_retries);
        if let Some(at) = request.scheduled_at {
            execution = execution.scheduled_for(at);
        }
        self.executions.insert(execution.clone()).await?;
        info!(
            execution_id = %execution.id,
            flow_id = %execution.flow_id,
            conversation_id = %execution.conversation_id,
            "execution queued"
        );
        Ok(execution)
    }

    /// 把 `waiting_input` 的执行重新排队到 `next_node_id`
    pub async fn resume(
        &self,
        execution_id: &str,
        next_node_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<FlowExecution> {
        let execution = self.waiting(execution_id).await?;
        let mut resumed = execution.clone();
        resumed.status = ExecutionStatus::Queued;
        resumed.current_node_id = next_node_id.to_string();
        resumed.scheduled_at = Utc::now();
        resumed.variables.remove(vars::AWAITING_INPUT);
        resumed.variables.remove(vars::AWAITING_INPUT_VARIABLE);
        resumed.variables.extend(variables);

        if !self
            .executions
            .transition(ExecutionStatus::WaitingInput, &mut resumed)
            .await?
        {
            return Err(ConvoFlowError::InvalidResume {
                id: execution_id.to_string(),
                reason: "execution changed state concurrently".into(),
            });
        }
        info!(
            execution_id = %execution_id,
            from = %execution.current_node_id,
            next_node_id = %next_node_id,
            "execution resumed"
        );
        Ok(resumed)
    }

    /// 把用户回复翻译成下一个节点
    pub async fn reply(&self, execution_id: &str, reply: InboundReply) -> Result<FlowExecution> {
        let execution = self.waiting(execution_id).await?;
        let flow = self.flows.spec(&execution.flow_id)?;
        let node = flow
            .spec
            .node(&execution.current_node_id)
            .ok_or_else(|| ConvoFlowError::NodeNotFound(execution.current_node_id.clone()))?;

        let invalid = |reason: &str| ConvoFlowError::InvalidResume {
            id: execution_id.to_string(),
            reason: reason.to_string(),
        };

        match node {
            Node::QuickReply(quick_reply) => {
                let answer = reply.text.trim();
                let index = match reply.option_index {
                    Some(index) => Some(index),
                    None => shown_options(&execution, quick_reply)
                        .iter()
                        .position(|shown| shown.trim().eq_ignore_ascii_case(answer)),
                };
                let option = index
                    .and_then(|index| quick_reply.options.get(index))
                    .ok_or_else(|| invalid("reply does not match any option"))?;
                let next = target_or_end(&option.go).to_string();
                self.resume(execution_id, &next, HashMap::new()).await
            }
            Node::Action(action) if action.captures_input() => {
                let answer = reply.text.trim();
                if answer.is_empty() {
                    return Err(invalid("empty reply"));
                }
                let variable = action
                    .param_str("variable")
                    .unwrap_or(actions::DEFAULT_CAPTURE_VARIABLE);
                let mut captured = HashMap::new();
                captured.insert(variable.to_string(), Value::from(answer));
                let next = target_or_end(&action.go).to_string();
                self.resume(execution_id, &next, captured).await
            }
            _ => Err(invalid("current node does not accept input")),
        }
    }

    async fn waiting(&self, execution_id: &str) -> Result<FlowExecution> {
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ConvoFlowError::ExecutionNotFound(execution_id.to_string()))?;
        if execution.status != ExecutionStatus::WaitingInput {
            return Err(ConvoFlowError::InvalidResume {
                id: execution_id.to_string(),
                reason: format!("status is {:?}", execution.status),
            });
        }
        Ok(execution)
    }
}

/// 用户实际看到的按钮文本：优先取执行时记录的选项，否则按当前变量插值
fn shown_options(execution: &FlowExecution, quick_reply: &QuickReplyNode) -> Vec<String> {
    let recorded: Vec<String> = execution
        .variables
        .get(vars::QUICK_REPLY_OPTIONS)
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| option.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if recorded.len() == quick_reply.options.len() {
        return recorded;
    }
    let ctx = execution.to_context();
    quick_reply
        .options
        .iter()
        .map(|option| ctx.interpolate(&option.text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;
    use crate::store::MemoryStore;

    fn intake() -> (TriggerIntake, Arc<FlowRegistry>) {
        let flows = Arc::new(FlowRegistry::new());
        let spec = FlowBuilder::new("1")
            .set_entry("hello")
            .add_message("hello", "Hi", "end")
            .build();
        flows.register_spec("greeting", spec).unwrap();
        let intake = TriggerIntake::new(
            flows.clone(),
            Arc::new(MemoryStore::new()),
            SchedulerConfig::default().with_default_max_retries(5),
        );
        (intake, flows)
    }

    #[tokio::test]
    async fn start_queues_at_entry() {
        let (intake, _) = intake();
        let execution = intake
            .start(StartRequest::new("greeting", "conv", "contact").with_variable("name", "Ava"))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert_eq!(execution.current_node_id, "hello");
        assert_eq!(execution.max_retries, 5);
        assert_eq!(execution.variables["name"], Value::from("Ava"));
    }

    #[tokio::test]
    async fn inactive_flows_do_not_start() {
        let (intake, flows) = intake();
        flows.set_active("greeting", false).unwrap();
        let err = intake
            .start(StartRequest::new("greeting", "conv", "contact"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "flow_inactive");
    }

    #[tokio::test]
    async fn resume_requires_waiting_status() {
        let (intake, _) = intake();
        let execution = intake
            .start(StartRequest::new("greeting", "conv", "contact"))
            .await
            .unwrap();
        let err = intake
            .resume(&execution.id, "hello", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_resume");

        let err = intake
            .resume("nope", "hello", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_not_found");
    }
}
