use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConvoFlowError, Result};
use crate::flow::conditions::Condition;
use crate::flow::constants::{actions, vars};
use crate::flow::nodes::{target_or_end, ActionNode, Node, NodeKind};
use crate::state::{ExecutionContext, MessageContent, SideEffect};

/// 单步执行结果
///
/// 挂起节点（QuickReply、Wait、capture_email）不会给出 `next_node_id`。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutcome {
    pub next_node_id: Option<String>,
    pub waiting_for_input: bool,
    pub resume: Option<ResumePoint>,
    pub completed: bool,
}

/// Wait 节点的恢复点，由调度器重新排队
#[derive(Clone, Debug, PartialEq)]
pub struct ResumePoint {
    pub resume_at: DateTime<Utc>,
    pub go: String,
}

impl StepOutcome {
    pub fn next(node_id: impl Into<String>) -> Self {
        Self {
            next_node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    pub fn waiting() -> Self {
        Self {
            waiting_for_input: true,
            ..Self::default()
        }
    }

    pub fn sleeping(resume_at: DateTime<Utc>, go: impl Into<String>) -> Self {
        Self {
            resume: Some(ResumePoint {
                resume_at,
                go: go.into(),
            }),
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.waiting_for_input || self.resume.is_some()
    }
}

/// 节点执行器
///
/// 执行器只修改上下文并登记副作用，不做任何网络 I/O。
pub trait NodeExecutor: Send + Sync {
    fn kind(&self) -> NodeKind;

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome>;
}

fn mismatch(node_id: &str, expected: NodeKind) -> ConvoFlowError {
    ConvoFlowError::NodeShape {
        node: node_id.to_string(),
        reason: format!("executor for `{expected}` received another node kind"),
    }
}

pub struct MessageExecutor;

impl NodeExecutor for MessageExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Message
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        _now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Node::Message(message) = node else {
            return Err(mismatch(node_id, self.kind()));
        };
        let text = ctx.interpolate(&message.text);
        ctx.set_variable(vars::LAST_MESSAGE, text.clone());
        ctx.push_effect(SideEffect::SendMessage {
            node_id: node_id.to_string(),
            content: MessageContent::text(text),
        });
        Ok(StepOutcome::next(target_or_end(&message.go)))
    }
}

pub struct QuickReplyExecutor;

impl NodeExecutor for QuickReplyExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::QuickReply
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        _now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Node::QuickReply(quick_reply) = node else {
            return Err(mismatch(node_id, self.kind()));
        };
        let text = ctx.interpolate(&quick_reply.text);
        let options: Vec<String> = quick_reply
            .options
            .iter()
            .map(|option| ctx.interpolate(&option.text))
            .collect();
        let recorded: Vec<Value> = options
            .iter()
            .zip(&quick_reply.options)
            .map(|(text, option)| json!({ "text": text, "go": target_or_end(&option.go) }))
            .collect();

        ctx.set_variable(vars::LAST_MESSAGE, text.clone());
        ctx.set_variable(vars::QUICK_REPLY_OPTIONS, recorded);
        ctx.push_effect(SideEffect::SendMessage {
            node_id: node_id.to_string(),
            content: MessageContent {
                text,
                quick_replies: options,
            },
        });
        Ok(StepOutcome::waiting())
    }
}

pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        _now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Node::Condition(condition) = node else {
            return Err(mismatch(node_id, self.kind()));
        };
        let parsed = Condition::parse(&condition.expression)?;
        let matched = parsed.evaluate(ctx.get_variable(&parsed.variable));
        tracing::debug!(
            node_id = %node_id,
            expression = %condition.expression,
            matched,
            "condition evaluated"
        );
        let branch = if matched {
            &condition.true_go
        } else {
            &condition.false_go
        };
        Ok(StepOutcome::next(target_or_end(branch)))
    }
}

pub struct ActionExecutor;

impl ActionExecutor {
    fn required<'a>(action: &'a ActionNode, param: &str) -> Result<&'a str> {
        action
            .param_str(param)
            .ok_or_else(|| ConvoFlowError::MissingParam {
                action: action.action_type.clone(),
                param: param.to_string(),
            })
    }

    fn http_descriptor(action: &ActionNode, ctx: &ExecutionContext, url: &str) -> Value {
        let mut descriptor: Map<String, Value> = action.params.clone();
        descriptor.insert("url".into(), Value::from(ctx.interpolate(url)));
        descriptor
            .entry("method")
            .or_insert_with(|| Value::from("POST"));
        Value::Object(descriptor)
    }
}

impl NodeExecutor for ActionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Action
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        _now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Node::Action(action) = node else {
            return Err(mismatch(node_id, self.kind()));
        };

        match action.action_type.as_str() {
            actions::ADD_TAG => {
                let tag = Self::required(action, "tag")?;
                ctx.add_tag(tag);
            }
            actions::REMOVE_TAG => {
                let tag = Self::required(action, "tag")?;
                ctx.remove_tag(tag);
            }
            actions::SET_VARIABLE => {
                let name = Self::required(action, "name")?;
                let value = action.params.get("value").cloned().unwrap_or(Value::Null);
                ctx.set_variable(name, value);
            }
            actions::HTTP_REQUEST => {
                let url = Self::required(action, "url")?;
                let request = Self::http_descriptor(action, ctx, url);
                ctx.set_variable(vars::HTTP_REQUEST, request.clone());
                ctx.push_effect(SideEffect::HttpRequest {
                    node_id: node_id.to_string(),
                    request,
                });
            }
            actions::NOTIFY_TEAM => {
                let message = ctx.interpolate(Self::required(action, "message")?);
                ctx.set_variable(vars::TEAM_NOTIFICATION, message.clone());
                ctx.push_effect(SideEffect::NotifyTeam {
                    node_id: node_id.to_string(),
                    message,
                });
            }
            actions::CAPTURE_EMAIL => {
                let variable = action
                    .param_str("variable")
                    .unwrap_or(actions::DEFAULT_CAPTURE_VARIABLE)
                    .to_string();
                ctx.set_variable(vars::AWAITING_INPUT, "email");
                ctx.set_variable(vars::AWAITING_INPUT_VARIABLE, variable);
                return Ok(StepOutcome::waiting());
            }
            other => return Err(ConvoFlowError::UnknownAction(other.to_string())),
        }

        Ok(StepOutcome::next(target_or_end(&action.go)))
    }
}

pub struct WaitExecutor;

impl NodeExecutor for WaitExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Wait
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Node::Wait(wait) = node else {
            return Err(mismatch(node_id, self.kind()));
        };
        if wait.duration_seconds <= 0 {
            return Err(ConvoFlowError::NodeShape {
                node: node_id.to_string(),
                reason: "wait duration must be positive".into(),
            });
        }
        let resume_at = Duration::try_seconds(wait.duration_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| ConvoFlowError::NodeShape {
                node: node_id.to_string(),
                reason: format!("wait duration {}s is out of range", wait.duration_seconds),
            })?;
        ctx.set_variable(vars::WAIT_DURATION_SECONDS, wait.duration_seconds);
        ctx.set_variable(vars::WAIT_UNTIL, resume_at.to_rfc3339());
        Ok(StepOutcome::sleeping(resume_at, target_or_end(&wait.go)))
    }
}

pub struct EndExecutor;

impl EndExecutor {
    /// 同时用于 End 节点和 `"end"` 哨兵
    pub fn mark_completed(ctx: &mut ExecutionContext, now: DateTime<Utc>) {
        ctx.set_variable(vars::FLOW_COMPLETED, true);
        ctx.set_variable(vars::COMPLETED_AT, now.to_rfc3339());
    }
}

impl NodeExecutor for EndExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::End
    }

    fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        if !matches!(node, Node::End) {
            return Err(mismatch(node_id, self.kind()));
        }
        Self::mark_completed(ctx, now);
        Ok(StepOutcome::completed())
    }
}

/// 按节点种类注册的执行器
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MessageExecutor));
        registry.register(Arc::new(QuickReplyExecutor));
        registry.register(Arc::new(ConditionExecutor));
        registry.register(Arc::new(ActionExecutor));
        registry.register(Arc::new(WaitExecutor));
        registry.register(Arc::new(EndExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) -> &mut Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn get(&self, kind: NodeKind) -> Result<&Arc<dyn NodeExecutor>> {
        self.executors
            .get(&kind)
            .ok_or_else(|| ConvoFlowError::NoExecutor(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        self.executors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow", "conv", "contact", "n1")
    }

    fn node(value: Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn message_interpolates_and_records_effect() {
        let mut ctx = ctx();
        ctx.set_variable("name", "Ava");
        let outcome = MessageExecutor
            .execute(
                "n1",
                &node(json!({"type": "message", "text": "Hi {{name}}", "go": "n2"})),
                &mut ctx,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome, StepOutcome::next("n2"));
        assert_eq!(ctx.get_variable(vars::LAST_MESSAGE), Some(&json!("Hi Ava")));
        assert_eq!(ctx.effects().len(), 1);
    }

    #[test]
    fn condition_routes_on_numeric_comparison() {
        let condition = node(json!({
            "type": "condition",
            "expression": "score > 10",
            "trueGo": "a",
            "falseGo": "b"
        }));
        let now = Utc::now();

        let mut high = ctx();
        high.set_variable("score", 15);
        let outcome = ConditionExecutor.execute("c", &condition, &mut high, now).unwrap();
        assert_eq!(outcome.next_node_id.as_deref(), Some("a"));

        let mut low = ctx();
        low.set_variable("score", 5);
        let outcome = ConditionExecutor.execute("c", &condition, &mut low, now).unwrap();
        assert_eq!(outcome.next_node_id.as_deref(), Some("b"));

        let mut absent = ctx();
        let outcome = ConditionExecutor.execute("c", &condition, &mut absent, now).unwrap();
        assert_eq!(outcome.next_node_id.as_deref(), Some("b"));
    }

    #[test]
    fn unknown_operator_fails() {
        let condition = node(json!({
            "type": "condition",
            "expression": "score ~ 10",
            "trueGo": "a",
            "falseGo": "b"
        }));
        let err = ConditionExecutor
            .execute("c", &condition, &mut ctx(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConvoFlowError::UnknownOperator(op) if op == "~"));
    }

    #[test]
    fn set_variable_requires_name() {
        let action = node(json!({
            "type": "action",
            "actionType": "set_variable",
            "params": {"value": 1},
            "go": "next"
        }));
        let err = ActionExecutor
            .execute("a", &action, &mut ctx(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConvoFlowError::MissingParam { ref param, .. } if param == "name"));
    }

    #[test]
    fn tags_are_idempotent() {
        let mut ctx = ctx();
        let add = node(json!({"type": "action", "actionType": "add_tag", "params": {"tag": "vip"}}));
        let remove = node(json!({"type": "action", "actionType": "remove_tag", "params": {"tag": "cold"}}));
        let now = Utc::now();
        ActionExecutor.execute("a", &add, &mut ctx, now).unwrap();
        ActionExecutor.execute("a", &add, &mut ctx, now).unwrap();
        let outcome = ActionExecutor.execute("r", &remove, &mut ctx, now).unwrap();
        assert_eq!(ctx.tags(), vec!["vip".to_string()]);
        assert_eq!(outcome.next_node_id.as_deref(), Some("end"));
    }

    #[test]
    fn http_request_is_recorded_not_performed() {
        let mut ctx = ctx();
        ctx.set_variable("id", 7);
        let action = node(json!({
            "type": "action",
            "actionType": "http_request",
            "params": {"url": "https://hooks.test/{{id}}"},
            "go": "next"
        }));
        ActionExecutor.execute("h", &action, &mut ctx, Utc::now()).unwrap();
        let request = ctx.get_variable(vars::HTTP_REQUEST).unwrap();
        assert_eq!(request["url"], json!("https://hooks.test/7"));
        assert_eq!(request["method"], json!("POST"));
        assert!(matches!(ctx.effects()[0], SideEffect::HttpRequest { .. }));
    }

    #[test]
    fn capture_email_suspends() {
        let mut ctx = ctx();
        let action = node(json!({
            "type": "action",
            "actionType": "capture_email",
            "params": {"variable": "work_email"},
            "go": "thanks"
        }));
        let outcome = ActionExecutor.execute("cap", &action, &mut ctx, Utc::now()).unwrap();
        assert!(outcome.waiting_for_input);
        assert!(outcome.next_node_id.is_none());
        assert_eq!(
            ctx.get_variable(vars::AWAITING_INPUT_VARIABLE),
            Some(&json!("work_email"))
        );
    }

    #[test]
    fn unknown_action_type_fails() {
        let action = node(json!({"type": "action", "actionType": "launch_rocket"}));
        let err = ActionExecutor
            .execute("x", &action, &mut ctx(), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_action");
    }

    #[test]
    fn suspend_nodes_never_return_next() {
        let now = Utc::now();
        let quick_reply = node(json!({
            "type": "quick_reply",
            "text": "Pick one",
            "options": [{"text": "Yes", "go": "yes"}, {"text": "No", "go": "no"}]
        }));
        let outcome = QuickReplyExecutor
            .execute("q", &quick_reply, &mut ctx(), now)
            .unwrap();
        assert!(outcome.waiting_for_input);
        assert!(outcome.next_node_id.is_none());

        let wait = node(json!({"type": "wait", "durationSeconds": 60, "go": "later"}));
        let outcome = WaitExecutor.execute("w", &wait, &mut ctx(), now).unwrap();
        assert!(outcome.next_node_id.is_none());
        assert_eq!(
            outcome.resume,
            Some(ResumePoint {
                resume_at: now + Duration::seconds(60),
                go: "later".into()
            })
        );
    }

    #[test]
    fn registry_reports_missing_kind() {
        let registry = ExecutorRegistry::new();
        let err = registry.get(NodeKind::Wait).err().unwrap();
        assert!(matches!(err, ConvoFlowError::NoExecutor(kind) if kind == "wait"));
        assert_eq!(ExecutorRegistry::with_defaults().kinds().len(), 6);
    }
}
