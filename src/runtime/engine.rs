use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::executors::{EndExecutor, ExecutorRegistry};
use crate::config::EngineConfig;
use crate::error::{ConvoFlowError, Result};
use crate::flow::constants::END;
use crate::flow::FlowSpec;
use crate::state::ExecutionContext;

/// 一次引擎调用的结果
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// QuickReply / capture_email，等待外部输入
    AwaitingInput { node_id: String },
    /// Wait 节点，到 `resume_at` 后从 `go` 继续
    Sleeping {
        node_id: String,
        resume_at: DateTime<Utc>,
        go: String,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Flow 引擎
///
/// 从 `ctx.current_node_id` 开始同步推进，直到挂起点、结束或超过步数上限。
#[derive(Clone)]
pub struct FlowEngine {
    executors: ExecutorRegistry,
    config: EngineConfig,
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl FlowEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_executors(ExecutorRegistry::with_defaults(), config)
    }

    pub fn with_executors(executors: ExecutorRegistry, config: EngineConfig) -> Self {
        Self { executors, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[instrument(
        skip_all,
        fields(flow_id = %ctx.flow_id, conversation_id = %ctx.conversation_id)
    )]
    pub fn run(
        &self,
        spec: &FlowSpec,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let mut current = ctx.current_node_id.clone();

        for _ in 0..self.config.max_steps {
            if current == END {
                EndExecutor::mark_completed(ctx, now);
                debug!("reached end sentinel");
                return Ok(RunOutcome::Completed);
            }

            ctx.current_node_id = current.clone();
            let node = spec
                .node(&current)
                .ok_or_else(|| ConvoFlowError::NodeNotFound(current.clone()))?;
            let executor = self.executors.get(node.kind())?;
            ctx.record_step(&current);
            debug!(node_id = %current, kind = %node.kind(), "executing node");

            let outcome = executor.execute(&current, node, ctx, now)?;
            if outcome.completed {
                return Ok(RunOutcome::Completed);
            }
            if outcome.waiting_for_input {
                return Ok(RunOutcome::AwaitingInput { node_id: current });
            }
            if let Some(resume) = outcome.resume {
                return Ok(RunOutcome::Sleeping {
                    node_id: current,
                    resume_at: resume.resume_at,
                    go: resume.go,
                });
            }
            current = outcome.next_node_id.unwrap_or_else(|| END.to_string());
        }

        Err(ConvoFlowError::StepLimitExceeded(self.config.max_steps))
    }
}
