use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{QueueConfig, SchedulerConfig};
use crate::error::{ConvoFlowError, Result};
use crate::flow::FlowRegistry;
use crate::queue::{
    ApiQueueItem, ExecutionStatus, FlowExecution, OutboundMessage, PollReport, QueueStores,
};
use crate::runtime::{FlowEngine, RunOutcome};
use crate::state::SideEffect;

enum Settled {
    Done,
    Retried,
    Failed,
}

/// 执行调度器
///
/// 轮询到期的 `queued` 执行，以 compare-and-set 取得租约后运行引擎，
/// 把副作用落成队列记录，最后从 `processing` 写回结果。
pub struct ExecutionScheduler {
    flows: Arc<FlowRegistry>,
    stores: QueueStores,
    engine: FlowEngine,
    config: SchedulerConfig,
    queue_config: QueueConfig,
}

impl ExecutionScheduler {
    pub fn new(
        flows: Arc<FlowRegistry>,
        stores: QueueStores,
        engine: FlowEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            flows,
            stores,
            engine,
            config,
            queue_config: QueueConfig::default(),
        }
    }

    /// 副作用入队时使用的优先级与重试上限
    pub fn with_queue_config(mut self, queue_config: QueueConfig) -> Self {
        self.queue_config = queue_config;
        self
    }

    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();
        let batch = self
            .stores
            .executions
            .eligible(ExecutionStatus::Queued, now, self.config.batch_size)
            .await?;

        for execution in batch {
            let mut leased = execution;
            leased.status = ExecutionStatus::Processing;
            leased.started_at.get_or_insert(now);
            match self
                .stores
                .executions
                .transition(ExecutionStatus::Queued, &mut leased)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(execution_id = %leased.id, "execution already leased elsewhere");
                    continue;
                }
                Err(err) => {
                    error!(execution_id = %leased.id, error = %err, "failed to lease execution");
                    continue;
                }
            }
            report.leased += 1;

            let span = info_span!(
                "execution",
                execution_id = %leased.id,
                flow_id = %leased.flow_id,
                node_id = %leased.current_node_id
            );
            match self.process(leased, now).instrument(span).await {
                Settled::Done => report.succeeded += 1,
                Settled::Retried => report.retried += 1,
                Settled::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn process(&self, leased: FlowExecution, now: DateTime<Utc>) -> Settled {
        let mut execution = leased.clone();
        let mut ctx = execution.to_context();
        let mut result = self
            .flows
            .spec(&execution.flow_id)
            .and_then(|flow| self.engine.run(&flow.spec, &mut ctx, now));

        let effects = ctx.take_effects();
        execution.apply_context(&ctx);
        if let Err(err) = self.persist_effects(&execution, effects, now).await {
            // 副作用未完整落库时回到租约时的位置，重试会重新执行这一段
            execution = leased;
            result = Err(err);
        }

        let settled = match result {
            Ok(RunOutcome::Completed) => {
                info!(path = ?execution.execution_path, "execution completed");
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(now);
                execution.error = None;
                Settled::Done
            }
            Ok(RunOutcome::AwaitingInput { node_id }) => {
                debug!(node_id = %node_id, "execution waiting for input");
                execution.status = ExecutionStatus::WaitingInput;
                execution.current_node_id = node_id;
                execution.error = None;
                Settled::Done
            }
            Ok(RunOutcome::Sleeping {
                node_id,
                resume_at,
                go,
            }) => {
                debug!(node_id = %node_id, resume_at = %resume_at, go = %go, "execution sleeping");
                execution.status = ExecutionStatus::Queued;
                execution.scheduled_at = resume_at;
                execution.current_node_id = go;
                execution.error = None;
                Settled::Done
            }
            Err(err) => self.settle_failure(&mut execution, err, now),
        };

        match self
            .stores
            .executions
            .transition(ExecutionStatus::Processing, &mut execution)
            .await
        {
            Ok(true) => settled,
            Ok(false) => {
                warn!(execution_id = %execution.id, "lease lost before final write");
                settled
            }
            Err(err) => {
                error!(
                    execution_id = %execution.id,
                    error = %err,
                    "final write failed, execution left in processing"
                );
                Settled::Failed
            }
        }
    }

    fn settle_failure(
        &self,
        execution: &mut FlowExecution,
        err: ConvoFlowError,
        now: DateTime<Utc>,
    ) -> Settled {
        execution.error = Some(format!("{}: {}", err.kind(), err));
        if execution.retry_count < execution.max_retries {
            execution.retry_count += 1;
            execution.status = ExecutionStatus::Queued;
            execution.scheduled_at = now
                + chrono::Duration::from_std(self.config.retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
            warn!(
                node_id = %execution.current_node_id,
                retry_count = execution.retry_count,
                configuration_error = err.is_configuration_error(),
                error = %err,
                "execution failed, requeued"
            );
            Settled::Retried
        } else {
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(now);
            error!(
                node_id = %execution.current_node_id,
                retry_count = execution.retry_count,
                error = %err,
                "execution failed permanently"
            );
            Settled::Failed
        }
    }

    async fn persist_effects(
        &self,
        execution: &FlowExecution,
        effects: Vec<SideEffect>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for effect in effects {
            if let Some((api_type, payload)) = effect.api_call() {
                let item = ApiQueueItem::new(
                    execution.account_id.clone(),
                    api_type,
                    payload,
                    self.queue_config.default_priority,
                )
                .with_max_retries(self.queue_config.default_max_retries)
                .scheduled_for(now);
                debug!(item_id = %item.id, api_type, node_id = %effect.node_id(), "side effect queued");
                self.stores.api_queue.insert(item).await?;
                continue;
            }
            if let SideEffect::SendMessage { node_id, content } = effect {
                let mut message = OutboundMessage::new(
                    execution.conversation_id.clone(),
                    execution.contact_id.clone(),
                    content,
                )
                .for_execution(execution)
                .with_max_retries(self.queue_config.default_max_retries);
                message.scheduled_at = now;
                debug!(message_id = %message.id, node_id = %node_id, "message queued");
                self.stores.messages.insert(message).await?;
            }
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "execution scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        error!(error = %err, "execution scheduler poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("execution scheduler stopped");
    }
}
