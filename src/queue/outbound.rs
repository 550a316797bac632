use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::RetryDecision;
use super::records::{new_id, ApiQueueItem, MessageStatus, OutboundMessage};
use super::PollReport;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::flow::constants::{api_types, fields};
use crate::store::RecordStore;

/// 出站消息队列 worker
///
/// 只负责把一条消息转成一个 `send_message` API 队列项；
/// 最终的 `sent` / `failed` 由 API 队列完成时回写。
pub struct MessageDispatcher {
    messages: Arc<dyn RecordStore<OutboundMessage>>,
    api_queue: Arc<dyn RecordStore<ApiQueueItem>>,
    config: QueueConfig,
}

impl MessageDispatcher {
    pub fn new(
        messages: Arc<dyn RecordStore<OutboundMessage>>,
        api_queue: Arc<dyn RecordStore<ApiQueueItem>>,
        config: QueueConfig,
    ) -> Self {
        Self {
            messages,
            api_queue,
            config,
        }
    }

    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();
        let batch = self
            .messages
            .eligible(MessageStatus::Pending, now, self.config.batch_size)
            .await?;

        for message in batch {
            // 先生成 API 队列项 id，随租约一起写入，避免与回写竞争
            let mut leased = message;
            leased.status = MessageStatus::Sending;
            leased.api_queue_item_id = Some(new_id());
            match self
                .messages
                .transition(MessageStatus::Pending, &mut leased)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message_id = %leased.id, "message already leased by another dispatcher");
                    continue;
                }
                Err(err) => {
                    error!(message_id = %leased.id, error = %err, "failed to lease message");
                    continue;
                }
            }
            report.leased += 1;

            match self.enqueue(&leased, now).await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(
                        message_id = %leased.id,
                        conversation_id = %leased.conversation_id,
                        "message handed to api queue"
                    );
                }
                Err(err) => {
                    warn!(message_id = %leased.id, error = %err, "failed to enqueue message");
                    match self.reschedule(leased, err.to_string(), now).await {
                        Ok(true) => report.retried += 1,
                        Ok(false) => report.failed += 1,
                        Err(err) => {
                            error!(error = %err, "failed to reschedule message, left in sending");
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn enqueue(&self, message: &OutboundMessage, now: DateTime<Utc>) -> Result<()> {
        let payload = json!({
            fields::MESSAGE_QUEUE_ID: message.id,
            fields::CONVERSATION_ID: message.conversation_id,
            fields::RECIPIENT_ID: message.recipient_id,
            fields::CONTENT: message.content,
        });
        let mut item = ApiQueueItem::new(
            message.account_id.clone(),
            api_types::SEND_MESSAGE,
            payload,
            self.config.message_priority,
        )
        .with_max_retries(message.max_retries)
        .scheduled_for(now);
        if let Some(item_id) = &message.api_queue_item_id {
            item.id = item_id.clone();
        }
        self.api_queue.insert(item).await
    }

    /// 返回 true 表示已重新排队，false 表示重试耗尽
    async fn reschedule(
        &self,
        mut message: OutboundMessage,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let retried = match self
            .config
            .backoff
            .next(message.retry_count, message.max_retries, now)
        {
            RetryDecision::Retry {
                retry_count,
                scheduled_at,
            } => {
                message.status = MessageStatus::Pending;
                message.retry_count = retry_count;
                message.scheduled_at = scheduled_at;
                message.api_queue_item_id = None;
                true
            }
            RetryDecision::Exhausted => {
                message.status = MessageStatus::Failed;
                false
            }
        };
        message.error = Some(reason);
        if !self
            .messages
            .transition(MessageStatus::Sending, &mut message)
            .await?
        {
            warn!(message_id = %message.id, "lost lease while rescheduling message");
        }
        Ok(retried)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "message dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        error!(error = %err, "message dispatcher poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("message dispatcher stopped");
    }
}
