use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::RetryDecision;
use super::rate_limit::RateLimiter;
use super::records::{ApiItemStatus, ApiQueueItem, MessageStatus, OutboundMessage};
use super::PollReport;
use crate::config::QueueConfig;
use crate::error::{DeliveryError, Result};
use crate::flow::constants::{api_types, fields};
use crate::state::MessageContent;
use crate::store::RecordStore;

type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// 发送给消息提供方的请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub recipient_id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub content: MessageContent,
}

/// 提供方确认
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

/// 外部消息提供方
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: ProviderRequest) -> DeliveryResult<DeliveryReceipt>;
}

/// 只写日志的提供方，本地模拟时使用
#[derive(Default)]
pub struct LoggingProvider {
    delivered: Mutex<Vec<ProviderRequest>>,
}

impl LoggingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<ProviderRequest> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl MessagingProvider for LoggingProvider {
    fn name(&self) -> &str {
        "logging"
    }

    async fn send(&self, request: ProviderRequest) -> DeliveryResult<DeliveryReceipt> {
        info!(
            recipient_id = %request.recipient_id,
            conversation_id = %request.conversation_id,
            text = %request.content.text,
            quick_replies = ?request.content.quick_replies,
            "outbound message"
        );
        let mut delivered = self.delivered.lock();
        delivered.push(request);
        Ok(DeliveryReceipt {
            provider_message_id: Some(format!("log-{}", delivered.len())),
            raw: Value::Null,
        })
    }
}

/// 处理一种 `api_type` 的队列项
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, item: &ApiQueueItem) -> DeliveryResult<Value>;
}

/// `send_message`：把队列项转成提供方请求
pub struct SendMessageHandler {
    provider: Arc<dyn MessagingProvider>,
}

impl SendMessageHandler {
    pub fn new(provider: Arc<dyn MessagingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ApiHandler for SendMessageHandler {
    async fn handle(&self, item: &ApiQueueItem) -> DeliveryResult<Value> {
        let recipient_id = item
            .payload_str(fields::RECIPIENT_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DeliveryError::Permanent("payload has no recipient_id".into()))?;
        let content = item
            .payload
            .get(fields::CONTENT)
            .cloned()
            .ok_or_else(|| DeliveryError::Permanent("payload has no content".into()))
            .and_then(|raw| {
                serde_json::from_value::<MessageContent>(raw)
                    .map_err(|err| DeliveryError::Permanent(format!("invalid content: {err}")))
            })?;
        let request = ProviderRequest {
            recipient_id: recipient_id.to_string(),
            conversation_id: item
                .payload_str(fields::CONVERSATION_ID)
                .unwrap_or_default()
                .to_string(),
            content,
        };
        let receipt = self.provider.send(request).await?;
        debug!(
            provider = self.provider.name(),
            item_id = %item.id,
            provider_message_id = ?receipt.provider_message_id,
            "provider accepted message"
        );
        Ok(serde_json::to_value(receipt).unwrap_or(Value::Null))
    }
}

/// 只记录请求的处理器，用于 `http_request` / `notify_team` 这类旁路副作用
#[derive(Default)]
pub struct LoggingHandler;

#[async_trait]
impl ApiHandler for LoggingHandler {
    async fn handle(&self, item: &ApiQueueItem) -> DeliveryResult<Value> {
        info!(
            item_id = %item.id,
            api_type = %item.api_type,
            payload = %item.payload,
            "side effect handed off"
        );
        Ok(json!({ "logged": true }))
    }
}

/// 按 `api_type` 注册的处理器
#[derive(Default, Clone)]
pub struct ApiHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
}

impl ApiHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 `send_message` 处理器
    pub fn with_messaging(provider: Arc<dyn MessagingProvider>) -> Self {
        let mut registry = Self::new();
        registry.register(api_types::SEND_MESSAGE, Arc::new(SendMessageHandler::new(provider)));
        registry
    }

    pub fn register(&mut self, api_type: impl Into<String>, handler: Arc<dyn ApiHandler>) {
        let api_type = api_type.into();
        if self.handlers.insert(api_type.clone(), handler).is_some() {
            warn!(api_type = %api_type, "api handler replaced");
        }
    }

    pub fn get(&self, api_type: &str) -> Option<Arc<dyn ApiHandler>> {
        self.handlers.get(api_type).cloned()
    }

    pub fn api_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

enum Settled {
    Completed,
    /// 携带下一次尝试的时间
    Retried(DateTime<Utc>),
    Failed,
}

/// 外部 API 队列 worker
///
/// 所有对外调用的唯一出口；按账号限流，按 priority 出队。
/// 不同会话并发处理，同一会话内按出队顺序逐个处理。
pub struct ApiQueueWorker {
    items: Arc<dyn RecordStore<ApiQueueItem>>,
    messages: Arc<dyn RecordStore<OutboundMessage>>,
    handlers: ApiHandlerRegistry,
    limiter: RateLimiter,
    config: QueueConfig,
}

impl ApiQueueWorker {
    pub fn new(
        items: Arc<dyn RecordStore<ApiQueueItem>>,
        messages: Arc<dyn RecordStore<OutboundMessage>>,
        handlers: ApiHandlerRegistry,
        config: QueueConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_calls, config.rate_limit_window);
        Self {
            items,
            messages,
            handlers,
            limiter,
            config,
        }
    }

    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();
        let batch = self
            .items
            .eligible(ApiItemStatus::Pending, now, self.config.batch_size)
            .await?;

        let mut conversations: Vec<Vec<ApiQueueItem>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in batch {
            if !self.limiter.try_acquire(&item.account_id, now) {
                debug!(item_id = %item.id, account_id = %item.account_id, "rate limited, deferring");
                report.deferred += 1;
                continue;
            }
            let mut claimed = item;
            claimed.status = ApiItemStatus::Processing;
            match self
                .items
                .transition(ApiItemStatus::Pending, &mut claimed)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(item_id = %claimed.id, "api item already leased by another worker");
                    self.limiter.release(&claimed.account_id, now);
                    continue;
                }
                Err(err) => {
                    error!(item_id = %claimed.id, error = %err, "failed to lease api item");
                    self.limiter.release(&claimed.account_id, now);
                    continue;
                }
            }
            report.leased += 1;

            let key = ordering_key(&claimed);
            match index.get(&key) {
                Some(&slot) => conversations[slot].push(claimed),
                None => {
                    index.insert(key, conversations.len());
                    conversations.push(vec![claimed]);
                }
            }
        }

        let results = future::join_all(
            conversations
                .into_iter()
                .map(|items| self.process_in_order(items, now)),
        )
        .await;
        for partial in results {
            report.merge(partial);
        }
        Ok(report)
    }

    /// 逐个处理同一会话的队列项；前一项进入退避时，
    /// 其后的项顺延到同一时间，保持投递顺序
    async fn process_in_order(&self, items: Vec<ApiQueueItem>, now: DateTime<Utc>) -> PollReport {
        let mut report = PollReport::default();
        let mut hold_until: Option<DateTime<Utc>> = None;
        for item in items {
            if let Some(resume_at) = hold_until {
                self.hold(item, resume_at, now).await;
                report.deferred += 1;
                continue;
            }
            let outcome = self.dispatch(&item).await;
            let id = item.id.clone();
            match self.settle(item, outcome, now).await {
                Ok(Settled::Completed) => report.succeeded += 1,
                Ok(Settled::Retried(resume_at)) => {
                    report.retried += 1;
                    hold_until = Some(resume_at);
                }
                Ok(Settled::Failed) => report.failed += 1,
                Err(err) => {
                    error!(item_id = %id, error = %err, "failed to settle api item");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// 未调用的项放回 `pending`，不计重试次数，并退回限流额度
    async fn hold(&self, mut item: ApiQueueItem, resume_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.limiter.release(&item.account_id, now);
        item.status = ApiItemStatus::Pending;
        item.scheduled_at = resume_at;
        match self
            .items
            .transition(ApiItemStatus::Processing, &mut item)
            .await
        {
            Ok(true) => debug!(
                item_id = %item.id,
                resume_at = %resume_at,
                "api item held behind earlier retry"
            ),
            Ok(false) => warn!(item_id = %item.id, "lost lease on held api item"),
            Err(err) => error!(item_id = %item.id, error = %err, "failed to hold api item"),
        }
    }

    async fn dispatch(&self, item: &ApiQueueItem) -> DeliveryResult<Value> {
        match self.handlers.get(&item.api_type) {
            Some(handler) => handler.handle(item).await,
            None => Err(DeliveryError::Permanent(format!(
                "no handler registered for api type `{}`",
                item.api_type
            ))),
        }
    }

    async fn settle(
        &self,
        mut item: ApiQueueItem,
        outcome: DeliveryResult<Value>,
        now: DateTime<Utc>,
    ) -> Result<Settled> {
        let settled = match outcome {
            Ok(response) => {
                item.status = ApiItemStatus::Completed;
                item.completed_at = Some(now);
                item.response = Some(response);
                item.error = None;
                Settled::Completed
            }
            Err(err) => {
                item.error = Some(err.to_string());
                let decision = if err.is_retryable() {
                    self.config
                        .backoff
                        .next(item.retry_count, item.max_retries, now)
                } else {
                    RetryDecision::Exhausted
                };
                match decision {
                    RetryDecision::Retry {
                        retry_count,
                        scheduled_at,
                    } => {
                        warn!(
                            item_id = %item.id,
                            api_type = %item.api_type,
                            retry_count,
                            scheduled_at = %scheduled_at,
                            error = %err,
                            "api call failed, retrying"
                        );
                        item.status = ApiItemStatus::Pending;
                        item.retry_count = retry_count;
                        item.scheduled_at = scheduled_at;
                        Settled::Retried(scheduled_at)
                    }
                    RetryDecision::Exhausted => {
                        error!(
                            item_id = %item.id,
                            api_type = %item.api_type,
                            retry_count = item.retry_count,
                            error = %err,
                            "api call failed permanently"
                        );
                        item.status = ApiItemStatus::Failed;
                        item.completed_at = Some(now);
                        Settled::Failed
                    }
                }
            }
        };

        if !self
            .items
            .transition(ApiItemStatus::Processing, &mut item)
            .await?
        {
            warn!(item_id = %item.id, "lost lease on api item");
            return Ok(settled);
        }

        let linked = match settled {
            Settled::Completed => self.settle_message(&item, MessageStatus::Sent, now).await,
            Settled::Failed => self.settle_message(&item, MessageStatus::Failed, now).await,
            Settled::Retried(_) => Ok(()),
        };
        if let Err(err) = linked {
            error!(item_id = %item.id, error = %err, "failed to settle linked message");
        }
        Ok(settled)
    }

    /// 通过 payload 中的 `message_queue_id` 回写出站消息状态
    async fn settle_message(
        &self,
        item: &ApiQueueItem,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if item.api_type != api_types::SEND_MESSAGE {
            return Ok(());
        }
        let Some(message_id) = item.payload_str(fields::MESSAGE_QUEUE_ID) else {
            return Ok(());
        };
        let Some(mut message) = self.messages.get(message_id).await? else {
            warn!(item_id = %item.id, message_id = %message_id, "linked message not found");
            return Ok(());
        };

        message.status = status;
        match status {
            MessageStatus::Sent => {
                message.sent_at = Some(now);
                message.error = None;
            }
            _ => message.error = item.error.clone(),
        }
        if self
            .messages
            .transition(MessageStatus::Sending, &mut message)
            .await?
        {
            debug!(message_id = %message_id, status = ?status, "message settled");
        } else {
            warn!(message_id = %message_id, "message was not in sending state");
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            handlers = ?self.handlers.api_types(),
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "api queue worker started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        error!(error = %err, "api queue poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("api queue worker stopped");
    }
}

/// 同一会话的项共用一个键；无会话的项各自独立
fn ordering_key(item: &ApiQueueItem) -> String {
    match item.payload_str(fields::CONVERSATION_ID) {
        Some(conversation_id) if !conversation_id.is_empty() => {
            format!("conversation:{conversation_id}")
        }
        _ => format!("item:{}", item.id),
    }
}

/// 通过 HTTP webhook 投递消息
#[cfg(feature = "http-provider")]
pub struct WebhookProvider {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

#[cfg(feature = "http-provider")]
impl WebhookProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build http client: {err}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn classify(status: reqwest::StatusCode, body: String) -> DeliveryError {
        let reason = format!("provider returned {status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            DeliveryError::Transient(reason)
        } else {
            DeliveryError::Permanent(reason)
        }
    }
}

#[cfg(feature = "http-provider")]
#[async_trait]
impl MessagingProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, request: ProviderRequest) -> DeliveryResult<DeliveryReceipt> {
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| DeliveryError::Transient(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        let raw: Value = response.json().await.unwrap_or(Value::Null);
        let provider_message_id = raw
            .get("id")
            .or_else(|| raw.get("messageId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(DeliveryReceipt {
            provider_message_id,
            raw,
        })
    }
}
