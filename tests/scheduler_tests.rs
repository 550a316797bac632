use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use convoflow::{
    ConvoFlowError, EngineConfig, ExecutionScheduler, ExecutionStatus, FlowBuilder, FlowEngine,
    FlowExecution, FlowRegistry, FlowSpec, InboundReply, MemoryStore, OutboundMessage,
    QueueStores, RecordStore, SchedulerConfig, StartRequest, TriggerIntake,
};

fn onboarding() -> FlowSpec {
    FlowBuilder::new("1")
        .set_entry("ask")
        .add_quick_reply(
            "ask",
            "Hi {{name}}, want a demo?",
            [("Yes", "great"), ("No", "bye")],
        )
        .add_message("great", "Great!", "capture")
        .add_action(
            "capture",
            "capture_email",
            json!({"variable": "email"}),
            "thanks",
        )
        .add_message("thanks", "Thanks, we will write to {{email}}", "pause")
        .add_wait("pause", 3600, "followup")
        .add_message("followup", "Following up on your demo", "done")
        .add_end("done")
        .add_message("bye", "Maybe next time", "end")
        .build()
}

struct Harness {
    stores: QueueStores,
    intake: TriggerIntake,
    scheduler: ExecutionScheduler,
}

fn harness(spec: FlowSpec, config: SchedulerConfig) -> anyhow::Result<Harness> {
    let flows = Arc::new(FlowRegistry::new());
    flows.register_spec("onboarding", spec)?;
    let stores = QueueStores::in_memory();
    let intake = TriggerIntake::new(flows.clone(), stores.executions.clone(), config.clone());
    let scheduler = ExecutionScheduler::new(
        flows,
        stores.clone(),
        FlowEngine::new(EngineConfig::default()),
        config,
    );
    Ok(Harness {
        stores,
        intake,
        scheduler,
    })
}

async fn load(stores: &QueueStores, id: &str) -> anyhow::Result<FlowExecution> {
    stores
        .executions
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("execution {id} missing"))
}

#[tokio::test]
async fn quick_reply_email_capture_and_wait_round_trip() -> anyhow::Result<()> {
    let h = harness(onboarding(), SchedulerConfig::default())?;
    let started = h
        .intake
        .start(StartRequest::new("onboarding", "conv-1", "contact-1").with_variable("name", "Ava"))
        .await?;

    h.scheduler.poll_once(Utc::now()).await?;
    let row = load(&h.stores, &started.id).await?;
    assert_eq!(row.status, ExecutionStatus::WaitingInput);
    assert_eq!(row.current_node_id, "ask");
    assert_eq!(row.execution_path, vec!["ask"]);

    // 未恢复前不会再次被调度
    let report = h.scheduler.poll_once(Utc::now()).await?;
    assert!(report.is_idle());

    h.intake.reply(&started.id, InboundReply::text("yes")).await?;
    h.scheduler.poll_once(Utc::now()).await?;
    let row = load(&h.stores, &started.id).await?;
    assert_eq!(row.status, ExecutionStatus::WaitingInput);
    assert_eq!(row.current_node_id, "capture");

    h.intake
        .reply(&started.id, InboundReply::text("ava@example.com"))
        .await?;
    let before_wait = Utc::now();
    h.scheduler.poll_once(before_wait).await?;
    let row = load(&h.stores, &started.id).await?;
    assert_eq!(row.status, ExecutionStatus::Queued);
    assert_eq!(row.current_node_id, "followup");
    assert_eq!(row.scheduled_at, before_wait + Duration::seconds(3600));
    assert_eq!(row.variables["email"], json!("ava@example.com"));

    let report = h.scheduler.poll_once(before_wait + Duration::seconds(60)).await?;
    assert!(report.is_idle());

    h.scheduler.poll_once(row.scheduled_at).await?;
    let row = load(&h.stores, &started.id).await?;
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(
        row.execution_path,
        vec!["ask", "great", "capture", "thanks", "pause", "followup", "done"]
    );

    let mut texts: Vec<(chrono::DateTime<Utc>, String)> = h
        .stores
        .messages
        .list()
        .await?
        .into_iter()
        .map(|message| (message.created_at, message.content.text))
        .collect();
    texts.sort();
    assert_eq!(texts.len(), 4);
    assert!(texts
        .iter()
        .any(|(_, text)| text == "Thanks, we will write to ava@example.com"));
    Ok(())
}

#[tokio::test]
async fn reply_by_option_index_and_unknown_text() -> anyhow::Result<()> {
    let h = harness(onboarding(), SchedulerConfig::default())?;
    let started = h
        .intake
        .start(StartRequest::new("onboarding", "conv-2", "contact-2"))
        .await?;
    h.scheduler.poll_once(Utc::now()).await?;

    let err = h
        .intake
        .reply(&started.id, InboundReply::text("maybe"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_resume");

    let resumed = h.intake.reply(&started.id, InboundReply::option(1)).await?;
    assert_eq!(resumed.current_node_id, "bye");

    h.scheduler.poll_once(Utc::now()).await?;
    let row = load(&h.stores, &started.id).await?;
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.execution_path, vec!["ask", "bye"]);
    Ok(())
}

#[tokio::test]
async fn reply_matches_interpolated_option_text() -> anyhow::Result<()> {
    let spec = FlowBuilder::new("1")
        .set_entry("ask")
        .add_quick_reply("ask", "Ready?", [("Yes {{name}}", "great"), ("No", "bye")])
        .add_message("great", "Great!", "end")
        .add_message("bye", "Bye", "end")
        .build();
    let h = harness(spec, SchedulerConfig::default())?;
    let started = h
        .intake
        .start(StartRequest::new("onboarding", "conv-5", "contact-5").with_variable("name", "Ava"))
        .await?;
    h.scheduler.poll_once(Utc::now()).await?;

    let shown = h.stores.messages.list().await?;
    assert_eq!(shown[0].content.quick_replies, vec!["Yes Ava", "No"]);

    let resumed = h.intake.reply(&started.id, InboundReply::text("yes ava")).await?;
    assert_eq!(resumed.current_node_id, "great");
    Ok(())
}

#[tokio::test]
async fn manual_resume_moves_waiting_execution() -> anyhow::Result<()> {
    let h = harness(onboarding(), SchedulerConfig::default())?;
    let started = h
        .intake
        .start(StartRequest::new("onboarding", "conv-3", "contact-3"))
        .await?;
    h.scheduler.poll_once(Utc::now()).await?;

    let mut vars = HashMap::new();
    vars.insert("source".to_string(), json!("button"));
    let resumed = h.intake.resume(&started.id, "followup", vars).await?;
    assert_eq!(resumed.status, ExecutionStatus::Queued);
    assert_eq!(resumed.current_node_id, "followup");

    // 第二次恢复会因状态已变化而失败
    let err = h
        .intake
        .resume(&started.id, "bye", HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_resume");
    Ok(())
}

#[tokio::test]
async fn failing_node_retries_then_fails_without_replaying_messages() -> anyhow::Result<()> {
    let spec = FlowBuilder::new("1")
        .set_entry("hello")
        .add_message("hello", "Hello", "broken")
        .add_action("broken", "set_variable", json!({"value": 1}), "end")
        .build();
    let config = SchedulerConfig::default().with_default_max_retries(2);
    let h = harness(spec, config)?;
    let started = h
        .intake
        .start(StartRequest::new("onboarding", "conv-4", "contact-4"))
        .await?;

    let mut now = Utc::now();
    let mut retries = Vec::new();
    loop {
        let report = h.scheduler.poll_once(now).await?;
        assert_eq!(report.leased, 1);
        let row = load(&h.stores, &started.id).await?;
        assert_eq!(row.current_node_id, "broken");
        if row.status == ExecutionStatus::Failed {
            assert!(row.error.unwrap_or_default().starts_with("missing_param"));
            break;
        }
        assert_eq!(row.status, ExecutionStatus::Queued);
        assert!(row.scheduled_at > now);
        retries.push(row.retry_count);
        now = row.scheduled_at;
    }

    assert_eq!(retries, vec![1, 2]);
    assert_eq!(h.stores.messages.list().await?.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_lease_each_execution_once() -> anyhow::Result<()> {
    let spec = FlowBuilder::new("1")
        .set_entry("hello")
        .add_message("hello", "Hi", "end")
        .build();
    let flows = Arc::new(FlowRegistry::new());
    flows.register_spec("hello", spec)?;
    let stores = QueueStores::in_memory();
    for n in 0..20 {
        stores
            .executions
            .insert(FlowExecution::new("hello", format!("conv-{n}"), "contact", "hello"))
            .await?;
    }

    let config = SchedulerConfig::default().with_batch_size(50);
    let schedulers: Vec<Arc<ExecutionScheduler>> = (0..4)
        .map(|_| {
            Arc::new(ExecutionScheduler::new(
                flows.clone(),
                stores.clone(),
                FlowEngine::default(),
                config.clone(),
            ))
        })
        .collect();

    let now = Utc::now();
    let handles: Vec<_> = schedulers
        .iter()
        .cloned()
        .map(|scheduler| tokio::spawn(async move { scheduler.poll_once(now).await }))
        .collect();
    let mut leased = 0;
    for handle in handles {
        leased += handle.await??.leased;
    }

    assert_eq!(leased, 20);
    let rows = stores.executions.list().await?;
    assert!(rows
        .iter()
        .all(|row| row.status == ExecutionStatus::Completed));
    assert_eq!(stores.messages.list().await?.len(), 20);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compare_and_set_grants_a_single_lease() -> anyhow::Result<()> {
    let stores = QueueStores::in_memory();
    let execution = FlowExecution::new("flow", "conv", "contact", "n1");
    let id = execution.id.clone();
    stores.executions.insert(execution.clone()).await?;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = stores.executions.clone();
            let id = id.clone();
            let mut leased = execution.clone();
            leased.status = ExecutionStatus::Processing;
            tokio::spawn(async move {
                store
                    .compare_and_set(&id, ExecutionStatus::Queued, leased)
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await?? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let eligible = stores
        .executions
        .eligible(ExecutionStatus::Queued, Utc::now(), 10)
        .await?;
    assert!(eligible.is_empty());
    Ok(())
}

/// 下一次 `eligible` 返回预先保存的快照，模拟读到旧数据的另一个 worker
struct SnapshotStore {
    inner: Arc<MemoryStore<FlowExecution>>,
    snapshot: Mutex<Option<Vec<FlowExecution>>>,
}

#[async_trait]
impl RecordStore<FlowExecution> for SnapshotStore {
    async fn insert(&self, record: FlowExecution) -> convoflow::Result<()> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> convoflow::Result<Option<FlowExecution>> {
        self.inner.get(id).await
    }

    async fn eligible(
        &self,
        status: ExecutionStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> convoflow::Result<Vec<FlowExecution>> {
        let snapshot = self.snapshot.lock().take();
        match snapshot {
            Some(rows) => Ok(rows),
            None => self.inner.eligible(status, now, limit).await,
        }
    }

    async fn compare_and_set(
        &self,
        id: &str,
        expected: ExecutionStatus,
        record: FlowExecution,
    ) -> convoflow::Result<bool> {
        self.inner.compare_and_set(id, expected, record).await
    }

    async fn list(&self) -> convoflow::Result<Vec<FlowExecution>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn stale_snapshot_cannot_lease_requeued_execution() -> anyhow::Result<()> {
    let spec = FlowBuilder::new("1")
        .set_entry("n1")
        .add_message("n1", "Hi", "w")
        .add_wait("w", 3600, "n2")
        .add_message("n2", "Later", "end")
        .build();
    let flows = Arc::new(FlowRegistry::new());
    flows.register_spec("greeting", spec)?;

    let executions = Arc::new(MemoryStore::new());
    let stale = Arc::new(SnapshotStore {
        inner: executions.clone(),
        snapshot: Mutex::new(None),
    });
    let stores = QueueStores {
        executions: executions.clone(),
        ..QueueStores::in_memory()
    };
    let lagging_stores = QueueStores {
        executions: stale.clone(),
        ..stores.clone()
    };
    let first = ExecutionScheduler::new(
        flows.clone(),
        stores.clone(),
        FlowEngine::default(),
        SchedulerConfig::default(),
    );
    let second = ExecutionScheduler::new(
        flows,
        lagging_stores,
        FlowEngine::default(),
        SchedulerConfig::default(),
    );

    let execution = FlowExecution::new("greeting", "conv", "contact", "n1");
    let id = execution.id.clone();
    executions.insert(execution).await?;

    let now = Utc::now();
    let snapshot = executions.eligible(ExecutionStatus::Queued, now, 10).await?;
    *stale.snapshot.lock() = Some(snapshot);

    let report = first.poll_once(now).await?;
    assert_eq!(report.leased, 1);
    let requeued = load(&stores, &id).await?;
    assert_eq!(requeued.status, ExecutionStatus::Queued);
    assert_eq!(requeued.current_node_id, "n2");

    let report = second.poll_once(now).await?;
    assert_eq!(report.leased, 0);

    let row = load(&stores, &id).await?;
    assert_eq!(row, requeued);
    assert_eq!(stores.messages.list().await?.len(), 1);
    Ok(())
}

/// 插入总是失败的消息表
struct BrokenMessageStore {
    inner: MemoryStore<OutboundMessage>,
}

#[async_trait]
impl RecordStore<OutboundMessage> for BrokenMessageStore {
    async fn insert(&self, _record: OutboundMessage) -> convoflow::Result<()> {
        Err(ConvoFlowError::Store("message table unavailable".into()))
    }

    async fn get(&self, id: &str) -> convoflow::Result<Option<OutboundMessage>> {
        self.inner.get(id).await
    }

    async fn eligible(
        &self,
        status: convoflow::MessageStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> convoflow::Result<Vec<OutboundMessage>> {
        self.inner.eligible(status, now, limit).await
    }

    async fn compare_and_set(
        &self,
        id: &str,
        expected: convoflow::MessageStatus,
        record: OutboundMessage,
    ) -> convoflow::Result<bool> {
        self.inner.compare_and_set(id, expected, record).await
    }

    async fn list(&self) -> convoflow::Result<Vec<OutboundMessage>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn store_failure_requeues_every_leased_execution() -> anyhow::Result<()> {
    let spec = FlowBuilder::new("1")
        .set_entry("hello")
        .add_message("hello", "Hi", "end")
        .build();
    let flows = Arc::new(FlowRegistry::new());
    flows.register_spec("hello", spec)?;
    let stores = QueueStores {
        messages: Arc::new(BrokenMessageStore {
            inner: MemoryStore::new(),
        }),
        ..QueueStores::in_memory()
    };
    let scheduler = ExecutionScheduler::new(
        flows,
        stores.clone(),
        FlowEngine::default(),
        SchedulerConfig::default(),
    );
    for n in 0..2 {
        stores
            .executions
            .insert(FlowExecution::new("hello", format!("conv-{n}"), "contact", "hello"))
            .await?;
    }

    let report = scheduler.poll_once(Utc::now()).await?;
    assert_eq!(report.leased, 2);
    assert_eq!(report.retried, 2);

    for row in stores.executions.list().await? {
        assert_eq!(row.status, ExecutionStatus::Queued);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.current_node_id, "hello");
        assert!(row.execution_path.is_empty());
        assert!(row.error.unwrap_or_default().starts_with("store_error"));
    }
    Ok(())
}
