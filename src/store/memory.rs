use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{Record, RecordStore};
use crate::error::{ConvoFlowError, Result};

/// 内存存储实现
///
/// 每个操作都在同一把锁内完成，compare_and_set 因此是原子的。
pub struct MemoryStore<R: Record> {
    inner: Mutex<Table<R>>,
}

struct Table<R> {
    rows: HashMap<String, Row<R>>,
    next_seq: u64,
}

struct Row<R> {
    seq: u64,
    record: R,
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Table {
                rows: HashMap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn insert(&self, record: R) -> Result<()> {
        let mut table = self.inner.lock();
        if table.rows.contains_key(record.id()) {
            return Err(ConvoFlowError::Store(format!(
                "{} row `{}` already exists",
                R::TABLE,
                record.id()
            )));
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table
            .rows
            .insert(record.id().to_string(), Row { seq, record });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<R>> {
        Ok(self.inner.lock().rows.get(id).map(|row| row.record.clone()))
    }

    async fn eligible(&self, status: R::Status, now: DateTime<Utc>, limit: usize) -> Result<Vec<R>> {
        let table = self.inner.lock();
        let mut rows: Vec<&Row<R>> = table
            .rows
            .values()
            .filter(|row| row.record.status() == status && row.record.scheduled_at() <= now)
            .collect();
        rows.sort_by(|a, b| {
            b.record
                .priority()
                .cmp(&a.record.priority())
                .then(a.record.scheduled_at().cmp(&b.record.scheduled_at()))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| row.record.clone())
            .collect())
    }

    async fn compare_and_set(&self, id: &str, expected: R::Status, record: R) -> Result<bool> {
        let mut table = self.inner.lock();
        match table.rows.get_mut(id) {
            Some(row)
                if row.record.status() == expected
                    && row.record.version() == record.version() =>
            {
                let version = record.version() + 1;
                row.record = record;
                row.record.set_version(version);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<R>> {
        let table = self.inner.lock();
        let mut rows: Vec<&Row<R>> = table.rows.values().collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.record.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ExecutionStatus, FlowExecution};

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let execution = FlowExecution::new("flow", "conv", "contact", "n1");
        let id = execution.id.clone();
        store.insert(execution.clone()).await.unwrap();

        let mut leased = execution.clone();
        leased.status = ExecutionStatus::Processing;
        assert!(store.transition(ExecutionStatus::Queued, &mut leased).await.unwrap());
        assert_eq!(leased.version, 1);

        let mut requeued = leased.clone();
        requeued.status = ExecutionStatus::Queued;
        assert!(store.transition(ExecutionStatus::Processing, &mut requeued).await.unwrap());

        // 状态相同但版本已过期
        let mut stale = execution;
        stale.status = ExecutionStatus::Processing;
        assert!(!store.compare_and_set(&id, ExecutionStatus::Queued, stale).await.unwrap());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, ExecutionStatus::Queued);
    }
}
