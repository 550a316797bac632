//! 持久化队列表
//!
//! 所有 worker 只通过存储层协调：租约就是一次原子的
//! compare-and-set 状态转换，不使用进程内锁。

mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis::RedisStore;

/// 可放入队列表的记录
pub trait Record: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Status: Copy + Debug + PartialEq + Send + Sync + Serialize;

    /// 表名，用作存储键前缀
    const TABLE: &'static str;

    fn id(&self) -> &str;
    fn status(&self) -> Self::Status;
    fn scheduled_at(&self) -> DateTime<Utc>;

    /// 每次成功写入递增；compare_and_set 以此识别过期快照
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);

    /// 越大越先出队
    fn priority(&self) -> i32 {
        0
    }
}

/// 队列表存储
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    async fn insert(&self, record: R) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<R>>;

    /// `status` 匹配且 `scheduled_at <= now` 的记录，
    /// 按 priority 降序、scheduled_at 升序、插入顺序排列
    async fn eligible(&self, status: R::Status, now: DateTime<Utc>, limit: usize) -> Result<Vec<R>>;

    /// 当前状态等于 `expected` 且版本号等于 `record.version()` 时原子地写入，
    /// 写入后的版本号加一；返回是否写入
    async fn compare_and_set(&self, id: &str, expected: R::Status, record: R) -> Result<bool>;

    /// compare_and_set 的便捷形式：成功时同步推进 `record` 的版本号，
    /// 调用方可继续用它做下一次转换
    async fn transition(&self, expected: R::Status, record: &mut R) -> Result<bool> {
        let id = record.id().to_string();
        let swapped = self.compare_and_set(&id, expected, record.clone()).await?;
        if swapped {
            record.set_version(record.version() + 1);
        }
        Ok(swapped)
    }

    async fn list(&self) -> Result<Vec<R>>;
}
