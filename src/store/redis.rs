use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::marker::PhantomData;

use super::{Record, RecordStore};
use crate::error::{ConvoFlowError, Result};

const KEY_PREFIX: &str = "convoflow";

/// 插入时分配递增序号，保证同一时刻的记录按插入顺序出队
const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[2], seq, ARGV[1])
return 1
"#;

/// 租约的原子比较并写入
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local row = cjson.decode(current)
if row['status'] ~= ARGV[1] or (tonumber(row['version']) or 0) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Redis 存储实现
pub struct RedisStore<R: Record> {
    client: redis::Client,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RedisStore<R> {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            _record: PhantomData,
        }
    }

    fn row_key(id: &str) -> String {
        format!("{KEY_PREFIX}:{}:{id}", R::TABLE)
    }

    fn index_key() -> String {
        format!("{KEY_PREFIX}:{}:ids", R::TABLE)
    }

    fn seq_key() -> String {
        format!("{KEY_PREFIX}:{}:seq", R::TABLE)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)
    }

    fn status_token(status: R::Status) -> Result<String> {
        match serde_json::to_value(status)? {
            serde_json::Value::String(token) => Ok(token),
            other => Err(ConvoFlowError::Serialization(format!(
                "status must serialize to a string, got {other}"
            ))),
        }
    }

    /// 按插入顺序读取全部记录
    async fn load_all(&self) -> Result<Vec<R>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .zrange(Self::index_key(), 0, -1)
            .await
            .map_err(store_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(Self::row_key(id));
        }
        let rows: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(store_error)?;
        rows.into_iter()
            .flatten()
            .map(|row| serde_json::from_str(&row).map_err(ConvoFlowError::from))
            .collect()
    }
}

fn store_error(error: redis::RedisError) -> ConvoFlowError {
    ConvoFlowError::Store(error.to_string())
}

#[async_trait]
impl<R: Record> RecordStore<R> for RedisStore<R> {
    async fn insert(&self, record: R) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&record)?;
        let inserted: i32 = redis::Script::new(INSERT_SCRIPT)
            .key(Self::row_key(record.id()))
            .key(Self::index_key())
            .key(Self::seq_key())
            .arg(record.id())
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        if inserted == 1 {
            Ok(())
        } else {
            Err(ConvoFlowError::Store(format!(
                "{} row `{}` already exists",
                R::TABLE,
                record.id()
            )))
        }
    }

    async fn get(&self, id: &str) -> Result<Option<R>> {
        let mut conn = self.connection().await?;
        let row: Option<String> = conn.get(Self::row_key(id)).await.map_err(store_error)?;
        row.map(|row| serde_json::from_str(&row).map_err(ConvoFlowError::from))
            .transpose()
    }

    async fn eligible(&self, status: R::Status, now: DateTime<Utc>, limit: usize) -> Result<Vec<R>> {
        let mut rows: Vec<(usize, R)> = self
            .load_all()
            .await?
            .into_iter()
            .enumerate()
            .filter(|(_, row)| row.status() == status && row.scheduled_at() <= now)
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority()
                .cmp(&a.priority())
                .then(a.scheduled_at().cmp(&b.scheduled_at()))
                .then(seq_a.cmp(seq_b))
        });
        Ok(rows.into_iter().take(limit).map(|(_, row)| row).collect())
    }

    async fn compare_and_set(&self, id: &str, expected: R::Status, mut record: R) -> Result<bool> {
        let mut conn = self.connection().await?;
        let expected_version = record.version();
        record.set_version(expected_version + 1);
        let payload = serde_json::to_string(&record)?;
        let swapped: i32 = redis::Script::new(COMPARE_AND_SET_SCRIPT)
            .key(Self::row_key(id))
            .arg(Self::status_token(expected)?)
            .arg(expected_version)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(swapped == 1)
    }

    async fn list(&self) -> Result<Vec<R>> {
        self.load_all().await
    }
}
