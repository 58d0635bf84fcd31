//! Redis key-value front for the task store.
//!
//! Layout:
//!
//! ```text
//! task:{task_id}    -> JSON-serialized Task   (7-day TTL)
//! plan:{task_id}    -> JSON-serialized Plan   (7-day TTL)
//! tasks:timeline    -> sorted set, score = creation epoch seconds
//! ```

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// TTL for task and plan records: 7 days.
const TASK_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

const TIMELINE_KEY: &str = "tasks:timeline";

/// Redis-backed persistence layer.
///
/// The connection manager reconnects transparently; every operation returns
/// an error rather than blocking when Redis is down, and the store treats
/// those errors as non-fatal (memory stays authoritative).
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url:?}"))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected ping reply: {pong}");

        Ok(Self { conn })
    }

    pub async fn set_task(&self, task_id: &str, json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(format!("task:{task_id}"), json, TASK_TTL_SECONDS)
            .await
            .context("failed to write task")?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let val: Option<String> = conn
            .get(format!("task:{task_id}"))
            .await
            .context("failed to read task")?;
        Ok(val)
    }

    pub async fn set_plan(&self, task_id: &str, json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(format!("plan:{task_id}"), json, TASK_TTL_SECONDS)
            .await
            .context("failed to write plan")?;
        Ok(())
    }

    pub async fn get_plan(&self, task_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let val: Option<String> = conn
            .get(format!("plan:{task_id}"))
            .await
            .context("failed to read plan")?;
        Ok(val)
    }

    /// Record a task in the recency index.
    pub async fn add_to_timeline(&self, task_id: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(TIMELINE_KEY, task_id, score)
            .await
            .context("failed to update timeline")?;
        Ok(())
    }

    /// Most recent task ids, newest first.
    pub async fn timeline(&self, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let stop = limit.saturating_sub(1) as isize;
        let ids: Vec<String> = conn
            .zrevrange(TIMELINE_KEY, 0, stop)
            .await
            .context("failed to read timeline")?;
        Ok(ids)
    }
}
