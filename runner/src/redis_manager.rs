//! Redis Manager - queue ingress for the worker binary
//!
//! - Job queue operations (BLPOP)
//! - Result storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::jobs::{RunJob, RunResponse};

/// Redis key constants
pub mod keys {
    /// Run job queue key
    pub const RUN_QUEUE: &str = "runner:queue";

    /// Run result key prefix (for polling)
    pub const RUN_RESULT_PREFIX: &str = "runner:result:";

    /// Run result channel (for pub/sub)
    pub const RUN_RESULT_CHANNEL: &str = "runner:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// A second connection for publishing while this one blocks on BLPOP
    pub async fn duplicate(&self) -> Result<Self> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(Self {
            client: self.client.clone(),
            conn,
        })
    }

    /// Block until the next well-formed job arrives.
    ///
    /// Malformed payloads are logged and skipped; connection failures reconnect.
    pub async fn pop_job(&mut self) -> Result<RunJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::RUN_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<RunJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Store a response with a 1-hour expiry and publish it to subscribers
    pub async fn store_response(&mut self, response: &RunResponse) -> Result<()> {
        let key = format!("{}{}", keys::RUN_RESULT_PREFIX, response.request_id);
        let json = serde_json::to_string(response)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // There may be no subscribers
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RUN_RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {}s...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
