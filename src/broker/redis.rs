use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::MultiplexedConnection;

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::error::BrokerError;

/// Redis-backed broker using `BRPOPLPUSH` for claims and `LREM` for
/// acknowledgements.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: ::redis::Client,
}

impl RedisBroker {
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            client: ::redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl BrokerConnector for RedisBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisConnection { conn }))
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn pop_and_stage(
        &mut self,
        queue: &str,
        staging: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        // A zero timeout would block forever on the server side
        let seconds = timeout.as_secs_f64().max(0.01);
        let payload: Option<Vec<u8>> = ::redis::cmd("BRPOPLPUSH")
            .arg(queue)
            .arg(staging)
            .arg(seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(payload)
    }

    async fn remove_value(&mut self, staging: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let removed: usize = ::redis::cmd("LREM")
            .arg(staging)
            .arg(0)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;
        Ok(removed)
    }
}
