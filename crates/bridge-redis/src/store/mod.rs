mod error;

pub use error::Error;

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parlor_bridge::store::{BridgeStore, GroupCreated, GroupOffset, StoreEntry};
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoGroupsReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use tracing::debug;

/// Options for the Redis store.
#[derive(Clone, Debug)]
pub struct RedisStoreOptions {
    /// Connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
}

impl RedisStoreOptions {
    /// Reads the URL from `REDIS_URL`, defaulting to a local instance.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        }
    }
}

/// A bridge store backed by Redis Streams.
///
/// Holds a multiplexed connection with automatic reconnection; clones
/// share it, so the store is cheap to hand to workers and clients.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis. Fails fast when the store is unreachable.
    pub async fn new(options: RedisStoreOptions) -> Result<Self, Error> {
        let client = redis::Client::open(options.url.as_str())?;
        let connection = client.get_connection_manager().await?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl BridgeStore for RedisStore {
    type Error = Error;

    async fn ping(&self) -> Result<(), Self::Error> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;

        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, Self::Error> {
        let mut connection = self.connection.clone();
        let exists: bool = connection.exists(stream).await?;

        Ok(exists)
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, Self::Error> {
        let mut connection = self.connection.clone();
        let reply: RedisResult<StreamInfoGroupsReply> = connection.xinfo_groups(stream).await;

        match reply {
            Ok(reply) => Ok(reply.groups.iter().any(|info| info.name == group)),
            // A stream that was never materialized has no groups.
            Err(err) if err.code() == Some("ERR") => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, Self::Error> {
        let mut connection = self.connection.clone();
        let id: String = connection.xadd(stream, "*", fields).await?;

        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: GroupOffset,
    ) -> Result<GroupCreated, Self::Error> {
        let start = match offset {
            GroupOffset::Beginning => "0",
            GroupOffset::End => "$",
        };

        let mut connection = self.connection.clone();
        let created: RedisResult<String> = connection
            .xgroup_create_mkstream(stream, group, start)
            .await;

        match created {
            Ok(_) => {
                debug!("created group {group} on {stream} at {start}");
                Ok(GroupCreated::Created)
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(GroupCreated::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoreEntry>, Self::Error> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));

        let mut connection = self.connection.clone();
        let reply: StreamReadReply = connection
            .xread_options(&[stream], &[">"], &options)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::new();
                for (field, value) in &id.map {
                    if let Ok(value) = redis::from_redis_value::<String>(value) {
                        fields.insert(field.clone(), value);
                    }
                }
                entries.push(StoreEntry { id: id.id, fields });
            }
        }

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, Self::Error> {
        let mut connection = self.connection.clone();
        let acknowledged: u64 = connection.xack(stream, group, ids).await?;

        Ok(acknowledged)
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection.clone();
        let destroyed: RedisResult<u64> = connection.xgroup_destroy(stream, group).await;

        match destroyed {
            Ok(_) => {
                debug!("destroyed group {group} on {stream}");
                Ok(())
            }
            // The group (or the whole stream) is already gone.
            Err(err) if err.code() == Some("NOGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
