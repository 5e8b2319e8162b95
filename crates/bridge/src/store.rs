use std::collections::HashMap;
use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for store errors.
pub trait StoreError: Debug + Error + Send + Sync + 'static {
    /// Whether the error reports a read against a consumer group that does
    /// not exist (yet), so callers can create it lazily and retry.
    fn is_missing_group(&self) -> bool {
        false
    }
}

/// A single entry read from a stream.
#[derive(Clone, Debug)]
pub struct StoreEntry {
    /// The server-assigned, monotonically increasing entry id.
    pub id: String,
    /// The entry's flat field map.
    pub fields: HashMap<String, String>,
}

/// Where a newly created consumer group starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupOffset {
    /// Deliver everything already in the stream.
    Beginning,
    /// Deliver only entries appended after creation.
    End,
}

/// Outcome of an idempotent group-creation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupCreated {
    /// The group did not exist and was created.
    Created,
    /// Another initializer got there first; not an error.
    AlreadyExists,
}

/// The command surface the bridge requires of its backing store: an
/// append-only log with named consumer groups, acknowledged delivery and
/// bounded blocking reads.
#[async_trait]
pub trait BridgeStore
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: StoreError;

    /// Probes connectivity to the store.
    async fn ping(&self) -> Result<(), Self::Error>;

    /// Whether the stream has been materialized.
    async fn stream_exists(&self, stream: &str) -> Result<bool, Self::Error>;

    /// Appends one entry and returns its server-assigned id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, Self::Error>;

    /// Whether the group exists on the stream.
    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, Self::Error>;

    /// Creates a consumer group, materializing the stream if necessary.
    /// Racing creations converge on [`GroupCreated::AlreadyExists`].
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: GroupOffset,
    ) -> Result<GroupCreated, Self::Error>;

    /// Reads up to `count` entries not yet delivered to the group, blocking
    /// up to `block` when none are available. Delivered entries go onto the
    /// group's pending list for `consumer` until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoreEntry>, Self::Error>;

    /// Acknowledges delivered entries, removing them from the pending list.
    /// Returns how many were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, Self::Error>;

    /// Deletes a consumer group. Deleting an absent group is not an error.
    async fn destroy_group(&self, stream: &str, group: &str) -> Result<(), Self::Error>;
}
