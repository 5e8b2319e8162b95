mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parlor_bridge::store::{BridgeStore, GroupCreated, GroupOffset, StoreEntry};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{timeout, Instant};

/// An in-memory stream store.
///
/// Entries get monotonically increasing ids; each consumer group keeps a
/// read cursor and a pending-entries list, so delivery, load balancing and
/// acknowledgment behave like the production store.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    wakeup: broadcast::Sender<()>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoreEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashMap<String, String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (wakeup, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            wakeup,
        }
    }

    /// How many delivered-but-unacknowledged entries the group holds.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;

        inner
            .streams
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .map_or(0, |group_state| group_state.pending.len())
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    type Error = Error;

    async fn ping(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, Self::Error> {
        Ok(self.inner.lock().await.streams.contains_key(stream))
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, Self::Error> {
        let inner = self.inner.lock().await;

        Ok(inner
            .streams
            .get(stream)
            .is_some_and(|state| state.groups.contains_key(group)))
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, Self::Error> {
        let id = {
            let mut inner = self.inner.lock().await;
            let state = inner.streams.entry(stream.to_string()).or_default();

            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);

            state.entries.push(StoreEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });

            id
        };

        let _ = self.wakeup.send(());

        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: GroupOffset,
    ) -> Result<GroupCreated, Self::Error> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();

        if state.groups.contains_key(group) {
            return Ok(GroupCreated::AlreadyExists);
        }

        let cursor = match offset {
            GroupOffset::Beginning => 0,
            GroupOffset::End => state.entries.len(),
        };

        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );

        Ok(GroupCreated::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoreEntry>, Self::Error> {
        let deadline = Instant::now() + block;
        // Subscribed before the first probe so an append between probe and
        // wait cannot be missed.
        let mut wakeup = self.wakeup.subscribe();

        loop {
            {
                let mut inner = self.inner.lock().await;

                let missing = || Error::MissingGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                };

                let Some(state) = inner.streams.get_mut(stream) else {
                    return Err(missing());
                };
                let StreamState {
                    entries, groups, ..
                } = state;
                let Some(group_state) = groups.get_mut(group) else {
                    return Err(missing());
                };

                if group_state.cursor < entries.len() {
                    let end = entries.len().min(group_state.cursor + count);
                    let batch = entries[group_state.cursor..end].to_vec();

                    for entry in &batch {
                        group_state
                            .pending
                            .insert(entry.id.clone(), consumer.to_string());
                    }
                    group_state.cursor = end;

                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let _ = timeout(deadline - now, wakeup.recv()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().await;

        let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let mut acknowledged = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acknowledged += 1;
            }
        }

        Ok(acknowledged)
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;

        if let Some(state) = inner.streams.get_mut(stream) {
            state.groups.remove(group);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn entry_fields(value: &str) -> Vec<(String, String)> {
        vec![("value".to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let store = MemoryStore::new();

        assert!(!store.stream_exists("s").await.unwrap());

        let first = store.append("s", &entry_fields("a")).await.unwrap();
        let second = store.append("s", &entry_fields("b")).await.unwrap();

        assert!(store.stream_exists("s").await.unwrap());
        assert_eq!(first, "1-0");
        assert_eq!(second, "2-0");
    }

    #[tokio::test]
    async fn group_at_beginning_sees_history() {
        let store = MemoryStore::new();
        store.append("s", &entry_fields("a")).await.unwrap();

        store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();

        let entries = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn group_at_end_skips_history() {
        let store = MemoryStore::new();
        store.append("s", &entry_fields("old")).await.unwrap();

        store.create_group("s", "g", GroupOffset::End).await.unwrap();

        let entries = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(entries.is_empty());

        store.append("s", &entry_fields("new")).await.unwrap();

        let entries = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("value").unwrap(), "new");
    }

    #[tokio::test]
    async fn create_group_is_idempotent() {
        let store = MemoryStore::new();

        let first = store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();
        let second = store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();

        assert_eq!(first, GroupCreated::Created);
        assert_eq!(second, GroupCreated::AlreadyExists);
    }

    #[tokio::test]
    async fn consumers_in_one_group_split_entries() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();

        for value in ["a", "b", "c", "d"] {
            store.append("s", &entry_fields(value)).await.unwrap();
        }

        let first = store
            .read_group("s", "g", "one", 2, Duration::ZERO)
            .await
            .unwrap();
        let second = store
            .read_group("s", "g", "two", 2, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);

        let mut ids: Vec<_> = first.iter().chain(&second).map(|e| e.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();
        store.append("s", &entry_fields("a")).await.unwrap();

        let entries = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.pending_count("s", "g").await, 1);

        let acknowledged = store.ack("s", "g", &[entries[0].id.clone()]).await.unwrap();
        assert_eq!(acknowledged, 1);
        assert_eq!(store.pending_count("s", "g").await, 0);

        // Acking again is a no-op.
        let acknowledged = store.ack("s", "g", &[entries[0].id.clone()]).await.unwrap();
        assert_eq!(acknowledged, 0);
    }

    #[tokio::test]
    async fn read_against_missing_group_is_classified() {
        use parlor_bridge::store::StoreError as _;

        let store = MemoryStore::new();

        let err = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_missing_group());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();

        let reader = store.clone();
        let read = tokio::spawn(async move {
            reader
                .read_group("s", "g", "c", 10, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.append("s", &entry_fields("a")).await.unwrap();

        let entries = read.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn destroyed_group_stops_existing() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", GroupOffset::Beginning)
            .await
            .unwrap();
        assert!(store.group_exists("s", "g").await.unwrap());

        store.destroy_group("s", "g").await.unwrap();
        assert!(!store.group_exists("s", "g").await.unwrap());
    }
}
