use crate::registry::StreamRegistry;
use crate::store::{BridgeStore, GroupOffset, StoreError};
use crate::wire::{self, DataRequest, DataResult, Outcome, RequestKind};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

/// The deadline the embedding application uses when it has no opinion.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type ResponseMap = HashMap<String, oneshot::Sender<DataResult>>;

/// Client-side call failures.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: StoreError,
{
    /// No matching result arrived within the deadline. Retriable; carries
    /// the correlation id for diagnosability.
    #[error("no result for correlation id {correlation_id} within the deadline")]
    Timeout {
        /// The id the call was waiting on.
        correlation_id: String,
    },

    /// The worker answered with `status=error`.
    #[error("remote handler failed for {correlation_id}: {message}")]
    Remote {
        /// The id the call was waiting on.
        correlation_id: String,
        /// The failure description the worker reported.
        message: String,
    },

    /// The client has been shut down while the call was in flight.
    #[error("the client is shut down")]
    Stopped,

    /// The store rejected an operation.
    #[error(transparent)]
    Store(E),
}

/// Tuning knobs for the response demultiplexer.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Most entries claimed per read of the result stream.
    pub read_batch: usize,
    /// How long one read blocks waiting for new results.
    pub block: Duration,
    /// Pause after a failed read before retrying.
    pub error_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_batch: 10,
            block: Duration::from_secs(1),
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Producer-side primitive: publishes correlated requests and waits for
/// the matching results.
///
/// Every instance owns a private consumer group on the result stream, read
/// by a single background task that acknowledges everything it sees and
/// completes the in-process waiter matching each result's correlation id.
/// Results nobody here is waiting on (another instance's, or an abandoned
/// call's) are acknowledged and dropped, so the group's pending list never
/// grows.
#[derive(Debug)]
pub struct BridgeClient<S>
where
    S: BridgeStore,
{
    inner: Arc<ClientInner<S>>,
}

impl<S> Clone for BridgeClient<S>
where
    S: BridgeStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct ClientInner<S>
where
    S: BridgeStore,
{
    group: String,
    registry: StreamRegistry,
    response_map: Mutex<ResponseMap>,
    shutdown_token: CancellationToken,
    store: S,
    task_tracker: TaskTracker,
}

impl<S> BridgeClient<S>
where
    S: BridgeStore,
{
    /// Creates a client: materializes its private group at the tail of the
    /// result stream and spawns the demultiplexing task.
    pub async fn new(
        store: S,
        registry: StreamRegistry,
        options: ClientOptions,
    ) -> Result<Self, Error<S::Error>> {
        let client_id = Uuid::new_v4();
        let group = format!("{}-{client_id}", registry.client_group_prefix);
        let consumer_name = format!("waiter-{client_id}");

        store
            .create_group(&registry.result_stream, &group, GroupOffset::End)
            .await
            .map_err(Error::Store)?;

        let inner = Arc::new(ClientInner {
            group,
            registry,
            response_map: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            store,
            task_tracker: TaskTracker::new(),
        });

        Self::spawn_demultiplexer(&inner, consumer_name, options);

        Ok(Self { inner })
    }

    /// The private consumer group this instance reads results through.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Publishes a request and waits for its correlated result.
    ///
    /// The caller-supplied deadline is the only cancellation mechanism;
    /// abandoning the call orphans any late result, which the
    /// demultiplexer acknowledges and drops.
    pub async fn call(
        &self,
        kind: RequestKind,
        shop_id: i64,
        parameters: Map<String, Value>,
        deadline: Duration,
    ) -> Result<Value, Error<S::Error>> {
        let request = DataRequest::new(kind, shop_id, parameters);
        let correlation_id = request.correlation_id.clone();

        let (sender, receiver) = oneshot::channel();
        self.inner
            .response_map
            .lock()
            .await
            .insert(correlation_id.clone(), sender);

        if let Err(err) = self
            .inner
            .store
            .append(&self.inner.registry.request_stream, &request.to_fields())
            .await
        {
            self.inner.response_map.lock().await.remove(&correlation_id);
            return Err(Error::Store(err));
        }

        debug!("published request {correlation_id} ({kind})");

        match timeout(deadline, receiver).await {
            Ok(Ok(result)) => match result.outcome {
                Outcome::Success(data) => Ok(data),
                Outcome::Error(message) => Err(Error::Remote {
                    correlation_id,
                    message,
                }),
            },
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => {
                self.inner.response_map.lock().await.remove(&correlation_id);
                Err(Error::Timeout { correlation_id })
            }
        }
    }

    /// Stops the demultiplexer and deletes the private group. In-flight
    /// calls fail with [`Error::Stopped`].
    pub async fn shutdown(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;

        self.inner.response_map.lock().await.clear();

        if let Err(err) = self
            .inner
            .store
            .destroy_group(&self.inner.registry.result_stream, &self.inner.group)
            .await
        {
            warn!("could not delete client group {}: {err}", self.inner.group);
        }
    }

    fn spawn_demultiplexer(
        inner: &Arc<ClientInner<S>>,
        consumer_name: String,
        options: ClientOptions,
    ) {
        let group = inner.group.clone();
        let registry = inner.registry.clone();
        let shutdown_token = inner.shutdown_token.clone();
        let store = inner.store.clone();

        // The task holds a weak handle so a dropped client actually tears
        // down rather than being kept alive by its own demultiplexer.
        let weak_inner = Arc::downgrade(inner);

        inner.task_tracker.spawn(async move {
            loop {
                if shutdown_token.is_cancelled() {
                    break;
                }

                let read = store
                    .read_group(
                        &registry.result_stream,
                        &group,
                        &consumer_name,
                        options.read_batch,
                        options.block,
                    )
                    .await;

                match read {
                    Ok(entries) => {
                        if entries.is_empty() {
                            continue;
                        }

                        let Some(inner) = weak_inner.upgrade() else {
                            break;
                        };

                        let ids: Vec<String> =
                            entries.iter().map(|entry| entry.id.clone()).collect();

                        for entry in &entries {
                            if wire::is_placeholder(&entry.fields) {
                                continue;
                            }

                            match DataResult::from_fields(&entry.fields) {
                                Ok(result) => {
                                    let mut map = inner.response_map.lock().await;
                                    if let Some(sender) = map.remove(&result.correlation_id) {
                                        let _ = sender.send(result);
                                    } else {
                                        debug!(
                                            "dropping result for unknown correlation id {}",
                                            result.correlation_id
                                        );
                                    }
                                }
                                Err(err) => {
                                    debug!("ignoring unparseable result entry {}: {err}", entry.id);
                                }
                            }
                        }

                        if let Err(err) = store.ack(&registry.result_stream, &group, &ids).await {
                            warn!("could not acknowledge result entries: {err}");
                        }
                    }
                    Err(err) if err.is_missing_group() => {
                        warn!("client group {group} missing, recreating: {err}");
                        if store
                            .create_group(&registry.result_stream, &group, GroupOffset::End)
                            .await
                            .is_err()
                        {
                            sleep(options.error_backoff).await;
                        }
                    }
                    Err(err) => {
                        warn!("error reading result stream: {err}");
                        sleep(options.error_backoff).await;
                    }
                }
            }
        });
        inner.task_tracker.close();
    }
}

impl<S> Drop for ClientInner<S>
where
    S: BridgeStore,
{
    fn drop(&mut self) {
        self.shutdown_token.cancel();

        let group = self.group.clone();
        let result_stream = self.registry.result_stream.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let _ = store.destroy_group(&result_stream, &group).await;
        });
    }
}
