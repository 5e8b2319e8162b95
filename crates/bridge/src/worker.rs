use crate::dispatch::Dispatcher;
use crate::registry::StreamRegistry;
use crate::store::{BridgeStore, GroupOffset, StoreEntry, StoreError};
use crate::wire::{self, DataRequest, DataResult};

use std::process;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker lifecycle errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker has already started; build a new one instead.
    #[error("the worker has already started")]
    AlreadyStarted,
}

/// Tuning knobs for the request loop.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Most entries claimed per read.
    pub batch_size: usize,
    /// How long one read blocks waiting for new entries. Also bounds
    /// shutdown latency.
    pub block: Duration,
    /// Pause after a failed read before retrying.
    pub error_backoff: Duration,
    /// Cancelling this token stops the loop at the next iteration.
    pub shutdown_token: CancellationToken,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            shutdown_token: CancellationToken::new(),
        }
    }
}

/// Background loop claiming requests from the request stream under the
/// shared worker group, dispatching them, and publishing correlated
/// results.
///
/// Each instance registers a process-unique consumer name, so any number
/// of instances across processes split the stream between them. One loop
/// per instance; handler invocation is synchronous within the loop, and
/// throughput scales by running more instances.
#[derive(Debug)]
pub struct RequestWorker<S, D>
where
    S: BridgeStore,
    D: Dispatcher,
{
    consumer_name: String,
    dispatcher: Arc<D>,
    options: WorkerOptions,
    registry: StreamRegistry,
    store: S,
    task_tracker: TaskTracker,
}

impl<S, D> RequestWorker<S, D>
where
    S: BridgeStore,
    D: Dispatcher,
{
    /// Creates a worker. The loop does not run until [`Self::start`].
    #[must_use]
    pub fn new(store: S, registry: StreamRegistry, dispatcher: D, options: WorkerOptions) -> Self {
        let consumer_name = format!("worker-{}-{}", process::id(), Uuid::new_v4());

        Self {
            consumer_name,
            dispatcher: Arc::new(dispatcher),
            options,
            registry,
            store,
            task_tracker: TaskTracker::new(),
        }
    }

    /// Spawns the request loop, returning its join handle. A worker runs
    /// once; after [`Self::shutdown`] (or a second call) this fails with
    /// [`Error::AlreadyStarted`].
    pub fn start(&self) -> Result<JoinHandle<()>, Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let consumer_name = self.consumer_name.clone();
        let dispatcher = self.dispatcher.clone();
        let options = self.options.clone();
        let registry = self.registry.clone();
        let shutdown_token = self.options.shutdown_token.clone();
        let store = self.store.clone();

        let handle = self.task_tracker.spawn(async move {
            info!("request worker {consumer_name} started");

            loop {
                if shutdown_token.is_cancelled() {
                    break;
                }

                let read = store
                    .read_group(
                        &registry.request_stream,
                        &registry.worker_group,
                        &consumer_name,
                        options.batch_size,
                        options.block,
                    )
                    .await;

                match read {
                    Ok(entries) => {
                        for entry in entries {
                            Self::process_entry(&store, &registry, dispatcher.as_ref(), &entry)
                                .await;
                        }
                    }
                    Err(err) if err.is_missing_group() => {
                        warn!(
                            "worker group {} missing, recreating: {err}",
                            registry.worker_group
                        );
                        if let Err(create_err) = store
                            .create_group(
                                &registry.request_stream,
                                &registry.worker_group,
                                GroupOffset::Beginning,
                            )
                            .await
                        {
                            error!("could not recreate worker group: {create_err}");
                            sleep(options.error_backoff).await;
                        }
                    }
                    Err(err) => {
                        error!("error reading request stream: {err}");
                        sleep(options.error_backoff).await;
                    }
                }
            }

            info!("request worker {consumer_name} stopped");
        });
        self.task_tracker.close();

        Ok(handle)
    }

    /// Stops the loop and waits for it to drain. Latency is bounded by the
    /// blocking-read timeout.
    pub async fn shutdown(&self) {
        info!("request worker shutting down...");

        self.options.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("request worker shutdown");
    }

    async fn process_entry(
        store: &S,
        registry: &StreamRegistry,
        dispatcher: &D,
        entry: &StoreEntry,
    ) {
        if wire::is_placeholder(&entry.fields) {
            Self::acknowledge(store, registry, &entry.id).await;
            return;
        }

        match DataRequest::from_fields(&entry.fields) {
            Ok(request) => {
                debug!(
                    "processing request {} ({})",
                    request.correlation_id, request.kind
                );

                let result = match dispatcher
                    .dispatch(request.kind, request.shop_id, &request.parameters)
                    .await
                {
                    Ok(payload) => DataResult::success(request.correlation_id.clone(), payload),
                    Err(err) => {
                        warn!(
                            "handler failed for {} ({}): {err}",
                            request.correlation_id, request.kind
                        );
                        DataResult::error(request.correlation_id.clone(), err.to_string())
                    }
                };

                // Ack only once the result is on the wire; a failed publish
                // leaves the request pending for redelivery.
                match store
                    .append(&registry.result_stream, &result.to_fields())
                    .await
                {
                    Ok(_) => Self::acknowledge(store, registry, &entry.id).await,
                    Err(err) => {
                        error!(
                            "could not publish result for {}, leaving request pending: {err}",
                            request.correlation_id
                        );
                    }
                }
            }
            Err(decode_err) => {
                warn!("malformed request entry {}: {decode_err}", entry.id);

                if let Some(correlation_id) = decode_err.correlation_id() {
                    let result =
                        DataResult::error(correlation_id.to_string(), decode_err.to_string());
                    if let Err(err) = store
                        .append(&registry.result_stream, &result.to_fields())
                        .await
                    {
                        warn!("could not publish error result for {correlation_id}: {err}");
                    }
                }

                // Always ack a poison entry so it cannot stall the stream.
                Self::acknowledge(store, registry, &entry.id).await;
            }
        }
    }

    async fn acknowledge(store: &S, registry: &StreamRegistry, id: &str) {
        if let Err(err) = store
            .ack(
                &registry.request_stream,
                &registry.worker_group,
                &[id.to_string()],
            )
            .await
        {
            warn!("could not acknowledge entry {id}, it stays redeliverable: {err}");
        }
    }
}
