use crate::registry::StreamRegistry;
use crate::store::{BridgeStore, GroupCreated, GroupOffset, StoreError};
use crate::wire;

use thiserror::Error;
use tracing::{info, warn};

/// Bootstrap failure. Only total unreachability of the store is fatal;
/// everything else degrades.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: StoreError,
{
    /// The store could not be reached at all.
    #[error("store unreachable: {0}")]
    Unreachable(#[source] E),
}

/// Idempotently materializes both streams and the worker group.
///
/// Safe to call concurrently from any number of starting instances: a
/// stream is materialized by appending a placeholder entry, and a group
/// creation that loses a race is absorbed as [`GroupCreated::AlreadyExists`].
/// Group-creation failures beyond that are logged and left for the worker
/// to retry lazily, trading strictness for startup liveness.
pub async fn ensure_ready<S>(store: &S, registry: &StreamRegistry) -> Result<(), Error<S::Error>>
where
    S: BridgeStore,
{
    store.ping().await.map_err(Error::Unreachable)?;

    for stream in [&registry.request_stream, &registry.result_stream] {
        ensure_stream(store, stream).await;
    }

    match store
        .create_group(
            &registry.request_stream,
            &registry.worker_group,
            GroupOffset::Beginning,
        )
        .await
    {
        Ok(GroupCreated::Created) => {
            info!(
                "created consumer group {} on {}",
                registry.worker_group, registry.request_stream
            );
        }
        Ok(GroupCreated::AlreadyExists) => {
            info!(
                "consumer group {} already exists on {}",
                registry.worker_group, registry.request_stream
            );
        }
        Err(err) => {
            warn!(
                "could not create consumer group {} on {}, continuing without it: {err}",
                registry.worker_group, registry.request_stream
            );
        }
    }

    Ok(())
}

async fn ensure_stream<S>(store: &S, stream: &str)
where
    S: BridgeStore,
{
    match store.stream_exists(stream).await {
        Ok(true) => {}
        Ok(false) => match store.append(stream, &wire::placeholder_fields()).await {
            Ok(_) => info!("created stream {stream}"),
            // Lost the race to another initializer, or a transient write
            // failure the worker will surface later.
            Err(err) => warn!("could not materialize stream {stream}: {err}"),
        },
        Err(err) => warn!("could not probe stream {stream}: {err}"),
    }
}
