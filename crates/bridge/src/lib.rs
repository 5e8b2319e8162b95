//! Asynchronous request/response bridge over a persistent stream store.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Idempotent materialization of streams and consumer groups at startup.
pub mod bootstrap;

/// Clients publish requests and await correlated results.
pub mod client;

/// Dispatchers route decoded requests to application handlers.
pub mod dispatch;

/// Logical names of the streams and consumer groups.
pub mod registry;

/// The command surface required of the backing store.
pub mod store;

/// Workers claim requests from the request stream and publish results.
pub mod worker;

/// Wire-level request and result messages.
pub mod wire;
