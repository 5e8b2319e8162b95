//! Redis Streams implementation of the bridge store.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Streams are Redis Streams read through consumer groups.
pub mod store;
