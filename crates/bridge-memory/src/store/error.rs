use parlor_bridge::store::StoreError;
use thiserror::Error;

/// Error type for the in-memory store.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A group read against a stream or group that has not been created.
    #[error("no consumer group `{group}` for stream `{stream}`")]
    MissingGroup {
        /// The stream that was read.
        stream: String,
        /// The group that does not exist.
        group: String,
    },
}

impl StoreError for Error {
    fn is_missing_group(&self) -> bool {
        matches!(self, Self::MissingGroup { .. })
    }
}
