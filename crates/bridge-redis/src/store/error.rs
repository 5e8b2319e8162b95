use parlor_bridge::store::StoreError;
use thiserror::Error;

/// Error type for the Redis store.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying Redis error.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl StoreError for Error {
    fn is_missing_group(&self) -> bool {
        let Self::Redis(err) = self;
        err.code() == Some("NOGROUP")
    }
}
