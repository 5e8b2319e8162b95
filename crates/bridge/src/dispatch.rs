use crate::wire::RequestKind;

use std::error::Error;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// The application-side boundary the worker hands decoded requests to.
///
/// Implementations return a serializable payload or fail with a typed
/// error; the worker turns any error into a `status=error` result message,
/// so handler failures never cross the stream as exceptions. Unknown
/// request tags are rejected before dispatch and never reach this trait.
#[async_trait]
pub trait Dispatcher
where
    Self: Send + Sync + 'static,
{
    /// The error type for the dispatcher.
    type Error: Error + Send + Sync + 'static;

    /// Handles one request scoped to `shop_id`.
    async fn dispatch(
        &self,
        kind: RequestKind,
        shop_id: i64,
        parameters: &Map<String, Value>,
    ) -> Result<Value, Self::Error>;
}
