/*!
 * Utility functions and helpers for BlueFlow.
 */
use std::future::Future;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{warn, Instrument};

use crate::error::{Error, Result};
use crate::logging::component_span;

/// Run a future with a timeout
///
/// The state machines never time out on their own; this is the helper for
/// callers that want a deadline on top of a state stream.
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration))),
    }
}

/// Spawn a state machine task inside its component span
///
/// # Arguments
///
/// * `name` - The kind of machine, used as the span name field
/// * `id` - The entity identifier, if any
/// * `fut` - The actor loop
pub fn spawn_actor<F>(name: &str, id: Option<&str>, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut.instrument(component_span(name, id)))
}

/// Adapt a broadcast receiver into a boxed stream
///
/// Lagged receivers skip ahead with a warning; the stream ends when the
/// sender is dropped.
pub fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(receiver)
        .filter_map(|item| async move {
            match item {
                Ok(item) => Some(item),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Broadcast subscriber lagged, {} items skipped", skipped);
                    None
                }
            }
        })
        .boxed()
}
