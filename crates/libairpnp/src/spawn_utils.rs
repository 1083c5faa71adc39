use tracing::{Instrument, debug, error};

/// Spawns a future with tracing instrumentation; errors are logged rather
/// than silently dropped with the join handle.
#[track_caller]
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(
        async move {
            match fut.await {
                Ok(()) => debug!("task finished"),
                Err(e) => error!("task finished with error: {e:#}"),
            }
        }
        .instrument(span),
    )
}
