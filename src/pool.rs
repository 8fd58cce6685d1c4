use futures_util::StreamExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// How a pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// The queue was fully drained and every handler finished.
    Drained,
    /// Cancellation fired; remaining queue entries were discarded.
    Canceled,
}

/// Fan `items` out over at most `max_workers` concurrent invocations of
/// `handler`. The producer feeds an unbounded queue in iteration order while
/// consumers take from it FIFO; handlers may complete out of order. When the
/// cancellation token fires, in-flight handlers are cut off at their next
/// suspension point and whatever is still queued is dropped.
pub async fn run<T, I, F, Fut>(
    items: I,
    max_workers: usize,
    cancel: &CancellationToken,
    handler: F,
) -> PoolOutcome
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let producer = async move {
        for item in items {
            if tx.send(item).is_err() {
                break;
            }
        }
        // tx drops here, closing the queue so consumers drain and exit
    };
    let consumers =
        UnboundedReceiverStream::new(rx).for_each_concurrent(max_workers, |item| handler(item));

    tokio::select! {
        _ = cancel.cancelled() => PoolOutcome::Canceled,
        _ = async { tokio::join!(producer, consumers); } => PoolOutcome::Drained,
    }
}
