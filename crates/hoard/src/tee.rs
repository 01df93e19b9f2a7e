//! Fan-out of one byte stream to several independent consumers.
//!
//! The driver pulls a chunk from the source, hands a cheap [`Bytes`]
//! clone to every consumer, and only then advances - so the slowest
//! consumer backpressures the origin and at most one chunk per consumer
//! is in flight. A source error is forwarded to every consumer and
//! returned (the original, unwrapped) from the driver; a consumer that
//! goes away aborts the whole fan-out.

use std::io;

use bytes::Bytes;
use futures::{Future, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::store::ByteStream;

/// Why a fan-out stopped early.
#[derive(Debug)]
pub enum FanOutError {
    /// The source stream itself failed; carries the originating error.
    Source(io::Error),
    /// A consumer dropped its stream before the source was exhausted.
    ConsumerGone,
}

/// Split `source` into `consumers` independent [`ByteStream`]s plus a
/// driver future.
///
/// The driver must be polled for bytes to flow; it resolves with the
/// total byte count once the source is exhausted and every chunk has been
/// accepted by every consumer.
pub fn fan_out(
    source: ByteStream,
    consumers: usize,
) -> (Vec<ByteStream>, impl Future<Output = Result<u64, FanOutError>>) {
    let mut senders = Vec::with_capacity(consumers);
    let mut streams: Vec<ByteStream> = Vec::with_capacity(consumers);

    for _ in 0..consumers {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
        senders.push(tx);
        streams.push(Box::pin(ReceiverStream::new(rx)));
    }

    let driver = async move {
        let mut source = source;
        let mut total = 0u64;

        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    total += chunk.len() as u64;
                    for tx in &senders {
                        if tx.send(Ok(chunk.clone())).await.is_err() {
                            return Err(FanOutError::ConsumerGone);
                        }
                    }
                }
                Err(e) => {
                    // io::Error is not Clone; consumers get a copy with the
                    // same kind and message, the caller gets the original.
                    for tx in &senders {
                        let copy = io::Error::new(e.kind(), e.to_string());
                        let _ = tx.send(Err(copy)).await;
                    }
                    return Err(FanOutError::Source(e));
                }
            }
        }

        Ok(total)
    };

    (streams, driver)
}

/// Two-way split, the common case for write fan-out and read-through
/// population.
pub fn fan_out_pair(
    source: ByteStream,
) -> (
    ByteStream,
    ByteStream,
    impl Future<Output = Result<u64, FanOutError>>,
) {
    let (mut streams, driver) = fan_out(source, 2);
    let second = streams.pop().expect("fan_out(2) yields two streams");
    let first = streams.pop().expect("fan_out(2) yields two streams");
    (first, second, driver)
}

/// Fold a driver result and any consumer failures into one outcome,
/// preferring the source's original error over the copies the consumers
/// received.
pub fn resolve_fan_out(
    driver: Result<u64, FanOutError>,
    consumer_errors: Vec<crate::error::StoreError>,
) -> Result<u64, crate::error::StoreError> {
    use crate::error::StoreError;

    match driver {
        Err(FanOutError::Source(e)) => Err(StoreError::Source(e)),
        Ok(total) => match consumer_errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(total),
        },
        Err(FanOutError::ConsumerGone) => match consumer_errors.into_iter().next() {
            Some(e) => Err(e),
            None => Err(StoreError::Io(io::Error::other(
                "byte stream fan-out aborted",
            ))),
        },
    }
}
