//! The sender worker.
//!
//! Each worker owns one connection and one batch buffer. It draws random lines
//! from the corpus, counts each one into the shared [`Accumulator`], and
//! writes the buffer as a single datagram every `batch_size` lines, until the
//! deadline fires.
//!
//! ## Metrics
//!
//! `metrics_generated`: Metric lines generated, flushed or not
//! `bytes_written`: Bytes written successfully
//! `packets_sent`: Datagrams written successfully
//! `request_failure`: Number of failed writes; the failed batch is dropped
//! `connection_failure`: Number of connection setup failures
//!

use std::{io, num::NonZeroU32, sync::Arc};

use capella_signal::Watcher;
use metrics::counter;
use rand::rngs::SmallRng;
use tracing::{debug, error, warn};

use crate::{
    accumulator::Accumulator,
    corpus::Corpus,
    transport::{Connection, MAX_DATAGRAM_BYTES, Transport},
};

/// Errors produced by [`Worker`].
///
/// Neither is fatal to the run. Both are logged where they happen and never
/// leave the worker.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The worker could not open its connection and stopped.
    #[error("Connection setup to {addr} failed: {source}")]
    ConnectionSetupFailed {
        /// Endpoint address
        addr: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// A batch could not be written and was dropped.
    #[error("Transmission of {lines} metric batch to {addr} failed: {source}")]
    TransmissionFailed {
        /// Endpoint address
        addr: String,
        /// Lines in the dropped batch
        lines: u32,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
/// A single sender.
pub struct Worker<T> {
    id: usize,
    transport: Arc<T>,
    corpus: Arc<Corpus>,
    accumulator: Accumulator,
    batch_size: NonZeroU32,
    rng: SmallRng,
    deadline: Watcher,
    metric_labels: Vec<(String, String)>,
}

impl<T> Worker<T>
where
    T: Transport,
{
    /// Create a new [`Worker`].
    ///
    /// Nothing is opened until [`Worker::spin`].
    #[must_use]
    pub fn new(
        id: usize,
        transport: Arc<T>,
        corpus: Arc<Corpus>,
        accumulator: Accumulator,
        batch_size: NonZeroU32,
        rng: SmallRng,
        deadline: Watcher,
    ) -> Self {
        let metric_labels = vec![
            ("component".to_string(), "worker".to_string()),
            ("worker".to_string(), id.to_string()),
        ];
        Self {
            id,
            transport,
            corpus,
            accumulator,
            batch_size,
            rng,
            deadline,
            metric_labels,
        }
    }

    /// Run [`Worker`] until the deadline fires, returning the number of
    /// metrics it generated.
    ///
    /// If the connection cannot be opened the failure is logged and the
    /// worker returns zero without generating anything. The connection is
    /// dropped exactly once, when this function returns.
    pub async fn spin(mut self) -> u64 {
        let mut connection = match self.transport.connect().await {
            Ok(conn) => conn,
            Err(source) => {
                let err = Error::ConnectionSetupFailed {
                    addr: self.transport.endpoint().to_string(),
                    source,
                };
                error!(worker = self.id, "{err}");
                counter!("connection_failure", &self.metric_labels).increment(1);
                return 0;
            }
        };
        debug!(worker = self.id, "connected to {}", self.transport.endpoint());

        let metrics_generated = counter!("metrics_generated", &self.metric_labels);
        let bytes_written = counter!("bytes_written", &self.metric_labels);
        let packets_sent = counter!("packets_sent", &self.metric_labels);
        let request_failure = counter!("request_failure", &self.metric_labels);

        let batch_size = self.batch_size.get();
        // Capped at one datagram; larger batches grow the buffer on demand.
        let capacity = (self.corpus.longest_line() + 1)
            .saturating_mul(batch_size as usize)
            .min(MAX_DATAGRAM_BYTES);
        let mut buffer: Vec<u8> = Vec::with_capacity(capacity);
        let mut batched: u32 = 0;
        let mut generated: u64 = 0;

        loop {
            if self.deadline.has_fired() {
                break;
            }

            let line = self.corpus.choose(&mut self.rng);
            buffer.extend_from_slice(line.as_bytes());
            buffer.push(b'\n');
            self.accumulator.increment();
            generated += 1;
            batched += 1;

            if batched == batch_size {
                metrics_generated.increment(u64::from(batched));
                match connection.transmit(&buffer).await {
                    Ok(bytes) => {
                        bytes_written.increment(bytes as u64);
                        packets_sent.increment(1);
                    }
                    Err(source) => {
                        let err = Error::TransmissionFailed {
                            addr: self.transport.endpoint().to_string(),
                            lines: batched,
                            source,
                        };
                        warn!(worker = self.id, "{err}");
                        request_failure.increment(1);
                    }
                }
                buffer.clear();
                batched = 0;
            }
        }

        // Whatever is left in the buffer was counted but is never sent.
        metrics_generated.increment(u64::from(batched));
        debug!(
            worker = self.id,
            generated,
            unflushed = batched,
            "deadline reached, closing connection"
        );
        drop(connection);
        generated
    }
}
