use std::io;

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use thiserror::Error;

use crate::datapoint::DataPoint;

/// Errors that could occur while encoding a batch.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The batch could not be serialized to JSON.
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The serialized batch could not be compressed.
    #[error("failed to compress batch: {0}")]
    Compress(#[from] io::Error),
}

/// Writes batches as gzip-compressed JSON arrays of OpenTSDB `put` objects.
///
/// The compression buffer is kept between batches so steady-state encoding does not allocate
/// beyond the payload handed to the transport.
pub(crate) struct PayloadWriter {
    buf: Vec<u8>,
    level: Compression,
}

impl PayloadWriter {
    /// Creates a new `PayloadWriter`.
    pub fn new() -> Self {
        PayloadWriter { buf: Vec::new(), level: Compression::default() }
    }

    /// Encodes `points` into a compressed payload.
    ///
    /// # Errors
    ///
    /// If the points cannot be serialized or compressed, an error is returned. Both failures are
    /// deterministic for a given batch, so retrying the same batch is pointless.
    pub fn write_batch(&mut self, points: &[DataPoint]) -> Result<Bytes, EncodeError> {
        self.buf.clear();
        let mut encoder = GzEncoder::new(std::mem::take(&mut self.buf), self.level);

        serde_json::to_writer(&mut encoder, points)?;
        let buf = encoder.finish()?;

        let payload = Bytes::copy_from_slice(&buf);
        self.buf = buf;
        Ok(payload)
    }
}
