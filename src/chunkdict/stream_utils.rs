/// Stream utilities for async/sync bridging
///
/// Registry content arrives as an async byte stream, while decompression and
/// tar parsing are synchronous readers. `ChannelReader` sits between the two.
use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::chunkdict::fetch_error::FetchError;

/// Byte stream of a fetched blob
pub type BlobStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Pull the next chunk, failing if the source stalls longer than `stall_timeout`
pub async fn next_chunk(
    stream: &mut BlobStream,
    stall_timeout: Duration,
) -> Result<Option<Bytes>, FetchError> {
    match tokio::time::timeout(stall_timeout, stream.next()).await {
        Ok(Some(chunk)) => chunk.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(FetchError::TimeoutError(format!(
            "no data received for {:?}",
            stall_timeout
        ))),
    }
}

/// Reader that pulls bytes from a tokio mpsc channel
///
/// Must be read from a blocking context (`spawn_blocking`), never from an
/// async task.
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(data) => self.current = data,
                // Channel closed - EOF
                None => return Ok(0),
            }
        }

        let to_copy = self.current.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&self.current.split_to(to_copy));
        Ok(to_copy)
    }
}
