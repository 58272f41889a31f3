//! Single-threaded streamer: one buffer, alternating read and write calls.

use crate::stream::{fill_buffer, ForkedStream, Read, StreamSink, StreamSource, Streamer};
use crate::Result;

/// Streams by alternating calls to the source and the sink on the calling
/// thread. Not interruptible; suited to tests and small transfers.
pub struct SingleThreadedStreamer {
    buffer_size: usize,
}

impl SingleThreadedStreamer {
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0);
        Self { buffer_size }
    }
}

impl Streamer for SingleThreadedStreamer {
    fn stream_with_progress(
        &self,
        source: &mut dyn StreamSource,
        sink: &mut dyn StreamSink,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> Result<()> {
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            match source.read_into(&mut buffer)? {
                Read::Bytes(n) => {
                    sink.write(&buffer[..n])?;
                    progress(n);
                }
                Read::End => return Ok(()),
            }
        }
    }

    /// Sequential rendition of the fork: each chunk goes to the primary and
    /// then to the secondary, so the secondary is always complete by the
    /// time `primary_done` runs and no rewind is ever needed.
    fn forked_stream(&self, fork: ForkedStream<'_>) -> Result<()> {
        let ForkedStream {
            source,
            primary_sink,
            secondary_sink,
            primary_done,
            primary_progress,
            secondary_progress,
        } = fork;
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let outcome = fill_buffer(source, &mut buffer)?;
            let chunk = &buffer[..outcome.num_bytes];
            primary_sink.write(chunk)?;
            primary_progress(outcome.num_bytes);
            secondary_sink.write(chunk)?;
            secondary_progress(outcome.num_bytes);
            if outcome.end {
                break;
            }
        }
        // Finish and Abandon coincide here: the secondary has already seen
        // every byte.
        let _ = primary_done();
        Ok(())
    }
}
