//! Source, sink, and streamer contracts.

use std::sync::Mutex;

use crate::Result;

/// Outcome of a single [`StreamSource::read_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// This many bytes were copied into the front of the buffer. Zero is a
    /// valid count and does not signal end-of-stream.
    Bytes(usize),
    /// The source has no more bytes.
    End,
}

/// A producer of bytes.
///
/// Sources are seekable so that a forked stream can rewind and replay the
/// tail of the byte sequence for a starved secondary sink.
pub trait StreamSource: Send {
    /// Copy bytes into `buf`. May copy any number in `0..=buf.len()`.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<Read>;

    /// Current byte offset from the start of the stream.
    fn position(&mut self) -> Result<u64>;

    /// Reposition the stream to the given byte offset.
    fn seek(&mut self, pos: u64) -> Result<()>;
}

/// A consumer of bytes. Must accept slices of any length, including empty.
pub trait StreamSink: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Result of [`fill_buffer`]: at least one of `num_bytes == buf.len()` and
/// `end` holds on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// Number of bytes written to the front of the buffer.
    pub num_bytes: usize,
    /// Did the source run out of bytes?
    pub end: bool,
}

/// Read from `source` until `buf` is full or the source ends.
pub fn fill_buffer(source: &mut dyn StreamSource, buf: &mut [u8]) -> Result<FillOutcome> {
    let mut num_bytes = 0;
    while num_bytes < buf.len() {
        match source.read_into(&mut buf[num_bytes..])? {
            Read::Bytes(n) => num_bytes += n,
            Read::End => return Ok(FillOutcome { num_bytes, end: true }),
        }
    }
    Ok(FillOutcome { num_bytes, end: false })
}

/// What to do with the secondary sink once the primary sink has received the
/// complete byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryStreamDecision {
    /// Feed the secondary sink to completion, rewinding the source if
    /// feeding was abandoned partway.
    Finish,
    /// Cancel the secondary sink by injecting a synthetic end marker.
    Abandon,
}

/// Arguments to [`Streamer::forked_stream`].
///
/// The callbacks may be invoked from either the calling thread or the
/// streamer's background thread, but never concurrently.
pub struct ForkedStream<'a> {
    pub source: &'a mut dyn StreamSource,
    /// Fed with backpressure; always receives the complete byte sequence.
    pub primary_sink: &'a mut dyn StreamSink,
    /// Fed opportunistically; receives the complete sequence only if
    /// `primary_done` returns [`SecondaryStreamDecision::Finish`].
    pub secondary_sink: &'a mut dyn StreamSink,
    /// Invoked once the primary sink has consumed every byte.
    pub primary_done: &'a mut (dyn FnMut() -> SecondaryStreamDecision + Send),
    pub primary_progress: &'a mut (dyn FnMut(usize) + Send),
    pub secondary_progress: &'a mut (dyn FnMut(usize) + Send),
}

/// Moves whole byte sequences from sources to sinks.
pub trait Streamer: Sync {
    /// Stream all bytes from `source` to `sink`, invoking `progress` with the
    /// size of each chunk as the sink accepts it.
    fn stream_with_progress(
        &self,
        source: &mut dyn StreamSource,
        sink: &mut dyn StreamSink,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> Result<()>;

    /// Stream all bytes from one source to two sinks. Returns once both
    /// sinks have been finalized or the secondary has been cancelled.
    fn forked_stream(&self, fork: ForkedStream<'_>) -> Result<()>;

    /// [`Streamer::stream_with_progress`] without a progress callback.
    fn stream(
        &self,
        source: &mut dyn StreamSource,
        sink: &mut dyn StreamSink,
    ) -> Result<()> {
        self.stream_with_progress(source, sink, &mut |_| {})
    }
}

/// Adapter that lets a sink be shared between a forked stream's sink slot
/// and its `primary_done` callback: both sides borrow the mutex, and the
/// streamer's serialization of callbacks keeps the lock uncontended.
pub struct SharedSink<'a, S>(&'a Mutex<S>);

impl<'a, S> SharedSink<'a, S> {
    pub fn new(sink: &'a Mutex<S>) -> Self {
        Self(sink)
    }
}

impl<S: StreamSink> StreamSink for SharedSink<'_, S> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.lock().unwrap().write(bytes)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn fill_buffer_fills_across_short_reads() {
        let mut source = SliceSource::new(b"abcdefghij".to_vec(), 3).with_stutter();
        let mut buf = [0u8; 8];
        let outcome = fill_buffer(&mut source, &mut buf).unwrap();
        assert_eq!(outcome, FillOutcome { num_bytes: 8, end: false });
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn fill_buffer_reports_end() {
        let mut source = SliceSource::new(b"xy".to_vec(), 16);
        let mut buf = [0u8; 8];
        let outcome = fill_buffer(&mut source, &mut buf).unwrap();
        assert_eq!(outcome, FillOutcome { num_bytes: 2, end: true });
        assert_eq!(&buf[..2], b"xy");
    }

    #[test]
    fn fill_buffer_empty_source() {
        let mut source = SliceSource::new(Vec::new(), 16);
        let mut buf = [0u8; 4];
        let outcome = fill_buffer(&mut source, &mut buf).unwrap();
        assert_eq!(outcome, FillOutcome { num_bytes: 0, end: true });
    }
}
