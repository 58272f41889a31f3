//! # frz-stream
//!
//! Byte streaming between abstract sources and sinks.
//!
//! A [`StreamSource`] produces bytes in caller-supplied buffers; a
//! [`StreamSink`] accepts byte slices of any length. A [`Streamer`] moves the
//! entire contents of a source into a sink, reporting progress per delivered
//! chunk. Two implementations exist:
//!
//! - [`SingleThreadedStreamer`]: one buffer, alternating read/write calls.
//! - [`MultiThreadedStreamer`]: a bounded pool of lazily allocated buffers
//!   shared between a background thread and the caller, so reading and
//!   writing overlap in time.
//!
//! The multi-threaded streamer additionally supports a *forked* stream that
//! feeds one source to two sinks: the primary with backpressure, the
//! secondary opportunistically from a second buffer pool. See
//! [`Streamer::forked_stream`].

mod file;
mod multi;
mod single;
mod stream;
mod worker;

pub use file::{FileSink, FileSource};
pub use multi::{MultiThreadedStreamer, MultiThreadedStreamerOptions};
pub use single::SingleThreadedStreamer;
pub use stream::{
    fill_buffer, FillOutcome, ForkedStream, Read, SecondaryStreamDecision, SharedSink,
    StreamSink, StreamSource, Streamer,
};
pub use worker::Worker;

/// Errors produced while streaming bytes.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Creating a sink file failed because the destination already exists.
    #[error("destination file already exists")]
    FileExists,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
