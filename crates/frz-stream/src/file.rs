//! File-backed stream sources and sinks.

use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Seek, SeekFrom, Write};
use std::path::Path;

use crate::stream::{Read, StreamSink, StreamSource};
use crate::{Result, StreamError};

/// Reads a file from the beginning. Seekable, so it can back a forked
/// stream's rewind.
pub struct FileSource {
    file: File,
    eof: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { file: File::open(path)?, eof: false })
    }
}

impl StreamSource for FileSource {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<Read> {
        if self.eof || buf.is_empty() {
            return Ok(if self.eof { Read::End } else { Read::Bytes(0) });
        }
        let n = self.file.read(buf)?;
        if n == 0 {
            self.eof = true;
            return Ok(Read::End);
        }
        Ok(Read::Bytes(n))
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.eof = false;
        Ok(())
    }
}

/// Writes a freshly created file. Creation is exclusive: an existing file at
/// the path yields [`StreamError::FileExists`].
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create_new(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StreamError::FileExists,
                _ => StreamError::Io(e),
            })?;
        Ok(Self { file })
    }
}

impl StreamSink for FileSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }
}
