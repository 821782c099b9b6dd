//! In-process chunk pipe
//!
//! Connects a producer writing with `std::io::Write` to a consumer reading
//! with `std::io::Read` on another thread. The channel is bounded so the
//! producer stalls instead of buffering a whole object. Neither end may
//! run on an async worker thread.

use bytes::{Buf, Bytes};
use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

enum Chunk {
    Data(Bytes),
    Failed(String),
}

/// Writing half of a chunk pipe
pub struct PipeWriter {
    tx: SyncSender<Chunk>,
}

/// Reading half of a chunk pipe
pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Bytes,
}

/// Create a pipe holding at most `depth` in-flight chunks
pub fn chunk_pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(depth.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

impl PipeWriter {
    /// Close the pipe so the reader sees an error instead of a clean end of stream
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Chunk::Failed(reason.into()));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Chunk::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while !self.current.has_remaining() {
            match self.rx.recv() {
                Ok(Chunk::Data(chunk)) => self.current = chunk,
                Ok(Chunk::Failed(reason)) => return Err(io::Error::other(reason)),
                // Writer dropped: clean end of stream
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}
