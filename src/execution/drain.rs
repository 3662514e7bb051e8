//! Worker threads that move bytes through the parent's pipe ends.
//!
//! Output drains start before input is delivered and before the child is
//! reaped, so a child that fills its stdout pipe while still reading stdin
//! never deadlocks against the parent. Chunks travel over a channel and are
//! assembled only after the child has exited.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{debug, trace, warn};

use super::result::{OutputChunk, OutputSource};

/// Default buffer size for reading pipe output.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Read `reader` to end of stream, passing each chunk to `sink`.
///
/// Interrupted reads are retried. Any other error ends the drain with what
/// was read so far. Returns the number of bytes read.
pub fn drain_to_end<R, F>(mut reader: R, buffer_size: usize, mut sink: F) -> usize
where
    R: Read,
    F: FnMut(&[u8]) -> bool,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                trace!("drain: read {} bytes", n);
                if !sink(&buf[..n]) {
                    debug!("drain: receiver gone");
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("drain: read error after {} bytes: {}", total, e);
                break;
            }
        }
    }
    total
}

/// Write all of `payload` to `writer`, then close it.
///
/// Interrupted writes are retried; any other error (typically a broken pipe
/// because the child stopped reading) ends the transfer. The writer is
/// dropped on every path so the child sees end of input. Returns the number
/// of bytes transferred.
pub fn deliver_input<W: Write>(mut writer: W, payload: &[u8]) -> usize {
    let mut written = 0;

    while written < payload.len() {
        match writer.write(&payload[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("input: write stopped after {} bytes: {}", written, e);
                break;
            }
        }
    }
    drop(writer);

    if written < payload.len() {
        warn!(
            "input: delivered {} of {} bytes before the pipe closed",
            written,
            payload.len()
        );
    }
    written
}

/// Background drains for a child's stdout and stderr.
pub(crate) struct OutputCollector {
    rx: mpsc::Receiver<OutputChunk>,
    workers: Vec<JoinHandle<()>>,
}

impl OutputCollector {
    /// Start one drain thread per available read end.
    pub(crate) fn spawn(
        stdout: Option<File>,
        stderr: Option<File>,
        buffer_size: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(2);

        for (reader, source) in [(stdout, OutputSource::Stdout), (stderr, OutputSource::Stderr)] {
            let Some(reader) = reader else { continue };
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("procpipe-{}", source.as_str()))
                .spawn(move || {
                    let total = drain_to_end(reader, buffer_size, |chunk| {
                        tx.send(OutputChunk::new(chunk.to_vec(), source)).is_ok()
                    });
                    debug!("{} drain finished: {} bytes", source.as_str(), total);
                })?;
            workers.push(handle);
        }

        Ok(Self { rx, workers })
    }

    /// Wait for both streams to reach end of file and assemble them.
    pub(crate) fn collect(self) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // Ends once every worker has dropped its sender.
        for chunk in self.rx {
            match chunk.source {
                OutputSource::Stdout => stdout.extend_from_slice(&chunk.raw),
                OutputSource::Stderr => stderr.extend_from_slice(&chunk.raw),
            }
        }
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("output drain thread panicked");
            }
        }
        (stdout, stderr)
    }

    /// Like [`collect`](Self::collect), but give up after `grace`.
    ///
    /// Descendants of a killed child may still hold the write ends. Chunks
    /// received before the cut-off are kept and the workers are left to
    /// finish on their own.
    pub(crate) fn collect_within(self, grace: Duration) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = Instant::now() + grace;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => match chunk.source {
                    OutputSource::Stdout => stdout.extend_from_slice(&chunk.raw),
                    OutputSource::Stderr => stderr.extend_from_slice(&chunk.raw),
                },
                Err(RecvTimeoutError::Disconnected) => {
                    for worker in self.workers {
                        if worker.join().is_err() {
                            warn!("output drain thread panicked");
                        }
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "output pipes still open {:?} after kill, detaching {} drain(s)",
                        grace,
                        self.workers.len()
                    );
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    /// Stop listening. Workers exit on their own once the pipes close.
    pub(crate) fn abandon(self) {
        debug!("abandoning {} output drain(s)", self.workers.len());
    }
}

/// Background delivery of the input payload.
pub(crate) struct InputFeeder {
    handle: JoinHandle<usize>,
}

impl InputFeeder {
    pub(crate) fn spawn(writer: File, payload: Vec<u8>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("procpipe-stdin".to_string())
            .spawn(move || {
                block_sigpipe();
                deliver_input(writer, &payload)
            })?;
        Ok(Self { handle })
    }

    /// Bytes delivered if the feeder is already done, without blocking.
    ///
    /// A feeder still stuck on a full pipe is detached.
    pub(crate) fn join_if_finished(self) -> Option<usize> {
        if self.handle.is_finished() {
            Some(self.join())
        } else {
            debug!("input feeder still blocked, detaching");
            None
        }
    }

    /// Bytes delivered, once the feeder has finished.
    pub(crate) fn join(self) -> usize {
        self.handle.join().unwrap_or_else(|_| {
            warn!("input feeder thread panicked");
            0
        })
    }
}

/// Turn SIGPIPE into `EPIPE` for writes from the calling thread, whatever
/// the process-wide disposition is.
fn block_sigpipe() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!(%errno, "could not block SIGPIPE on the feeder thread");
    }
}
