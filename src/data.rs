//! Producers and consumers of transferred data
//!
//! A [`DataSource`] offers data in several MIME types and opens an [`InputStream`] for one of
//! them. A [`DataSink`] picks one type out of a [`MimeTypeList`] and consumes the bytes.
//!
//! Sinks are owned by exactly one transfer task. The engine calls `open` once, `write` any
//! number of times and `close` exactly once, after which the sink is dropped. Sources are
//! shared through an [`Rc`] because several requestors may paste from the same selection
//! at the same time.

use std::{
    cell::RefCell,
    io::{self, Cursor, Read},
    os::fd::OwnedFd,
    rc::Rc,
};

use tracing::warn;

use crate::{error::TransferError, mime::MimeTypeList};

/// Stream of bytes produced by a [`DataSource`]
pub trait InputStream: Read {
    /// Total number of bytes the stream will produce, if known in advance.
    fn size_hint(&self) -> Option<usize> {
        None
    }

    /// Called once when the transfer using this stream is over.
    fn close(&mut self) {}
}

/// Provider of data for a selection
pub trait DataSource {
    /// MIME types the data is available in, most preferred first
    fn mime_types(&self) -> Vec<String>;

    /// Opens a stream producing the data as `mime_type`.
    fn open(&self, mime_type: &str) -> Option<Box<dyn InputStream>>;
}

/// Consumer of received data
pub trait DataSink {
    /// Chooses one of the offered types and returns its index into `mime_types`.
    fn open(&mut self, mime_types: &MimeTypeList) -> Result<usize, TransferError>;

    /// Consumes the next piece of data.
    fn write(&mut self, data: &[u8]) -> Result<(), TransferError>;

    /// Ends the transfer with its final outcome.
    fn close(&mut self, status: Result<(), TransferError>);
}

impl InputStream for Cursor<Vec<u8>> {
    fn size_hint(&self) -> Option<usize> {
        let len = self.get_ref().len() as u64;
        Some(len.saturating_sub(self.position()) as usize)
    }
}

/// In-memory [`DataSource`] with one buffer per MIME type
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    entries: Vec<(String, Vec<u8>)>,
}

impl MemorySource {
    /// Creates a source without any data
    pub fn new() -> MemorySource {
        MemorySource::default()
    }

    /// Adds `data` as `mime_type`. Types are offered in insertion order.
    pub fn with(mut self, mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> MemorySource {
        self.entries.push((mime_type.into(), data.into()));
        self
    }
}

impl DataSource for MemorySource {
    fn mime_types(&self) -> Vec<String> {
        self.entries.iter().map(|(mime, _)| mime.clone()).collect()
    }

    fn open(&self, mime_type: &str) -> Option<Box<dyn InputStream>> {
        self.entries
            .iter()
            .find(|(mime, _)| mime == mime_type)
            .map(|(_, data)| Box::new(Cursor::new(data.clone())) as Box<dyn InputStream>)
    }
}

/// What a [`MemorySink`] received
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Received {
    /// Type chosen in `open`
    pub mime_type: Option<String>,
    /// Bytes written so far
    pub data: Vec<u8>,
    /// Final outcome, `None` while the transfer is running
    pub status: Option<Result<(), TransferError>>,
}

/// [`DataSink`] collecting the data in memory.
///
/// The received data is shared with the handle returned by [`MemorySink::new`], so it can be
/// inspected after the engine dropped the sink.
#[derive(Debug)]
pub struct MemorySink {
    accepted: Vec<String>,
    received: Rc<RefCell<Received>>,
}

impl MemorySink {
    /// Creates a sink accepting `accepted` (most preferred first).
    pub fn new<S: Into<String>>(
        accepted: impl IntoIterator<Item = S>,
    ) -> (MemorySink, Rc<RefCell<Received>>) {
        let received = Rc::new(RefCell::new(Received::default()));
        let sink = MemorySink {
            accepted: accepted.into_iter().map(Into::into).collect(),
            received: received.clone(),
        };
        (sink, received)
    }
}

impl DataSink for MemorySink {
    fn open(&mut self, mime_types: &MimeTypeList) -> Result<usize, TransferError> {
        let index = mime_types
            .best_match(&self.accepted)
            .ok_or(TransferError::UnsupportedFormat)?;
        self.received.borrow_mut().mime_type = mime_types.get(index).map(str::to_owned);
        Ok(index)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let mut received = self.received.borrow_mut();
        received.data.try_reserve(data.len())?;
        received.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self, status: Result<(), TransferError>) {
        self.received.borrow_mut().status = Some(status);
    }
}

/// [`DataSink`] writing the received data into a file descriptor, usually a pipe.
#[derive(Debug)]
pub struct PipeSink {
    accepted: Vec<String>,
    fd: Option<OwnedFd>,
}

impl PipeSink {
    /// Creates a sink accepting `accepted` (most preferred first) writing into `fd`.
    pub fn new<S: Into<String>>(fd: OwnedFd, accepted: impl IntoIterator<Item = S>) -> PipeSink {
        PipeSink {
            accepted: accepted.into_iter().map(Into::into).collect(),
            fd: Some(fd),
        }
    }
}

impl DataSink for PipeSink {
    fn open(&mut self, mime_types: &MimeTypeList) -> Result<usize, TransferError> {
        mime_types
            .best_match(&self.accepted)
            .ok_or(TransferError::UnsupportedFormat)
    }

    fn write(&mut self, mut data: &[u8]) -> Result<(), TransferError> {
        let fd = self.fd.as_ref().ok_or(TransferError::Sink)?;
        while !data.is_empty() {
            match rustix::io::write(fd, data) {
                Ok(len) => data = &data[len..],
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => {
                    warn!(?err, "Writing transfer data failed");
                    return Err(TransferError::Sink);
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, _status: Result<(), TransferError>) {
        // closing the write end signals EOF to the reader
        self.fd.take();
    }
}

/// [`InputStream`] reading from a file descriptor, usually a pipe.
#[derive(Debug)]
pub struct PipeStream {
    fd: Option<OwnedFd>,
}

impl PipeStream {
    /// Wraps the read end of a pipe
    pub fn new(fd: OwnedFd) -> PipeStream {
        PipeStream { fd: Some(fd) }
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref() else {
            return Ok(0);
        };
        loop {
            match rustix::io::read(fd, &mut *buf) {
                Ok(len) => return Ok(len),
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl InputStream for PipeStream {
    fn close(&mut self) {
        self.fd.take();
    }
}

/// Copies everything from `stream` into `sink`, in pieces of at most `chunk_size` bytes.
pub(crate) fn copy_stream(
    stream: &mut dyn InputStream,
    sink: &mut dyn DataSink,
    chunk_size: usize,
) -> Result<(), TransferError> {
    let mut buf = vec![0; chunk_size.max(1)];
    loop {
        let len = match stream.read(&mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(?err, "Reading from data source failed");
                return Err(TransferError::Stream);
            }
        };
        if len == 0 {
            return Ok(());
        }
        sink.write(&buf[..len])?;
    }
}
