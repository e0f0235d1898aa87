//! ICCCM selections
//!
//! Pasting converts the selection to `TARGETS` first, lets the sink pick one of the offered
//! types and converts again to that type. Owners answer with the data in a property on the
//! requestor's window, or with an `INCR` marker followed by chunks written each time the
//! requestor deleted the previous one. A zero-length chunk ends an `INCR` transfer.
//!
//! The helpers in this module are shared with the XDND drop path, which fetches dropped data
//! through the `XdndSelection` selection the same way.

use std::io::{ErrorKind, Read};

use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, Window};

use crate::{
    atoms::Atoms,
    buffer::read_property,
    config::TransferConfig,
    conn::XConnection,
    data::DataSink,
    error::TransferError,
    task::ClipboardSend,
};

mod receive;
mod send;

/// Outcome of handling one event for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The task waits for more events
    Pending,
    /// The task is done
    Done,
}

/// What the owner answered to a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Incoming {
    Complete,
    Incremental,
}

/// Reads the owner's answer to a conversion to `expected` and hands the data to `sink`.
pub(crate) fn read_simple<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    config: &TransferConfig,
    window: Window,
    property: Atom,
    expected: Atom,
    sink: &mut dyn DataSink,
) -> Result<Incoming, TransferError> {
    let prop = read_property(conn, window, property, true, config.property_read_length)?;
    if prop.type_ == atoms.INCR {
        trace!(window, "Owner starts an incremental transfer");
        conn.flush()?;
        return Ok(Incoming::Incremental);
    }
    if prop.type_ != expected {
        debug!(
            window,
            expected,
            actual = prop.type_,
            "Selection data has an unexpected type"
        );
        return Err(TransferError::UnsupportedFormat);
    }

    if !prop.data.is_empty() {
        sink.write(&prop.data)?;
    }
    Ok(Incoming::Complete)
}

/// Reads the next chunk of an `INCR` transfer after the owner announced it.
pub(crate) fn read_chunk<C: XConnection + ?Sized>(
    conn: &C,
    config: &TransferConfig,
    window: Window,
    property: Atom,
    sink: &mut dyn DataSink,
) -> Result<Progress, TransferError> {
    let prop = read_property(conn, window, property, true, config.property_read_length)?;
    if !prop.exists() {
        // deleted again before we got to read it
        trace!(window, property, "Spurious incremental chunk notification");
        return Ok(Progress::Pending);
    }
    // deleting the property asks the owner for the next chunk
    conn.flush()?;

    if prop.data.is_empty() {
        trace!(window, "Incremental transfer finished");
        return Ok(Progress::Done);
    }
    trace!(window, len = prop.data.len(), "Received incremental chunk");
    sink.write(&prop.data)?;
    Ok(Progress::Pending)
}

/// Writes the next chunk of an `INCR` transfer after the requestor deleted the previous one.
pub(crate) fn send_chunk<C: XConnection + ?Sized>(
    conn: &C,
    config: &TransferConfig,
    task: &mut ClipboardSend,
) -> Result<Progress, TransferError> {
    let chunk_size = config.chunk_size.max(1);
    let mut chunk = std::mem::take(&mut task.pending);
    if chunk.len() > chunk_size {
        task.pending = chunk.split_off(chunk_size);
    }

    if let Some(stream) = task.stream.as_mut() {
        let mut buf = vec![0; chunk_size];
        while chunk.len() < chunk_size {
            let want = chunk_size - chunk.len();
            match stream.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(len) => chunk.extend_from_slice(&buf[..len]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(?err, "Reading from data source failed");
                    return Err(TransferError::Stream);
                }
            }
        }
    }

    conn.change_property(task.requestor, task.property, task.target, 8, &chunk)?;
    if chunk.is_empty() {
        trace!(requestor = task.requestor, "Sent last incremental chunk");
        Ok(Progress::Done)
    } else {
        trace!(requestor = task.requestor, len = chunk.len(), "Sent incremental chunk");
        Ok(Progress::Pending)
    }
}
