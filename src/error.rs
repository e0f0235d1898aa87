//! Error types of the transfer engine

use x11rb::{
    errors::{ConnectionError, ReplyError, ReplyOrIdError},
    protocol::{
        xproto::{Atom, Window},
        ErrorKind,
    },
    x11_utils::X11Error,
};

/// Failure of a single request sent to the window system.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The request referenced a window that does not exist (anymore).
    #[error("Window {0:#x} does not exist")]
    BadWindow(Window),

    /// The request referenced an atom that does not exist.
    #[error("Atom {0} does not exist")]
    BadAtom(Atom),

    /// The connection to the X server broke.
    #[error("Connection to the X server failed")]
    Connection(#[from] ConnectionError),

    /// The X server answered the request with an error.
    #[error("The X server returned an error")]
    Reply(ReplyError),

    /// Allocating an id for a new resource failed.
    #[error("Failed to allocate a resource id")]
    Id(#[from] ReplyOrIdError),
}

impl From<ReplyError> for ConnError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::X11Error(err) => ConnError::from(err),
            ReplyError::ConnectionError(err) => ConnError::Connection(err),
        }
    }
}

impl From<X11Error> for ConnError {
    fn from(err: X11Error) -> Self {
        match err.error_kind {
            ErrorKind::Window => ConnError::BadWindow(err.bad_value),
            ErrorKind::Atom => ConnError::BadAtom(err.bad_value),
            _ => ConnError::Reply(ReplyError::X11Error(err)),
        }
    }
}

/// Outcome of a failed transfer task.
///
/// This is what a [`DataSink`](crate::data::DataSink) receives in `close` and what
/// decides the success bit of an XDND `Finished` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// A property had an unexpected type while negotiating the transfer format.
    #[error("Unexpected property format")]
    BadFormat,
    /// No common MIME type, or the data arrived with a different type than negotiated.
    #[error("No supported data format")]
    UnsupportedFormat,
    /// A peer sent a message that does not fit the state of the transfer.
    #[error("Protocol violation by peer")]
    Protocol,
    /// The transfer was cancelled by a clear, a leave or a shutdown.
    #[error("Transfer cancelled")]
    Cancelled,
    /// Memory for a type list or data buffer could not be allocated.
    #[error("Out of memory")]
    NoMemory,
    /// A window taking part in the transfer was destroyed.
    #[error("Window destroyed during transfer")]
    BadWindow,
    /// The connection to the window system failed.
    #[error("Window system transport error")]
    Transport,
    /// No progress was made within the configured transfer timeout.
    #[error("Transfer timed out")]
    TimedOut,
    /// Reading from the source stream failed.
    #[error("Failed to read from data source")]
    Stream,
    /// The sink refused the written data.
    #[error("Data sink failed")]
    Sink,
}

impl From<ConnError> for TransferError {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::BadWindow(_) => TransferError::BadWindow,
            _ => TransferError::Transport,
        }
    }
}

impl From<std::collections::TryReserveError> for TransferError {
    fn from(_: std::collections::TryReserveError) -> Self {
        TransferError::NoMemory
    }
}
