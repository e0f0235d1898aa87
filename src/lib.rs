#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like INCR
#![allow(clippy::upper_case_acronyms)]

//! # xtransfer: X11 clipboard and drag and drop transfers
//!
//! This crate implements the data transfer protocols of X11 for a client that already has a
//! connection to the server: ICCCM selections (the clipboards) including `INCR` transfers of
//! large data, and the XDND drag and drop protocol as drop target and as proxy for embedded
//! windows.
//!
//! ## Structure of the crate
//!
//! The [`Dispatcher`] is the entry point. It is created once per display and owns every running
//! transfer. All other modules provide the pieces it is built from:
//!
//! - [`conn`] abstracts the requests sent to the X server, implemented for x11rb's
//!   `RustConnection`.
//! - [`data`] contains the [`DataSource`] and [`DataSink`] traits data is read from and written
//!   to, together with in-memory and pipe based implementations.
//! - [`selection`] and [`dnd`] implement the two protocols.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! The engine never blocks and never spawns threads. The host reads events from the connection
//! in its own event loop and hands every one of them to [`Dispatcher::handle_event`]. Transfers
//! waiting for a peer just sit in the task table until the next matching event arrives.
//!
//! ```no_run
//! use std::rc::Rc;
//! use x11rb::connection::Connection;
//! use xtransfer::{data::MemorySource, Clipboard, Dispatcher, TransferConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (conn, _screen) = x11rb::connect(None)?;
//! # let window = 0;
//! let mut engine = Dispatcher::new(conn, TransferConfig::default())?;
//! let source = MemorySource::new().with("text/plain;charset=utf-8", "hello");
//! engine.set_selection(Clipboard::Clipboard, window, Rc::new(source), x11rb::CURRENT_TIME)?;
//!
//! loop {
//!     let event = engine.conn().wait_for_event()?;
//!     engine.handle_event(&event);
//! }
//! # }
//! ```
//!
//! ### Logging
//!
//! xtransfer makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod atoms;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod data;
pub mod dispatcher;
pub mod dnd;
pub mod error;
pub mod mime;
pub mod selection;
pub mod task;

#[cfg(test)]
mod testing;

pub use atoms::{Clipboard, DndAction};
pub use config::TransferConfig;
pub use conn::XConnection;
pub use data::{DataSink, DataSource, InputStream};
pub use dispatcher::{Dispatcher, EventStatus};
pub use dnd::{DragHandler, DragPosition, Rect};
pub use error::{ConnError, TransferError};
pub use mime::MimeTypeList;
