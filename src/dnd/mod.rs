//! XDND drop target and proxy
//!
//! Drags are announced to a window with `XdndEnter`, followed by any number of `XdndPosition`
//! messages each answered by an `XdndStatus`, and end with either `XdndLeave` or `XdndDrop`.
//! After a drop the data is fetched through the `XdndSelection` selection like a normal paste,
//! and the source is told about the outcome with `XdndFinished`.
//!
//! Windows registered with [`Dispatcher::add_drop_target`](crate::Dispatcher::add_drop_target)
//! get their [`DragHandler`] called for every position and decide there whether to accept the
//! drop. Windows registered with [`Dispatcher::add_drag_proxy`](crate::Dispatcher::add_drag_proxy)
//! forward drags to the XDND aware child below the pointer.

use bitflags::bitflags;
use smallvec::SmallVec;
use tracing::trace;
use x11rb::protocol::xproto::{Atom, ClientMessageEvent, Timestamp, Window};

use crate::{
    atoms::{Atoms, DndAction},
    conn::XConnection,
    data::DataSink,
    error::{ConnError, TransferError},
    mime::MimeTypeList,
};

mod proxy;
mod receive;

/// XDND version implemented by the engine
pub const DND_VERSION: u32 = 5;

bitflags! {
    /// Flags of `XdndEnter`, the version lives in the high byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: u32 {
        /// The source offers more than three types, see `XdndTypeList`
        const MORE_TYPES = 1 << 0;
    }
}

bitflags! {
    /// Flags of `XdndStatus`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        /// The target accepts the drop
        const ACCEPT = 1 << 0;
        /// The target wants positions even inside the reported rectangle
        const WANT_POSITION = 1 << 1;
    }
}

bitflags! {
    /// Flags of `XdndFinished`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FinishedFlags: u32 {
        /// The drop was performed
        const SUCCESS = 1 << 0;
    }
}

/// Rectangle in root coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// Left edge
    pub x: i16,
    /// Top edge
    pub y: i16,
    /// Width
    pub width: u16,
    /// Height
    pub height: u16,
}

pub(crate) fn pack_point(x: i16, y: i16) -> u32 {
    (u32::from(x as u16) << 16) | u32::from(y as u16)
}

pub(crate) fn unpack_point(value: u32) -> (i16, i16) {
    ((value >> 16) as u16 as i16, (value & 0xffff) as u16 as i16)
}

/// Decoded XDND client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum XdndMessage {
    Enter {
        source: Window,
        flags: u32,
        types: SmallVec<[Atom; 3]>,
    },
    Position {
        source: Window,
        x: i16,
        y: i16,
        time: Timestamp,
        action: Atom,
    },
    Leave {
        source: Window,
    },
    Drop {
        source: Window,
        time: Timestamp,
    },
    Status,
    Finished,
}

impl XdndMessage {
    pub(crate) fn parse(event: &ClientMessageEvent, atoms: &Atoms) -> Option<XdndMessage> {
        if event.format != 32 {
            return None;
        }
        let data = event.data.as_data32();
        let message = match event.type_ {
            x if x == atoms.XdndEnter => XdndMessage::Enter {
                source: data[0],
                flags: data[1],
                types: data[2..5].iter().copied().filter(|atom| *atom != x11rb::NONE).collect(),
            },
            x if x == atoms.XdndPosition => {
                let (x, y) = unpack_point(data[2]);
                XdndMessage::Position {
                    source: data[0],
                    x,
                    y,
                    time: data[3],
                    action: data[4],
                }
            }
            x if x == atoms.XdndLeave => XdndMessage::Leave { source: data[0] },
            x if x == atoms.XdndDrop => XdndMessage::Drop {
                source: data[0],
                time: data[2],
            },
            x if x == atoms.XdndStatus => XdndMessage::Status,
            x if x == atoms.XdndFinished => XdndMessage::Finished,
            _ => return None,
        };
        Some(message)
    }
}

pub(crate) fn enter_version(flags: u32) -> u32 {
    flags >> 24
}

pub(crate) fn send_status<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    source: Window,
    target: Window,
    accepted: Option<(DndAction, Option<Rect>)>,
) -> Result<(), ConnError> {
    let data = match accepted {
        Some((action, Some(rect))) => [
            target,
            StatusFlags::ACCEPT.bits(),
            pack_point(rect.x, rect.y),
            pack_point(rect.width as i16, rect.height as i16),
            action.to_x(atoms),
        ],
        Some((action, None)) => [
            target,
            (StatusFlags::ACCEPT | StatusFlags::WANT_POSITION).bits(),
            0,
            0,
            action.to_x(atoms),
        ],
        None => [target, StatusFlags::WANT_POSITION.bits(), 0, 0, x11rb::NONE],
    };
    trace!(source, "Sending XdndStatus: {:?}", data);
    conn.send_client_message(source, ClientMessageEvent::new(32, source, atoms.XdndStatus, data))
}

pub(crate) fn send_finished<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    source: Window,
    target: Window,
    version: u32,
    outcome: Result<DndAction, TransferError>,
) -> Result<(), ConnError> {
    let mut data = [target, 0, 0, 0, 0];
    if version >= 5 {
        if let Ok(action) = outcome {
            data[1] = FinishedFlags::SUCCESS.bits();
            data[2] = action.to_x(atoms);
        }
    }
    trace!(source, "Sending XdndFinished: {:?}", data);
    conn.send_client_message(
        source,
        ClientMessageEvent::new(32, source, atoms.XdndFinished, data),
    )
}

pub(crate) fn send_enter<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    destination: Window,
    target: Window,
    source: Window,
    flags: u32,
    types: &[Atom],
) -> Result<(), ConnError> {
    let mut data = [source, flags, x11rb::NONE, x11rb::NONE, x11rb::NONE];
    for (i, atom) in types.iter().take(3).enumerate() {
        data[i + 2] = *atom;
    }
    trace!(destination, "Forwarding XdndEnter: {:?}", data);
    conn.send_client_message(
        destination,
        ClientMessageEvent::new(32, target, atoms.XdndEnter, data),
    )
}

pub(crate) fn send_leave<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    destination: Window,
    target: Window,
    source: Window,
) -> Result<(), ConnError> {
    trace!(destination, "Forwarding XdndLeave");
    conn.send_client_message(
        destination,
        ClientMessageEvent::new(32, target, atoms.XdndLeave, [source, 0, 0, 0, 0]),
    )
}

/// Callbacks of a window accepting drops
pub trait DragHandler {
    /// A drag offering `mime_types` entered `window`.
    fn enter(&mut self, window: Window, mime_types: &MimeTypeList) {
        let _ = (window, mime_types);
    }

    /// The drag moved inside the window.
    ///
    /// Call either [`DragPosition::accept`] or [`DragPosition::reject`]. Returning without a
    /// decision rejects the position.
    fn position(&mut self, position: &mut DragPosition<'_>);

    /// The drag left `window` without dropping.
    fn leave(&mut self, window: Window) {
        let _ = window;
    }
}

pub(crate) enum Decision {
    Accept {
        sink: Box<dyn DataSink>,
        action: DndAction,
        rect: Option<Rect>,
    },
    Reject,
}

/// A pending `XdndPosition`, waiting for the window to accept or reject it
pub struct DragPosition<'a> {
    window: Window,
    location: (i16, i16),
    root_location: (i16, i16),
    action: DndAction,
    mime_types: &'a MimeTypeList,
    decision: Option<Decision>,
}

impl std::fmt::Debug for DragPosition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragPosition")
            .field("window", &self.window)
            .field("location", &self.location)
            .field("root_location", &self.root_location)
            .field("action", &self.action)
            .field("mime_types", &self.mime_types)
            .field("decided", &self.decision.is_some())
            .finish()
    }
}

impl<'a> DragPosition<'a> {
    pub(crate) fn new(
        window: Window,
        location: (i16, i16),
        root_location: (i16, i16),
        action: DndAction,
        mime_types: &'a MimeTypeList,
    ) -> DragPosition<'a> {
        DragPosition {
            window,
            location,
            root_location,
            action,
            mime_types,
            decision: None,
        }
    }

    /// Window the drag is over
    pub fn window(&self) -> Window {
        self.window
    }

    /// Pointer position relative to the window
    pub fn location(&self) -> (i16, i16) {
        self.location
    }

    /// Pointer position in root coordinates
    pub fn root_location(&self) -> (i16, i16) {
        self.root_location
    }

    /// Action requested by the source
    pub fn action(&self) -> DndAction {
        self.action
    }

    /// Types offered by the source
    pub fn mime_types(&self) -> &MimeTypeList {
        self.mime_types
    }

    /// Accepts the drop with `action`; the data will be written into `sink`.
    ///
    /// With a `rect` the source may skip positions inside it. Only the first decision counts.
    pub fn accept(&mut self, mut sink: Box<dyn DataSink>, action: DndAction, rect: Option<Rect>) {
        if self.decision.is_some() {
            trace!(window = self.window, "Position already decided, ignoring accept");
            sink.close(Err(TransferError::Cancelled));
            return;
        }
        self.decision = Some(Decision::Accept { sink, action, rect });
    }

    /// Rejects the drop at this position. Only the first decision counts.
    pub fn reject(&mut self) {
        if self.decision.is_some() {
            trace!(window = self.window, "Position already decided, ignoring reject");
            return;
        }
        self.decision = Some(Decision::Reject);
    }

    pub(crate) fn into_decision(self) -> Option<Decision> {
        self.decision
    }
}
