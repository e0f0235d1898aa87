use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, AtomEnum, Timestamp, Window};

use super::{enter_version, send_status, Decision, DragHandler, DragPosition, EnterFlags, DND_VERSION};
use crate::{
    atoms::{Atoms, DndAction},
    buffer::read_property,
    conn::XConnection,
    dispatcher::{Dispatcher, EventStatus},
    error::TransferError,
    mime::MimeTypeList,
    task::{AsyncTask, DragInput, DragReceive, DragState, TaskKind},
};

impl<C: XConnection> Dispatcher<C> {
    /// `XdndEnter` on one of our drop targets, possibly relayed by the drag proxy `proxy`.
    pub(crate) fn drag_enter(
        &mut self,
        window: Window,
        source: Window,
        flags: u32,
        types: &[Atom],
        proxy: Option<Window>,
    ) -> EventStatus {
        let version = enter_version(flags);
        if version > DND_VERSION {
            debug!(source, version, "Drag source speaks a newer XDND version");
            return EventStatus::Rejected(TransferError::Protocol);
        }

        for task in self.tasks.iter_mut().filter(|task| !task.is_complete()) {
            if let TaskKind::DragReceive(drag) = task.kind() {
                debug!(target = drag.target, source = drag.source, "New drag replaces the running one");
                task.fail(TransferError::Cancelled);
            }
        }

        let read_length = self.config.property_read_length;
        let mime_types = match offered_types(&self.conn, &self.atoms, source, flags, types, read_length) {
            Ok(mime_types) => mime_types,
            Err(err) => {
                warn!(source, ?err, "Failed to read the offered types");
                return EventStatus::Rejected(err);
            }
        };
        trace!(window, source, version, ?mime_types, "Drag entered");

        if let Some(handler) = self.windows.get_mut(&window).and_then(|local| local.handler.as_mut()) {
            handler.enter(window, &mime_types);
        }
        self.tasks.insert(AsyncTask::new(TaskKind::DragReceive(DragReceive {
            target: window,
            source,
            proxy,
            version,
            mime_types,
            state: DragState::Pending,
            sink: None,
            action: DndAction::None,
            property: x11rb::NONE,
            target_type: x11rb::NONE,
            dropped: false,
        })));
        EventStatus::Handled
    }

    /// `XdndPosition` on one of our drop targets.
    pub(crate) fn drag_position(
        &mut self,
        window: Window,
        source: Window,
        x: i16,
        y: i16,
        action: Atom,
    ) -> EventStatus {
        let Some(index) = self.drag_task(window, source) else {
            debug!(window, source, "XdndPosition from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        let handler = self
            .windows
            .get_mut(&window)
            .and_then(|local| local.handler.as_deref_mut());
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };
        let TaskKind::DragReceive(drag) = task.kind_mut() else {
            return EventStatus::Ignored;
        };

        let result = position(&self.conn, &self.atoms, drag, handler, (x, y), action);
        task.update(result);
        task.touch(std::time::Instant::now());
        EventStatus::Handled
    }

    /// `XdndDrop` on one of our drop targets.
    pub(crate) fn drag_drop(&mut self, window: Window, source: Window, time: Timestamp) -> EventStatus {
        let Some(index) = self.drag_task(window, source) else {
            debug!(window, source, "XdndDrop from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        let property = self.unused_property(window);
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };
        let TaskKind::DragReceive(drag) = task.kind_mut() else {
            return EventStatus::Ignored;
        };

        let result = property
            .map_err(TransferError::from)
            .and_then(|property| perform_drop(&self.conn, &self.atoms, drag, property, time));
        task.update(result);
        task.touch(std::time::Instant::now());
        EventStatus::Handled
    }

    /// `XdndLeave` on one of our drop targets.
    pub(crate) fn drag_leave(&mut self, window: Window, source: Window) -> EventStatus {
        let Some(index) = self.drag_task(window, source) else {
            debug!(window, source, "XdndLeave from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        if let Some(task) = self.tasks.get_mut(index) {
            trace!(window, source, "Drag left");
            task.fail(TransferError::Cancelled);
        }
        if let Some(handler) = self.windows.get_mut(&window).and_then(|local| local.handler.as_mut()) {
            handler.leave(window);
        }
        EventStatus::Handled
    }

    fn drag_task(&self, window: Window, source: Window) -> Option<usize> {
        self.tasks.position(|kind| {
            matches!(kind, TaskKind::DragReceive(drag) if drag.target == window && drag.source == source)
        })
    }
}

fn offered_types<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    source: Window,
    flags: u32,
    types: &[Atom],
    read_length: u32,
) -> Result<MimeTypeList, TransferError> {
    if !EnterFlags::from_bits_truncate(flags).contains(EnterFlags::MORE_TYPES) {
        return Ok(MimeTypeList::from_atoms(conn, atoms, types.iter().copied())?);
    }

    let prop = read_property(conn, source, atoms.XdndTypeList, false, read_length)?;
    if prop.type_ != u32::from(AtomEnum::ATOM) {
        debug!(source, "XdndTypeList missing, using the inline types");
        return Ok(MimeTypeList::from_atoms(conn, atoms, types.iter().copied())?);
    }
    let list = prop.value32().ok_or(TransferError::BadFormat)?;
    Ok(MimeTypeList::from_atoms(conn, atoms, list)?)
}

fn position<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    drag: &mut DragReceive,
    handler: Option<&mut (dyn DragHandler + 'static)>,
    root_location: (i16, i16),
    action: Atom,
) -> Result<(), TransferError> {
    drag.state = drag.state.advance(DragInput::Position)?;

    let (x, y) = root_location;
    let local = conn.translate_coordinates(conn.root_window(), drag.target, x, y)?;
    let action = if drag.version >= 2 {
        DndAction::from_x(action, atoms)
    } else {
        DndAction::Copy
    };

    let mut position = DragPosition::new(
        drag.target,
        (local.x, local.y),
        root_location,
        action,
        &drag.mime_types,
    );
    if let Some(handler) = handler {
        handler.position(&mut position);
    }
    let decision = position.into_decision().unwrap_or_else(|| {
        trace!(window = drag.target, "Position left undecided, rejecting");
        Decision::Reject
    });

    let status = match decision {
        Decision::Accept { sink, action, rect } => {
            drag.state = drag.state.advance(DragInput::Accept)?;
            if let Some(mut previous) = drag.sink.replace(sink) {
                previous.close(Err(TransferError::Cancelled));
            }
            drag.action = action;
            send_status(conn, atoms, drag.source, drag.reply_window(), Some((action, rect)))
        }
        Decision::Reject => {
            drag.state = drag.state.advance(DragInput::Reject)?;
            if let Some(mut previous) = drag.sink.take() {
                previous.close(Err(TransferError::Cancelled));
            }
            drag.action = DndAction::None;
            send_status(conn, atoms, drag.source, drag.reply_window(), None)
        }
    };
    drag.state = drag.state.advance(DragInput::Settle)?;
    status?;
    Ok(())
}

fn perform_drop<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    drag: &mut DragReceive,
    property: Atom,
    time: Timestamp,
) -> Result<(), TransferError> {
    // whatever happens now, the source waits for XdndFinished
    drag.dropped = true;
    drag.state = drag.state.advance(DragInput::Drop)?;

    let Some(sink) = drag.sink.as_mut() else {
        debug!(source = drag.source, "Drop without an accepted position");
        return Err(TransferError::UnsupportedFormat);
    };
    let index = sink.open(&drag.mime_types)?;
    let target_type = drag.mime_types.atom(index).ok_or(TransferError::UnsupportedFormat)?;

    drag.property = property;
    drag.target_type = target_type;
    let time = if drag.version >= 1 { time } else { x11rb::CURRENT_TIME };
    trace!(source = drag.source, target_type, "Requesting dropped data");
    conn.delete_property(drag.target, property)?;
    conn.convert_selection(drag.target, atoms.XdndSelection, target_type, property, time)?;
    conn.flush()?;
    Ok(())
}
