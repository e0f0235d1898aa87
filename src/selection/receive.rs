use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{AtomEnum, SelectionNotifyEvent, Timestamp, Window};

use super::{read_simple, Incoming, Progress};
use crate::{
    atoms::{Atoms, Clipboard},
    buffer::read_property,
    config::TransferConfig,
    conn::XConnection,
    data::{copy_stream, DataSink, DataSource},
    dispatcher::{apply_progress, Dispatcher, EventStatus},
    error::TransferError,
    mime::MimeTypeList,
    task::{AsyncTask, ClipboardReceive, DragInput, DragReceive, DragState, ReceiveState, TaskKind},
};

impl<C: XConnection> Dispatcher<C> {
    /// Pastes `clipboard` into `sink`, requesting the data through our `window`.
    ///
    /// If this process owns the selection the data is copied right away without any round
    /// trip. Otherwise the transfer runs as events come in, and `sink` is closed with the
    /// outcome once it is done.
    ///
    /// `window` must select `PropertyChange` events, otherwise incremental transfers stall.
    /// The event mask of our own windows is left to the caller.
    pub fn get_clipboard(
        &mut self,
        clipboard: Clipboard,
        window: Window,
        mut sink: Box<dyn DataSink>,
        time: Timestamp,
    ) {
        let selection = clipboard.atom(&self.atoms);
        if let Some(owned) = self.selections.get(&selection) {
            let result = copy_local(&*owned.source, &mut *sink, self.config.chunk_size);
            debug!(?clipboard, ?result, "Pasted from our own selection");
            sink.close(result);
            return;
        }

        self.add_window(window);
        let property = match self.unused_property(window) {
            Ok(property) => property,
            Err(err) => {
                warn!(?err, "Failed to allocate a transfer property");
                sink.close(Err(err.into()));
                return;
            }
        };

        let mut task = AsyncTask::new(TaskKind::ClipboardReceive(ClipboardReceive {
            window,
            selection,
            property,
            target: x11rb::NONE,
            time,
            state: ReceiveState::NegotiateTypes,
            sink,
        }));
        trace!(?clipboard, window, property, "Requesting selection targets");
        let request = self
            .conn
            .convert_selection(window, selection, self.atoms.TARGETS, property, time)
            .and_then(|()| self.conn.flush());
        if let Err(err) = request {
            warn!(?err, "Failed to request selection targets");
            task.fail(err.into());
        }
        self.tasks.insert(task);
        self.collect_garbage();
    }

    pub(crate) fn selection_notify(&mut self, event: &SelectionNotifyEvent) -> EventStatus {
        if event.selection == self.atoms.XdndSelection {
            return self.drop_notify(event);
        }

        let index = self.tasks.position(|kind| {
            matches!(kind, TaskKind::ClipboardReceive(receive)
                if receive.window == event.requestor && receive.selection == event.selection)
        });
        let Some(task) = index.and_then(|index| self.tasks.get_mut(index)) else {
            trace!(requestor = event.requestor, "SelectionNotify without a paste");
            return EventStatus::Ignored;
        };
        let TaskKind::ClipboardReceive(receive) = task.kind_mut() else {
            return EventStatus::Ignored;
        };

        let progress = receive_notify(&self.conn, &self.atoms, &self.config, receive, event);
        apply_progress(task, progress);
        EventStatus::Handled
    }

    fn drop_notify(&mut self, event: &SelectionNotifyEvent) -> EventStatus {
        let index = self.tasks.position(|kind| {
            matches!(kind, TaskKind::DragReceive(drag)
                if drag.target == event.requestor && drag.state.is_transfer())
        });
        let Some(task) = index.and_then(|index| self.tasks.get_mut(index)) else {
            trace!(requestor = event.requestor, "SelectionNotify without a drop");
            return EventStatus::Ignored;
        };
        let TaskKind::DragReceive(drag) = task.kind_mut() else {
            return EventStatus::Ignored;
        };

        let progress = drop_data(&self.conn, &self.atoms, &self.config, drag, event);
        apply_progress(task, progress);
        EventStatus::Handled
    }
}

fn copy_local(
    source: &dyn DataSource,
    sink: &mut dyn DataSink,
    chunk_size: usize,
) -> Result<(), TransferError> {
    let mime_types = source.mime_types().into_iter().collect::<MimeTypeList>();
    let index = sink.open(&mime_types)?;
    let mime_type = mime_types.get(index).ok_or(TransferError::UnsupportedFormat)?;
    let mut stream = source.open(mime_type).ok_or(TransferError::UnsupportedFormat)?;
    let result = copy_stream(&mut *stream, sink, chunk_size);
    stream.close();
    result
}

fn receive_notify<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    config: &TransferConfig,
    receive: &mut ClipboardReceive,
    event: &SelectionNotifyEvent,
) -> Result<Progress, TransferError> {
    match receive.state {
        ReceiveState::NegotiateTypes => {
            if event.property == x11rb::NONE {
                debug!(selection = receive.selection, "Owner refused to list its targets");
                return Err(TransferError::UnsupportedFormat);
            }

            let read_length = config.property_read_length;
            let prop = read_property(conn, receive.window, receive.property, true, read_length)?;
            if prop.type_ != u32::from(AtomEnum::ATOM) && prop.type_ != atoms.TARGETS {
                debug!(type_ = prop.type_, "TARGETS reply has the wrong type");
                return Err(TransferError::BadFormat);
            }
            let targets = prop.value32().ok_or(TransferError::BadFormat)?;
            let mime_types = MimeTypeList::from_atoms(conn, atoms, targets)?;
            trace!(?mime_types, "Selection owner offers");

            let index = receive.sink.open(&mime_types)?;
            let target = mime_types.atom(index).ok_or(TransferError::UnsupportedFormat)?;

            conn.convert_selection(
                receive.window,
                receive.selection,
                target,
                receive.property,
                receive.time,
            )?;
            conn.flush()?;
            receive.target = target;
            receive.state = ReceiveState::AwaitSimpleData;
            Ok(Progress::Pending)
        }
        ReceiveState::AwaitSimpleData => {
            if event.property == x11rb::NONE {
                debug!(target = receive.target, "Owner refused the conversion");
                return Err(TransferError::UnsupportedFormat);
            }
            match read_simple(
                conn,
                atoms,
                config,
                receive.window,
                receive.property,
                receive.target,
                &mut *receive.sink,
            )? {
                Incoming::Complete => Ok(Progress::Done),
                Incoming::Incremental => {
                    receive.state = ReceiveState::AwaitIncrementalChunk;
                    Ok(Progress::Pending)
                }
            }
        }
        ReceiveState::AwaitIncrementalChunk => {
            debug!("SelectionNotify in the middle of an incremental transfer");
            Err(TransferError::Protocol)
        }
    }
}

fn drop_data<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    config: &TransferConfig,
    drag: &mut DragReceive,
    event: &SelectionNotifyEvent,
) -> Result<Progress, TransferError> {
    if drag.state == DragState::IncrementalTransfer {
        debug!("SelectionNotify in the middle of an incremental drop");
        return Err(TransferError::Protocol);
    }
    if event.property == x11rb::NONE {
        debug!(source = drag.source, "Drag source refused the conversion");
        return Err(TransferError::UnsupportedFormat);
    }
    let sink = drag.sink.as_deref_mut().ok_or(TransferError::Protocol)?;

    match read_simple(conn, atoms, config, drag.target, drag.property, drag.target_type, sink)? {
        Incoming::Complete => Ok(Progress::Done),
        Incoming::Incremental => {
            drag.state = drag.state.advance(DragInput::Incremental)?;
            Ok(Progress::Pending)
        }
    }
}
