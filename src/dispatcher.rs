//! Routing of protocol events to transfer tasks

use std::{collections::HashMap, fmt, rc::Rc, time::Instant};

use tracing::{debug, trace, warn};
use x11rb::{
    errors::ReplyOrIdError,
    protocol::{
        xproto::{
            Atom, AtomEnum, ClientMessageEvent, Property as PropertyState, PropertyNotifyEvent, Timestamp,
            Window,
        },
        ErrorKind, Event,
    },
    x11_utils::X11Error,
};

use crate::{
    atoms::{Atoms, Clipboard},
    config::TransferConfig,
    conn::XConnection,
    data::DataSource,
    dnd::{DragHandler, XdndMessage, DND_VERSION},
    error::{ConnError, TransferError},
    selection::{read_chunk, send_chunk, Progress},
    task::{AsyncTask, DragState, ReceiveState, TaskKind, TaskTable},
};

/// What the dispatcher did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// The event is unrelated to selections or drag and drop
    Ignored,
    /// The event was consumed
    Handled,
    /// The event belongs to the protocol but matches no transfer, e.g. a message from a
    /// stale or unknown drag source. No task was touched.
    Rejected(TransferError),
}

pub(crate) struct LocalWindow {
    pub(crate) handler: Option<Box<dyn DragHandler>>,
    pub(crate) proxy: bool,
}

impl fmt::Debug for LocalWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWindow")
            .field("handler", &self.handler.as_ref().map(|_| "..."))
            .field("proxy", &self.proxy)
            .finish()
    }
}

pub(crate) struct OwnedSelection {
    pub(crate) window: Window,
    pub(crate) source: Rc<dyn DataSource>,
    pub(crate) time: Timestamp,
}

impl fmt::Debug for OwnedSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedSelection")
            .field("window", &self.window)
            .field("source", &"...")
            .field("time", &self.time)
            .finish()
    }
}

/// Selection and drag and drop transfer engine of one display.
///
/// The dispatcher owns all running transfers. Feed it every event read from the connection with
/// [`Dispatcher::handle_event`]; events unrelated to selections or XDND are ignored. After each
/// event finished transfers are retired: their sink is closed with the outcome and drop sources
/// are told whether the drop succeeded.
///
/// Nothing blocks waiting for a peer. A transfer waiting for the next protocol event simply stays
/// in the table until that event is handed in.
#[derive(Debug)]
pub struct Dispatcher<C: XConnection> {
    pub(crate) conn: C,
    pub(crate) atoms: Atoms,
    pub(crate) config: TransferConfig,
    pub(crate) tasks: TaskTable,
    pub(crate) windows: HashMap<Window, LocalWindow>,
    pub(crate) selections: HashMap<Atom, OwnedSelection>,
    property_atoms: Vec<Atom>,
}

impl<C: XConnection> Dispatcher<C> {
    /// Creates the dispatcher for the display behind `conn`.
    pub fn new(conn: C, config: TransferConfig) -> Result<Self, ConnError> {
        let atoms = conn.intern_atoms()?;
        debug!(?config, "Transfer engine init");

        Ok(Dispatcher {
            conn,
            atoms,
            config,
            tasks: TaskTable::new(),
            windows: HashMap::new(),
            selections: HashMap::new(),
            property_atoms: Vec::new(),
        })
    }

    /// Connection used by the dispatcher
    pub fn conn(&self) -> &C {
        &self.conn
    }

    /// Atoms interned by the dispatcher
    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    /// Active configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Running transfers
    pub fn pending_tasks(&self) -> impl Iterator<Item = &AsyncTask> {
        self.tasks.iter()
    }

    /// Registers a window created by this process.
    ///
    /// Selections can be owned and pasted through any registered window.
    pub fn add_window(&mut self, window: Window) {
        self.windows.entry(window).or_insert(LocalWindow {
            handler: None,
            proxy: false,
        });
    }

    /// Registers `window` as a drop target and advertises XDND support on it.
    pub fn add_drop_target(
        &mut self,
        window: Window,
        handler: impl DragHandler + 'static,
    ) -> Result<(), ConnError> {
        self.advertise_xdnd(window)?;
        self.windows.insert(
            window,
            LocalWindow {
                handler: Some(Box::new(handler)),
                proxy: false,
            },
        );
        Ok(())
    }

    /// Registers `window` as host of embedded windows, drags over it are relayed to the XDND
    /// aware child below the pointer.
    pub fn add_drag_proxy(&mut self, window: Window) -> Result<(), ConnError> {
        self.advertise_xdnd(window)?;
        self.windows.insert(
            window,
            LocalWindow {
                handler: None,
                proxy: true,
            },
        );
        Ok(())
    }

    fn advertise_xdnd(&self, window: Window) -> Result<(), ConnError> {
        self.conn
            .change_property32(window, self.atoms.XdndAware, AtomEnum::ATOM.into(), &[DND_VERSION])?;
        self.conn.flush()
    }

    /// Forgets a window, cancelling every transfer using it.
    pub fn remove_window(&mut self, window: Window) {
        if self.windows.remove(&window).is_some() {
            self.cancel_window(window);
            self.collect_garbage();
        }
    }

    /// Whether `window` was registered with this dispatcher
    pub fn is_local(&self, window: Window) -> bool {
        self.windows.contains_key(&window)
    }

    /// Makes `window` the owner of `clipboard`, offering the data of `source`.
    ///
    /// Returns `false` if the server did not grant the ownership, e.g. because `time` is older
    /// than the current owner's.
    pub fn set_selection(
        &mut self,
        clipboard: Clipboard,
        window: Window,
        source: Rc<dyn DataSource>,
        time: Timestamp,
    ) -> Result<bool, ConnError> {
        let selection = clipboard.atom(&self.atoms);
        self.conn.set_selection_owner(window, selection, time)?;

        // Check if we are the selection owner; this might e.g. fail if our timestamp is too old
        let owner = self.conn.selection_owner(selection)?;
        if owner != window {
            debug!(?clipboard, owner, "Selection ownership was not granted");
            self.selections.remove(&selection);
            return Ok(false);
        }

        debug!(?clipboard, window, "Took selection ownership");
        self.add_window(window);
        self.selections.insert(selection, OwnedSelection { window, source, time });
        Ok(true)
    }

    /// Gives up ownership of `clipboard`, if we own it.
    pub fn clear_selection(&mut self, clipboard: Clipboard, time: Timestamp) -> Result<(), ConnError> {
        let selection = clipboard.atom(&self.atoms);
        if self.selections.remove(&selection).is_some() {
            self.conn.set_selection_owner(x11rb::NONE, selection, time)?;
            self.conn.flush()?;
        }
        Ok(())
    }

    /// Whether this process owns `clipboard`
    pub fn owns_selection(&self, clipboard: Clipboard) -> bool {
        self.selections.contains_key(&clipboard.atom(&self.atoms))
    }

    /// Handles one event read from the connection.
    pub fn handle_event(&mut self, event: &Event) -> EventStatus {
        let status = match event {
            Event::SelectionNotify(event) => self.selection_notify(event),
            Event::SelectionRequest(event) => self.selection_request(event),
            Event::SelectionClear(event) => self.selection_clear(event),
            Event::PropertyNotify(event) => self.property_notify(event),
            Event::ClientMessage(event) => match XdndMessage::parse(event, &self.atoms) {
                Some(message) => self.xdnd_message(event.window, message, event),
                None => EventStatus::Ignored,
            },
            Event::DestroyNotify(event) => self.window_destroyed(event.window),
            Event::Error(err) => self.handle_error(err),
            _ => EventStatus::Ignored,
        };

        self.collect_garbage();
        if let Err(err) = self.conn.flush() {
            warn!(?err, "Failed to flush transfer requests");
        }
        status
    }

    /// Handles an error reported by the window system for one of our requests.
    ///
    /// A `BadWindow` error means a window taking part in transfers is gone; those transfers
    /// are aborted.
    pub fn handle_error(&mut self, err: &X11Error) -> EventStatus {
        match err.error_kind {
            ErrorKind::Window => {
                debug!(window = err.bad_value, "BadWindow error, aborting transfers");
                self.window_destroyed(err.bad_value)
            }
            _ => EventStatus::Ignored,
        }
    }

    /// Aborts all transfers involving `window`, which was destroyed.
    ///
    /// Transfers through one of our windows end as [`TransferError::Cancelled`], transfers
    /// with a vanished peer as [`TransferError::Protocol`].
    pub fn window_destroyed(&mut self, window: Window) -> EventStatus {
        let local = self.windows.remove(&window).is_some();
        let selections = self.selections.len();
        self.selections.retain(|_, owned| owned.window != window);

        let cancelled = self.cancel_window(window);
        self.collect_garbage();

        if local || cancelled || selections != self.selections.len() {
            EventStatus::Handled
        } else {
            EventStatus::Ignored
        }
    }

    fn cancel_window(&mut self, window: Window) -> bool {
        let mut found = false;
        for task in self.tasks.iter_mut().filter(|task| !task.is_complete()) {
            let outcome = match task.kind_mut() {
                TaskKind::ClipboardReceive(receive) if receive.window == window => {
                    Some(TransferError::Cancelled)
                }
                TaskKind::ClipboardSend(send) if send.requestor == window => Some(TransferError::Protocol),
                TaskKind::DragReceive(drag) if drag.target == window => Some(TransferError::Cancelled),
                TaskKind::DragReceive(drag) if drag.source == window => {
                    // nobody left to tell
                    drag.dropped = false;
                    Some(TransferError::Protocol)
                }
                TaskKind::DragProxy(proxy) if proxy.window == window => Some(TransferError::Cancelled),
                TaskKind::DragProxy(proxy) if proxy.source == window => Some(TransferError::Protocol),
                TaskKind::DragProxy(proxy) => {
                    if proxy.child.is_some_and(|child| child.window == window) {
                        trace!(window, "Forwarded child of drag proxy destroyed");
                        proxy.child = None;
                        found = true;
                    }
                    None
                }
                _ => None,
            };
            if let Some(err) = outcome {
                task.fail(err);
                found = true;
            }
        }
        found
    }

    /// Cancels every running transfer.
    ///
    /// Sinks are closed with [`TransferError::Cancelled`] and sources of performed drops
    /// receive a failed `XdndFinished`. Also done when the dispatcher is dropped.
    pub fn shutdown(&mut self) {
        for task in self.tasks.iter_mut().filter(|task| !task.is_complete()) {
            task.fail(TransferError::Cancelled);
        }
        self.collect_garbage();
        if let Err(err) = self.conn.flush() {
            warn!(?err, "Failed to flush transfer requests");
        }
    }

    /// Fails transfers that made no progress within the configured timeout.
    ///
    /// Returns the number of expired transfers. Without a timeout nothing ever expires.
    pub fn expire_stalled(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.config.transfer_timeout else {
            return 0;
        };

        let mut expired = 0;
        for task in self.tasks.iter_mut().filter(|task| !task.is_complete()) {
            if now.saturating_duration_since(task.idle_since()) >= timeout {
                debug!(key = ?task.kind().key(), "Transfer stalled, giving up");
                task.fail(TransferError::TimedOut);
                expired += 1;
            }
        }
        self.collect_garbage();
        if let Err(err) = self.conn.flush() {
            warn!(?err, "Failed to flush transfer requests");
        }
        expired
    }

    fn xdnd_message(
        &mut self,
        window: Window,
        message: XdndMessage,
        event: &ClientMessageEvent,
    ) -> EventStatus {
        let Some(local) = self.windows.get(&window) else {
            return EventStatus::Ignored;
        };

        if local.proxy {
            return match message {
                XdndMessage::Enter { source, flags, types } => self.proxy_enter(window, source, flags, types),
                XdndMessage::Position { source, x, y, .. } => {
                    self.proxy_position(window, source, x, y, event)
                }
                XdndMessage::Drop { source, .. } => self.proxy_drop(window, source, event),
                XdndMessage::Leave { source } => self.proxy_leave(window, source),
                XdndMessage::Status | XdndMessage::Finished => EventStatus::Ignored,
            };
        }
        if local.handler.is_none() {
            return EventStatus::Ignored;
        }

        match message {
            XdndMessage::Enter { source, flags, types } => {
                self.drag_enter(window, source, flags, &types, None)
            }
            XdndMessage::Position {
                source,
                x,
                y,
                time: _,
                action,
            } => self.drag_position(window, source, x, y, action),
            XdndMessage::Drop { source, time } => self.drag_drop(window, source, time),
            XdndMessage::Leave { source } => self.drag_leave(window, source),
            // we never act as drag source
            XdndMessage::Status | XdndMessage::Finished => EventStatus::Ignored,
        }
    }

    fn property_notify(&mut self, event: &PropertyNotifyEvent) -> EventStatus {
        let index = self.tasks.position(|kind| match kind {
            TaskKind::ClipboardReceive(receive) => {
                event.state == PropertyState::NEW_VALUE
                    && receive.window == event.window
                    && receive.property == event.atom
                    && receive.state == ReceiveState::AwaitIncrementalChunk
            }
            TaskKind::DragReceive(drag) => {
                event.state == PropertyState::NEW_VALUE
                    && drag.target == event.window
                    && drag.property == event.atom
                    && drag.state == DragState::IncrementalTransfer
            }
            TaskKind::ClipboardSend(send) => {
                event.state == PropertyState::DELETE
                    && send.requestor == event.window
                    && send.property == event.atom
            }
            TaskKind::DragProxy(_) => false,
        });
        let Some(index) = index else {
            return EventStatus::Ignored;
        };
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };

        let progress = match task.kind_mut() {
            TaskKind::ClipboardReceive(receive) => read_chunk(
                &self.conn,
                &self.config,
                receive.window,
                receive.property,
                &mut *receive.sink,
            ),
            TaskKind::DragReceive(drag) => match drag.sink.as_deref_mut() {
                Some(sink) => read_chunk(&self.conn, &self.config, drag.target, drag.property, sink),
                None => Err(TransferError::Protocol),
            },
            TaskKind::ClipboardSend(send) => send_chunk(&self.conn, &self.config, send),
            TaskKind::DragProxy(_) => Ok(Progress::Pending),
        };
        apply_progress(task, progress);
        EventStatus::Handled
    }

    /// Returns a property on `window` no running transfer uses.
    pub(crate) fn unused_property(&mut self, window: Window) -> Result<Atom, ConnError> {
        // every live task holds at most one property, one more candidate is always free
        for index in 0..=self.tasks.len() {
            let atom = match self.property_atoms.get(index) {
                Some(atom) => *atom,
                None => {
                    let atom = self
                        .conn
                        .intern_atom(&format!("{}_{}", self.config.property_prefix, index))?;
                    self.property_atoms.push(atom);
                    atom
                }
            };
            if !self.tasks.property_in_use(window, atom) {
                return Ok(atom);
            }
        }
        Err(ConnError::Id(ReplyOrIdError::IdsExhausted))
    }

    /// Retires all completed tasks.
    pub(crate) fn collect_garbage(&mut self) {
        for task in self.tasks.take_complete() {
            task.retire(&self.conn, &self.atoms);
        }
    }
}

impl<C: XConnection> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn apply_progress(task: &mut AsyncTask, progress: Result<Progress, TransferError>) {
    match progress {
        Ok(Progress::Done) => task.finish(),
        Ok(Progress::Pending) => {}
        Err(err) => {
            debug!(key = ?task.kind().key(), ?err, "Transfer failed");
            task.fail(err)
        }
    }
    task.touch(Instant::now());
}
