//! Transfer tasks
//!
//! Every running transfer is an [`AsyncTask`] in the [`TaskTable`] of a
//! [`Dispatcher`](crate::Dispatcher). A task holds exactly one of four protocol roles, each with
//! its own state and correlation key. Tasks only ever move forward; once `complete` is set the
//! next sweep retires them, closing whatever sink or stream they own.

use std::{fmt, rc::Rc, time::Instant};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, Timestamp, Window};

use crate::{
    atoms::{Atoms, DndAction},
    conn::XConnection,
    data::{DataSink, DataSource, InputStream},
    dnd::{send_finished, send_leave},
    error::TransferError,
    mime::MimeTypeList,
};

/// Key matching incoming events to the task they belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Data flows through `property` on `window`
    Property {
        /// Window holding the property
        window: Window,
        /// Property carrying the data
        property: Atom,
    },
    /// Drag from `source` over `target`
    Drag {
        /// Window the drag is over
        target: Window,
        /// Window of the drag source
        source: Window,
    },
}

/// Protocol role of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Pasting a selection owned by someone else
    ClipboardReceive,
    /// Answering a paste from a selection we own
    ClipboardSend,
    /// Being the target of a drag
    DragReceive,
    /// Relaying a drag to a child window
    DragProxy,
}

/// State of a [`ClipboardReceive`] task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Waiting for the owner's list of targets
    NegotiateTypes,
    /// Waiting for the data, or the start of an INCR transfer
    AwaitSimpleData,
    /// Receiving INCR chunks
    AwaitIncrementalChunk,
}

/// State of a [`DragReceive`] task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragState {
    /// Between two XDND messages
    Pending,
    /// Inside the position callback of the window
    Position,
    /// The position callback accepted the drop
    Accepted,
    /// The position callback rejected the drop
    Rejected,
    /// Dropped, waiting for the data
    SimpleTransfer,
    /// Dropped, receiving INCR chunks
    IncrementalTransfer,
}

/// Inputs advancing a [`DragState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragInput {
    /// An `XdndPosition` arrived
    Position,
    /// The window accepted the position
    Accept,
    /// The window rejected the position
    Reject,
    /// The `XdndStatus` reply was sent
    Settle,
    /// An `XdndDrop` arrived
    Drop,
    /// The dropped data is sent incrementally
    Incremental,
}

impl DragState {
    /// Next state after `input`, or [`TransferError::Protocol`] if `input` does not apply.
    pub fn advance(self, input: DragInput) -> Result<DragState, TransferError> {
        match (self, input) {
            (DragState::Pending, DragInput::Position) => Ok(DragState::Position),
            (DragState::Position, DragInput::Accept) => Ok(DragState::Accepted),
            (DragState::Position, DragInput::Reject) => Ok(DragState::Rejected),
            (DragState::Accepted | DragState::Rejected, DragInput::Settle) => Ok(DragState::Pending),
            (DragState::Pending, DragInput::Drop) => Ok(DragState::SimpleTransfer),
            (DragState::SimpleTransfer, DragInput::Incremental) => Ok(DragState::IncrementalTransfer),
            _ => Err(TransferError::Protocol),
        }
    }

    /// Whether the drop happened and the data is being transferred
    pub fn is_transfer(self) -> bool {
        matches!(self, DragState::SimpleTransfer | DragState::IncrementalTransfer)
    }
}

/// Paste of a selection owned by another client
pub struct ClipboardReceive {
    /// Our window receiving the data
    pub window: Window,
    /// Selection being pasted
    pub selection: Atom,
    /// Property on `window` the owner stores the data in
    pub property: Atom,
    /// Negotiated type, `NONE` while negotiating
    pub target: Atom,
    /// Time of the paste request
    pub time: Timestamp,
    /// Progress of the transfer
    pub state: ReceiveState,
    /// Consumer of the data
    pub sink: Box<dyn DataSink>,
}

impl fmt::Debug for ClipboardReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipboardReceive")
            .field("window", &self.window)
            .field("selection", &self.selection)
            .field("property", &self.property)
            .field("target", &self.target)
            .field("time", &self.time)
            .field("state", &self.state)
            .field("sink", &"...")
            .finish()
    }
}

/// Answer to a paste from a selection we own
pub struct ClipboardSend {
    /// Window of the requestor
    pub requestor: Window,
    /// Selection being pasted
    pub selection: Atom,
    /// Property on `requestor` receiving the data
    pub property: Atom,
    /// Requested type
    pub target: Atom,
    /// Data not yet written, an open stream means the INCR transfer is running
    pub stream: Option<Box<dyn InputStream>>,
    /// Bytes read from the stream but not yet sent
    pub pending: Vec<u8>,
    /// Source the stream was opened from
    pub source: Rc<dyn DataSource>,
}

impl fmt::Debug for ClipboardSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipboardSend")
            .field("requestor", &self.requestor)
            .field("selection", &self.selection)
            .field("property", &self.property)
            .field("target", &self.target)
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Drop target side of a drag
pub struct DragReceive {
    /// Our window the drag is over
    pub target: Window,
    /// Window of the drag source
    pub source: Window,
    /// Proxy window the drag was relayed through, used to address replies
    pub proxy: Option<Window>,
    /// XDND version spoken by the source
    pub version: u32,
    /// Types offered by the source
    pub mime_types: MimeTypeList,
    /// Progress of the drag
    pub state: DragState,
    /// Consumer of the data, bound by accepting a position
    pub sink: Option<Box<dyn DataSink>>,
    /// Action accepted by the window
    pub action: DndAction,
    /// Property the dropped data is stored in, `NONE` before the drop
    pub property: Atom,
    /// Type requested after the drop
    pub target_type: Atom,
    /// Whether the source waits for an `XdndFinished`
    pub dropped: bool,
}

impl DragReceive {
    /// Window the source knows as the target
    pub fn reply_window(&self) -> Window {
        self.proxy.unwrap_or(self.target)
    }
}

impl fmt::Debug for DragReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DragReceive")
            .field("target", &self.target)
            .field("source", &self.source)
            .field("proxy", &self.proxy)
            .field("version", &self.version)
            .field("mime_types", &self.mime_types)
            .field("state", &self.state)
            .field("sink", &self.sink.as_ref().map(|_| "..."))
            .field("action", &self.action)
            .field("property", &self.property)
            .field("target_type", &self.target_type)
            .field("dropped", &self.dropped)
            .finish()
    }
}

/// Parameters of an `XdndEnter`, replayed to every child the drag is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterParams {
    /// Second data word, version and flags
    pub flags: u32,
    /// Inline type atoms
    pub types: SmallVec<[Atom; 3]>,
}

/// Child window a proxied drag is currently forwarded to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardTarget {
    /// The XDND aware child
    pub window: Window,
    /// Where messages for `window` are sent, its `XdndProxy` or itself
    pub destination: Window,
    /// Whether the child is one of our own drop targets
    pub local: bool,
}

/// Relay of a drag over one of our windows to an embedded child
#[derive(Debug)]
pub struct DragProxy {
    /// Our window the source sends to
    pub window: Window,
    /// Window of the drag source
    pub source: Window,
    /// Saved `XdndEnter` parameters
    pub enter: EnterParams,
    /// Child receiving the forwarded messages
    pub child: Option<ForwardTarget>,
}

/// The role specific part of a task
#[derive(Debug)]
pub enum TaskKind {
    /// See [`ClipboardReceive`]
    ClipboardReceive(ClipboardReceive),
    /// See [`ClipboardSend`]
    ClipboardSend(ClipboardSend),
    /// See [`DragReceive`]
    DragReceive(DragReceive),
    /// See [`DragProxy`]
    DragProxy(DragProxy),
}

impl TaskKind {
    /// Role of the task
    pub fn role(&self) -> Role {
        match self {
            TaskKind::ClipboardReceive(_) => Role::ClipboardReceive,
            TaskKind::ClipboardSend(_) => Role::ClipboardSend,
            TaskKind::DragReceive(_) => Role::DragReceive,
            TaskKind::DragProxy(_) => Role::DragProxy,
        }
    }

    /// Key incoming events are matched against
    pub fn key(&self) -> CorrelationKey {
        match self {
            TaskKind::ClipboardReceive(task) => CorrelationKey::Property {
                window: task.window,
                property: task.property,
            },
            TaskKind::ClipboardSend(task) => CorrelationKey::Property {
                window: task.requestor,
                property: task.property,
            },
            TaskKind::DragReceive(task) => CorrelationKey::Drag {
                target: task.target,
                source: task.source,
            },
            TaskKind::DragProxy(task) => CorrelationKey::Drag {
                target: task.window,
                source: task.source,
            },
        }
    }
}

/// A running transfer
#[derive(Debug)]
pub struct AsyncTask {
    kind: TaskKind,
    result: Result<(), TransferError>,
    complete: bool,
    last_activity: Instant,
}

impl AsyncTask {
    /// Creates a pending task
    pub fn new(kind: TaskKind) -> AsyncTask {
        AsyncTask {
            kind,
            result: Ok(()),
            complete: false,
            last_activity: Instant::now(),
        }
    }

    /// Role specific state
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut TaskKind {
        &mut self.kind
    }

    /// Outcome so far; the first error sticks
    pub fn result(&self) -> Result<(), TransferError> {
        self.result
    }

    /// Whether the task is done and waits for retirement
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Marks the task as successfully done
    pub fn finish(&mut self) {
        self.complete = true;
    }

    /// Marks the task as failed. An earlier error is kept.
    pub fn fail(&mut self, err: TransferError) {
        if self.result.is_ok() {
            self.result = Err(err);
        }
        self.complete = true;
    }

    /// Merges the outcome of a handler into the task
    pub fn update(&mut self, status: Result<(), TransferError>) {
        if let Err(err) = status {
            self.fail(err);
        }
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(crate) fn idle_since(&self) -> Instant {
        self.last_activity
    }

    /// Releases everything the task holds.
    ///
    /// A sink is closed with the task's result, a stream is closed, and a drop that was
    /// performed is answered with `XdndFinished`. A failed relay leaves the foreign child it
    /// forwarded to.
    pub fn retire<C: XConnection + ?Sized>(self, conn: &C, atoms: &Atoms) {
        let AsyncTask { kind, result, .. } = self;
        trace!(?result, "Retiring {:?} task", kind.role());
        match kind {
            TaskKind::ClipboardReceive(mut task) => task.sink.close(result),
            TaskKind::ClipboardSend(task) => {
                if let Some(mut stream) = task.stream {
                    stream.close();
                }
            }
            TaskKind::DragReceive(mut task) => {
                if let Some(mut sink) = task.sink.take() {
                    sink.close(result);
                }
                if task.dropped {
                    let action = result.map(|()| task.action);
                    if let Err(err) = send_finished(
                        conn,
                        atoms,
                        task.source,
                        task.reply_window(),
                        task.version,
                        action,
                    ) {
                        warn!(source = task.source, ?err, "Failed to send XdndFinished");
                    }
                }
            }
            TaskKind::DragProxy(task) => {
                let Some(child) = task.child.filter(|child| result.is_err() && !child.local) else {
                    return;
                };
                if let Err(err) = send_leave(conn, atoms, child.destination, child.window, task.source) {
                    warn!(child = child.window, ?err, "Failed to relay XdndLeave");
                }
            }
        }
    }
}

/// All running tasks of a display
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: Vec<AsyncTask>,
}

impl TaskTable {
    /// Creates an empty table
    pub fn new() -> TaskTable {
        TaskTable::default()
    }

    /// Adds a task.
    ///
    /// A live task of the same role holding the same correlation key is superseded and cancelled.
    pub fn insert(&mut self, task: AsyncTask) {
        let role = task.kind.role();
        let key = task.kind.key();
        for old in self
            .tasks
            .iter_mut()
            .filter(|old| !old.complete && old.kind.role() == role && old.kind.key() == key)
        {
            debug!(?key, "Superseding task with the same correlation key");
            old.fail(TransferError::Cancelled);
        }
        self.tasks.push(task);
    }

    /// Number of tasks, including completed ones not yet swept
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterates all tasks
    pub fn iter(&self) -> impl Iterator<Item = &AsyncTask> {
        self.tasks.iter()
    }

    /// Iterates all tasks mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AsyncTask> {
        self.tasks.iter_mut()
    }

    /// Index of the first live task matching `pred`
    pub fn position(&self, mut pred: impl FnMut(&TaskKind) -> bool) -> Option<usize> {
        self.tasks
            .iter()
            .position(|task| !task.complete && pred(&task.kind))
    }

    /// Task at `index`
    pub fn get_mut(&mut self, index: usize) -> Option<&mut AsyncTask> {
        self.tasks.get_mut(index)
    }

    /// Whether a live task uses `property` on `window`
    pub fn property_in_use(&self, window: Window, property: Atom) -> bool {
        self.tasks.iter().filter(|task| !task.complete).any(|task| match &task.kind {
            TaskKind::ClipboardReceive(task) => task.window == window && task.property == property,
            TaskKind::ClipboardSend(task) => task.requestor == window && task.property == property,
            TaskKind::DragReceive(task) => task.target == window && task.property == property,
            TaskKind::DragProxy(_) => false,
        })
    }

    /// Removes all completed tasks and returns them for retirement.
    pub fn take_complete(&mut self) -> Vec<AsyncTask> {
        let (complete, live) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|task| task.complete);
        self.tasks = live;
        complete
    }
}
