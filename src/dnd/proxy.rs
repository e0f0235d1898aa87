use std::{collections::HashMap, time::Instant};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{Atom, AtomEnum, ClientMessageEvent, Window};

use super::{enter_version, send_enter, send_finished, send_leave, send_status, unpack_point, DND_VERSION};
use crate::{
    atoms::Atoms,
    conn::XConnection,
    dispatcher::{Dispatcher, EventStatus, LocalWindow},
    error::{ConnError, TransferError},
    task::{AsyncTask, DragProxy, EnterParams, ForwardTarget, TaskKind},
};

/// Oldest XDND version a child must support to receive forwarded drags
const MIN_DND_VERSION: u32 = 2;

impl<C: XConnection> Dispatcher<C> {
    pub(crate) fn proxy_enter(
        &mut self,
        window: Window,
        source: Window,
        flags: u32,
        types: SmallVec<[Atom; 3]>,
    ) -> EventStatus {
        let version = enter_version(flags);
        if version > DND_VERSION {
            debug!(source, version, "Drag source speaks a newer XDND version");
            return EventStatus::Rejected(TransferError::Protocol);
        }

        // a new drag replaces whatever we were relaying through this window
        let stale = self
            .tasks
            .iter()
            .filter(|task| !task.is_complete())
            .filter_map(|task| match task.kind() {
                TaskKind::DragProxy(proxy) if proxy.window == window => Some(proxy.source),
                _ => None,
            })
            .collect::<Vec<_>>();
        for old_source in stale {
            self.proxy_leave(window, old_source);
        }

        trace!(window, source, version, "Drag entered proxy window");
        self.tasks.insert(AsyncTask::new(TaskKind::DragProxy(DragProxy {
            window,
            source,
            enter: EnterParams { flags, types },
            child: None,
        })));
        EventStatus::Handled
    }

    pub(crate) fn proxy_position(
        &mut self,
        window: Window,
        source: Window,
        x: i16,
        y: i16,
        event: &ClientMessageEvent,
    ) -> EventStatus {
        let Some(index) = self.proxy_task(window, source) else {
            debug!(window, source, "XdndPosition from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };
        task.touch(Instant::now());
        let TaskKind::DragProxy(proxy) = task.kind_mut() else {
            return EventStatus::Ignored;
        };
        let previous = proxy.child;
        let enter = proxy.enter.clone();

        let found = match find_aware_child(&self.conn, &self.atoms, &self.windows, window, x, y, previous) {
            Ok(found) => found,
            Err(err) => {
                warn!(window, ?err, "Failed to find the child below the drag");
                if let Some(task) = self.tasks.get_mut(index) {
                    task.fail(err.into());
                }
                return EventStatus::Handled;
            }
        };

        if found.map(|child| child.window) != previous.map(|child| child.window) {
            if let Some(old) = previous {
                trace!(child = old.window, "Drag left forwarded child");
                self.forward_leave(old, source);
            }
            if let Some(new) = found {
                trace!(child = new.window, local = new.local, "Drag entered forwarded child");
                self.forward_enter(new, source, &enter, window);
            }
            if let Some(TaskKind::DragProxy(proxy)) = self.tasks.get_mut(index).map(|task| task.kind_mut()) {
                proxy.child = found;
            }
        }

        let result = match found {
            Some(child) if child.local => {
                let data = event.data.as_data32();
                let (x, y) = unpack_point(data[2]);
                return self.drag_position(child.window, source, x, y, data[4]);
            }
            Some(child) => forward(&self.conn, child, event),
            // nobody below the pointer wants the drag
            None => send_status(&self.conn, &self.atoms, source, window, None),
        };
        if let Err(err) = result {
            warn!(window, ?err, "Failed to relay XdndPosition");
            if let Some(task) = self.tasks.get_mut(index) {
                task.fail(err.into());
            }
        }
        EventStatus::Handled
    }

    pub(crate) fn proxy_drop(
        &mut self,
        window: Window,
        source: Window,
        event: &ClientMessageEvent,
    ) -> EventStatus {
        let Some(index) = self.proxy_task(window, source) else {
            debug!(window, source, "XdndDrop from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };
        let TaskKind::DragProxy(proxy) = task.kind() else {
            return EventStatus::Ignored;
        };
        let child = proxy.child;
        let version = enter_version(proxy.enter.flags);
        task.finish();

        let result = match child {
            Some(child) if child.local => {
                let time = event.data.as_data32()[2];
                return self.drag_drop(child.window, source, time);
            }
            Some(child) => forward(&self.conn, child, event),
            None => {
                debug!(window, "Dropped on a proxy without an aware child");
                send_finished(
                    &self.conn,
                    &self.atoms,
                    source,
                    window,
                    version,
                    Err(TransferError::UnsupportedFormat),
                )
            }
        };
        if let Err(err) = result {
            warn!(window, ?err, "Failed to relay XdndDrop");
        }
        EventStatus::Handled
    }

    pub(crate) fn proxy_leave(&mut self, window: Window, source: Window) -> EventStatus {
        let Some(index) = self.proxy_task(window, source) else {
            debug!(window, source, "XdndLeave from an unknown drag");
            return EventStatus::Rejected(TransferError::Protocol);
        };
        let Some(task) = self.tasks.get_mut(index) else {
            return EventStatus::Ignored;
        };
        let TaskKind::DragProxy(proxy) = task.kind() else {
            return EventStatus::Ignored;
        };
        let child = proxy.child;
        task.finish();

        if let Some(child) = child {
            self.forward_leave(child, source);
        }
        EventStatus::Handled
    }

    fn proxy_task(&self, window: Window, source: Window) -> Option<usize> {
        self.tasks.position(|kind| {
            matches!(kind, TaskKind::DragProxy(proxy) if proxy.window == window && proxy.source == source)
        })
    }

    fn forward_enter(&mut self, child: ForwardTarget, source: Window, enter: &EnterParams, proxy: Window) {
        if child.local {
            self.drag_enter(child.window, source, enter.flags, &enter.types, Some(proxy));
        } else if let Err(err) = send_enter(
            &self.conn,
            &self.atoms,
            child.destination,
            child.window,
            source,
            enter.flags,
            &enter.types,
        ) {
            warn!(child = child.window, ?err, "Failed to relay XdndEnter");
        }
    }

    fn forward_leave(&mut self, child: ForwardTarget, source: Window) {
        if child.local {
            self.drag_leave(child.window, source);
        } else if let Err(err) =
            send_leave(&self.conn, &self.atoms, child.destination, child.window, source)
        {
            warn!(child = child.window, ?err, "Failed to relay XdndLeave");
        }
    }
}

/// Relays a message of the source unchanged, just addressed to `child`.
fn forward<C: XConnection + ?Sized>(
    conn: &C,
    child: ForwardTarget,
    event: &ClientMessageEvent,
) -> Result<(), ConnError> {
    let message = ClientMessageEvent::new(32, child.window, event.type_, event.data.as_data32());
    conn.send_client_message(child.destination, message)
}

/// Walks down the window tree below `window` to the first XDND aware window containing the
/// root position `(x, y)`.
fn find_aware_child<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    windows: &HashMap<Window, LocalWindow>,
    window: Window,
    x: i16,
    y: i16,
    cached: Option<ForwardTarget>,
) -> Result<Option<ForwardTarget>, ConnError> {
    let root = conn.root_window();
    let mut parent = window;
    loop {
        let child = conn.translate_coordinates(root, parent, x, y)?.child;
        if child == x11rb::NONE {
            return Ok(None);
        }
        if let Some(cached) = cached.filter(|cached| cached.window == child) {
            return Ok(Some(cached));
        }
        if windows.get(&child).is_some_and(|local| local.handler.is_some()) {
            return Ok(Some(ForwardTarget {
                window: child,
                destination: child,
                local: true,
            }));
        }
        if is_xdnd_aware(conn, atoms, child)? {
            let destination = get_proxy_window(conn, atoms, child)?.unwrap_or(child);
            return Ok(Some(ForwardTarget {
                window: child,
                destination,
                local: false,
            }));
        }
        parent = child;
    }
}

fn is_xdnd_aware<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    window: Window,
) -> Result<bool, ConnError> {
    let reply = conn.get_property(false, window, atoms.XdndAware, AtomEnum::ATOM.into(), 0, 1)?;
    Ok(reply
        .value32()
        .and_then(|mut val| val.next())
        .is_some_and(|version| version >= MIN_DND_VERSION))
}

fn get_proxy_window<C: XConnection + ?Sized>(
    conn: &C,
    atoms: &Atoms,
    window: Window,
) -> Result<Option<Window>, ConnError> {
    let prop = conn.get_property(false, window, atoms.XdndProxy, AtomEnum::WINDOW.into(), 0, 1)?;
    let Some(proxy) = prop.value32().and_then(|mut val| val.next()) else {
        return Ok(None);
    };

    // a proxy must point at itself, otherwise it is a leftover of a dead client
    let verify = match conn.get_property(false, proxy, atoms.XdndProxy, AtomEnum::WINDOW.into(), 0, 1) {
        Ok(prop) => prop.value32().and_then(|mut val| val.next()),
        Err(ConnError::BadWindow(_)) => None,
        Err(err) => return Err(err),
    };
    Ok((verify == Some(proxy)).then_some(proxy))
}
