//! In-memory X server for tests
//!
//! Implements just enough of the core protocol for selections and XDND: atoms, a window tree
//! with geometry, properties with partial reads, selection ownership and event delivery. Every
//! client connected to a [`FakeServer`] has its own event queue; clients always receive the
//! property notifications of the windows they created.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use x11rb::{
    errors::ConnectionError,
    protocol::{
        xproto::{
            Atom, AtomEnum, ClientMessageEvent, DestroyNotifyEvent, GetPropertyReply,
            Property as PropertyState, PropertyNotifyEvent, SelectionClearEvent, SelectionNotifyEvent,
            SelectionRequestEvent, Timestamp, Window, DESTROY_NOTIFY_EVENT, PROPERTY_NOTIFY_EVENT,
            SELECTION_CLEAR_EVENT, SELECTION_NOTIFY_EVENT, SELECTION_REQUEST_EVENT,
        },
        Event,
    },
};

use crate::{
    atoms::Atoms,
    conn::{Translated, XConnection},
    dispatcher::Dispatcher,
    error::ConnError,
};

const ROOT: Window = 1;

/// Installs the test log writer, `RUST_LOG` selects what is shown
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A request as seen by the server
#[derive(Debug, Clone)]
pub enum Request {
    InternAtom(String),
    GetAtomName(Atom),
    GetProperty {
        window: Window,
        property: Atom,
        delete: bool,
    },
    ChangeProperty {
        window: Window,
        property: Atom,
        type_: Atom,
        len: usize,
    },
    DeleteProperty {
        window: Window,
        property: Atom,
    },
    ConvertSelection {
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    },
    SetSelectionOwner {
        owner: Window,
        selection: Atom,
    },
    GetSelectionOwner(Atom),
    SendClientMessage {
        destination: Window,
        event: ClientMessageEvent,
    },
    SendSelectionNotify(SelectionNotifyEvent),
    SelectPropertyEvents(Window),
    TranslateCoordinates {
        src: Window,
        dst: Window,
    },
}

impl Request {
    pub fn is_get_property(&self) -> bool {
        matches!(self, Request::GetProperty { .. })
    }

    pub fn is_convert_selection(&self) -> bool {
        matches!(self, Request::ConvertSelection { .. })
    }

    pub fn is_change_property_on(&self, target: Window) -> bool {
        matches!(self, Request::ChangeProperty { window, .. } if *window == target)
    }
}

#[derive(Debug, Clone)]
struct PropertyValue {
    type_: Atom,
    format: u8,
    data: Vec<u8>,
}

#[derive(Debug)]
struct WindowState {
    creator: Option<usize>,
    parent: Window,
    x: i16,
    y: i16,
    width: u16,
    height: u16,
    children: Vec<Window>,
    properties: HashMap<Atom, PropertyValue>,
    listeners: Vec<usize>,
}

#[derive(Debug)]
struct ServerState {
    atoms: HashMap<String, Atom>,
    atom_names: HashMap<Atom, String>,
    next_atom: Atom,
    windows: HashMap<Window, WindowState>,
    next_window: Window,
    selections: HashMap<Atom, (Window, Timestamp)>,
    queues: Vec<VecDeque<Event>>,
    requests: Vec<Request>,
    failing: Vec<fn(&Request) -> bool>,
}

impl ServerState {
    fn window(&self, window: Window) -> Result<&WindowState, ConnError> {
        self.windows.get(&window).ok_or(ConnError::BadWindow(window))
    }

    fn window_mut(&mut self, window: Window) -> Result<&mut WindowState, ConnError> {
        self.windows.get_mut(&window).ok_or(ConnError::BadWindow(window))
    }

    fn deliver(&mut self, client: usize, event: Event) {
        if let Some(queue) = self.queues.get_mut(client) {
            queue.push_back(event);
        }
    }

    fn deliver_to_creator(&mut self, window: Window, event: Event) {
        if let Some(creator) = self.windows.get(&window).and_then(|state| state.creator) {
            self.deliver(creator, event);
        }
    }

    fn property_changed(&mut self, window: Window, atom: Atom, state: PropertyState) {
        let Some(win) = self.windows.get(&window) else {
            return;
        };
        let mut clients = win.listeners.clone();
        clients.extend(win.creator);
        clients.sort_unstable();
        clients.dedup();

        let event = Event::PropertyNotify(PropertyNotifyEvent {
            response_type: PROPERTY_NOTIFY_EVENT,
            sequence: 0,
            window,
            atom,
            time: 0,
            state,
        });
        for client in clients {
            self.deliver(client, event.clone());
        }
    }

    /// Position of `window` relative to the root window
    fn origin(&self, window: Window) -> Result<(i32, i32), ConnError> {
        let mut x = 0;
        let mut y = 0;
        let mut current = window;
        while current != ROOT {
            let state = self.window(current)?;
            x += i32::from(state.x);
            y += i32::from(state.y);
            current = state.parent;
        }
        Ok((x, y))
    }
}

/// Shared handle to the fake server
#[derive(Debug, Clone)]
pub struct FakeServer(Rc<RefCell<ServerState>>);

impl FakeServer {
    pub fn new() -> FakeServer {
        let predefined = [
            ("PRIMARY", AtomEnum::PRIMARY),
            ("SECONDARY", AtomEnum::SECONDARY),
            ("ATOM", AtomEnum::ATOM),
            ("CARDINAL", AtomEnum::CARDINAL),
            ("INTEGER", AtomEnum::INTEGER),
            ("STRING", AtomEnum::STRING),
            ("WINDOW", AtomEnum::WINDOW),
        ];
        let mut atoms = HashMap::new();
        let mut atom_names = HashMap::new();
        for (name, atom) in predefined {
            atoms.insert(name.to_owned(), Atom::from(atom));
            atom_names.insert(Atom::from(atom), name.to_owned());
        }

        let mut windows = HashMap::new();
        windows.insert(
            ROOT,
            WindowState {
                creator: None,
                parent: x11rb::NONE,
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
                children: Vec::new(),
                properties: HashMap::new(),
                listeners: Vec::new(),
            },
        );

        FakeServer(Rc::new(RefCell::new(ServerState {
            atoms,
            atom_names,
            next_atom: 100,
            windows,
            next_window: 0x20_0000,
            selections: HashMap::new(),
            queues: Vec::new(),
            requests: Vec::new(),
            failing: Vec::new(),
        })))
    }

    /// Connects a new client
    pub fn connect(&self) -> FakeConn {
        let mut state = self.0.borrow_mut();
        state.queues.push(VecDeque::new());
        FakeConn {
            server: self.clone(),
            client: state.queues.len() - 1,
        }
    }

    /// Creates a toplevel window owned by `conn`
    pub fn create_window(&self, conn: &FakeConn, x: i16, y: i16, width: u16, height: u16) -> Window {
        self.create_child(conn, ROOT, x, y, width, height)
    }

    /// Creates a window owned by `conn` below `parent`, stacked above its siblings
    pub fn create_child(
        &self,
        conn: &FakeConn,
        parent: Window,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
    ) -> Window {
        let mut state = self.0.borrow_mut();
        let window = state.next_window;
        state.next_window += 1;
        state.windows.insert(
            window,
            WindowState {
                creator: Some(conn.client),
                parent,
                x,
                y,
                width,
                height,
                children: Vec::new(),
                properties: HashMap::new(),
                listeners: Vec::new(),
            },
        );
        if let Some(parent) = state.windows.get_mut(&parent) {
            parent.children.push(window);
        }
        window
    }

    /// Destroys `window` and its children, notifying their creators
    pub fn destroy_window(&self, window: Window) {
        let mut state = self.0.borrow_mut();
        let Some(win) = state.windows.remove(&window) else {
            return;
        };
        if let Some(parent) = state.windows.get_mut(&win.parent) {
            parent.children.retain(|child| *child != window);
        }
        state.selections.retain(|_, (owner, _)| *owner != window);
        if let Some(creator) = win.creator {
            state.deliver(
                creator,
                Event::DestroyNotify(DestroyNotifyEvent {
                    response_type: DESTROY_NOTIFY_EVENT,
                    sequence: 0,
                    event: window,
                    window,
                }),
            );
        }
        drop(state);
        for child in win.children {
            self.destroy_window(child);
        }
    }

    /// Lets every later request matching `pred` fail as if the connection broke
    pub fn fail_requests(&self, pred: fn(&Request) -> bool) {
        self.0.borrow_mut().failing.push(pred);
    }

    /// Removes and returns the queued events of `conn`
    pub fn take_events(&self, conn: &FakeConn) -> Vec<Event> {
        let mut state = self.0.borrow_mut();
        state
            .queues
            .get_mut(conn.client)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of requests so far matching `pred`
    pub fn count_requests(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.0.borrow().requests.iter().filter(|req| pred(req)).count()
    }

    /// All client messages sent to `destination` so far
    pub fn client_messages(&self, destination: Window) -> Vec<ClientMessageEvent> {
        self.0
            .borrow()
            .requests
            .iter()
            .filter_map(|req| match req {
                Request::SendClientMessage { destination: dest, event } if *dest == destination => {
                    Some(*event)
                }
                _ => None,
            })
            .collect()
    }

    /// Delivers queued events to the dispatchers until all queues are empty
    pub fn pump(&self, clients: &mut [(&FakeConn, &mut Dispatcher<FakeConn>)]) {
        for _ in 0..100_000 {
            let mut delivered = false;
            for (conn, engine) in clients.iter_mut() {
                for event in self.take_events(conn) {
                    delivered = true;
                    engine.handle_event(&event);
                }
            }
            if !delivered {
                return;
            }
        }
        panic!("event ping-pong does not settle");
    }
}

/// Connection of one client to a [`FakeServer`]
#[derive(Debug, Clone)]
pub struct FakeConn {
    server: FakeServer,
    client: usize,
}

impl FakeConn {
    fn state(&self) -> std::cell::RefMut<'_, ServerState> {
        self.server.0.borrow_mut()
    }

    fn log(&self, request: Request) -> Result<(), ConnError> {
        let mut state = self.state();
        let failed = state.failing.iter().any(|pred| pred(&request));
        state.requests.push(request);
        if failed {
            return Err(ConnError::Connection(ConnectionError::UnknownError));
        }
        Ok(())
    }
}

impl XConnection for FakeConn {
    fn root_window(&self) -> Window {
        ROOT
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ConnError> {
        self.log(Request::InternAtom(name.to_owned()))?;
        let mut state = self.state();
        if let Some(atom) = state.atoms.get(name) {
            return Ok(*atom);
        }
        let atom = state.next_atom;
        state.next_atom += 1;
        state.atoms.insert(name.to_owned(), atom);
        state.atom_names.insert(atom, name.to_owned());
        Ok(atom)
    }

    fn intern_atoms(&self) -> Result<Atoms, ConnError> {
        Ok(Atoms {
            CLIPBOARD: self.intern_atom("CLIPBOARD")?,
            TARGETS: self.intern_atom("TARGETS")?,
            MULTIPLE: self.intern_atom("MULTIPLE")?,
            TIMESTAMP: self.intern_atom("TIMESTAMP")?,
            INCR: self.intern_atom("INCR")?,
            UTF8_STRING: self.intern_atom("UTF8_STRING")?,
            XdndAware: self.intern_atom("XdndAware")?,
            XdndProxy: self.intern_atom("XdndProxy")?,
            XdndSelection: self.intern_atom("XdndSelection")?,
            XdndTypeList: self.intern_atom("XdndTypeList")?,
            XdndEnter: self.intern_atom("XdndEnter")?,
            XdndPosition: self.intern_atom("XdndPosition")?,
            XdndStatus: self.intern_atom("XdndStatus")?,
            XdndLeave: self.intern_atom("XdndLeave")?,
            XdndDrop: self.intern_atom("XdndDrop")?,
            XdndFinished: self.intern_atom("XdndFinished")?,
            XdndActionCopy: self.intern_atom("XdndActionCopy")?,
            XdndActionMove: self.intern_atom("XdndActionMove")?,
            XdndActionLink: self.intern_atom("XdndActionLink")?,
            XdndActionAsk: self.intern_atom("XdndActionAsk")?,
            XdndActionPrivate: self.intern_atom("XdndActionPrivate")?,
            XdndActionDirectSave: self.intern_atom("XdndActionDirectSave")?,
        })
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ConnError> {
        self.log(Request::GetAtomName(atom))?;
        self.state()
            .atom_names
            .get(&atom)
            .cloned()
            .ok_or(ConnError::BadAtom(atom))
    }

    fn get_property(
        &self,
        delete: bool,
        window: Window,
        property: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
    ) -> Result<GetPropertyReply, ConnError> {
        self.log(Request::GetProperty {
            window,
            property,
            delete,
        })?;
        let mut state = self.state();
        let Some(value) = state.window(window)?.properties.get(&property).cloned() else {
            return Ok(GetPropertyReply {
                format: 0,
                sequence: 0,
                length: 0,
                type_: x11rb::NONE,
                bytes_after: 0,
                value_len: 0,
                value: Vec::new(),
            });
        };

        if type_ != u32::from(AtomEnum::ANY) && type_ != value.type_ {
            return Ok(GetPropertyReply {
                format: value.format,
                sequence: 0,
                length: 0,
                type_: value.type_,
                bytes_after: value.data.len() as u32,
                value_len: 0,
                value: Vec::new(),
            });
        }

        let start = (4 * long_offset as usize).min(value.data.len());
        let end = (start + 4 * long_length as usize).min(value.data.len());
        let bytes = value.data[start..end].to_vec();
        let bytes_after = (value.data.len() - end) as u32;
        if delete && bytes_after == 0 {
            state.window_mut(window)?.properties.remove(&property);
            state.property_changed(window, property, PropertyState::DELETE);
        }

        let unit = usize::from(value.format.max(8) / 8);
        Ok(GetPropertyReply {
            format: value.format,
            sequence: 0,
            length: 0,
            type_: value.type_,
            bytes_after,
            value_len: (bytes.len() / unit) as u32,
            value: bytes,
        })
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnError> {
        self.log(Request::ChangeProperty {
            window,
            property,
            type_,
            len: data.len(),
        })?;
        let mut state = self.state();
        state.window_mut(window)?.properties.insert(
            property,
            PropertyValue {
                type_,
                format,
                data: data.to_vec(),
            },
        );
        state.property_changed(window, property, PropertyState::NEW_VALUE);
        Ok(())
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnError> {
        self.log(Request::DeleteProperty { window, property })?;
        let mut state = self.state();
        if state.window_mut(window)?.properties.remove(&property).is_some() {
            state.property_changed(window, property, PropertyState::DELETE);
        }
        Ok(())
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnError> {
        self.log(Request::ConvertSelection {
            requestor,
            selection,
            target,
            property,
        })?;
        let mut state = self.state();
        state.window(requestor)?;
        match state.selections.get(&selection).copied() {
            Some((owner, _)) => {
                let event = Event::SelectionRequest(SelectionRequestEvent {
                    response_type: SELECTION_REQUEST_EVENT,
                    sequence: 0,
                    time,
                    owner,
                    requestor,
                    selection,
                    target,
                    property,
                });
                state.deliver_to_creator(owner, event);
            }
            None => {
                let event = Event::SelectionNotify(SelectionNotifyEvent {
                    response_type: SELECTION_NOTIFY_EVENT,
                    sequence: 0,
                    time,
                    requestor,
                    selection,
                    target,
                    property: x11rb::NONE,
                });
                state.deliver_to_creator(requestor, event);
            }
        }
        Ok(())
    }

    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnError> {
        self.log(Request::SetSelectionOwner { owner, selection })?;
        let mut state = self.state();
        if owner != x11rb::NONE {
            state.window(owner)?;
        }
        let previous = state.selections.get(&selection).copied();
        if let Some((_, last_time)) = previous {
            if time != x11rb::CURRENT_TIME && time < last_time {
                return Ok(());
            }
        }

        if owner == x11rb::NONE {
            state.selections.remove(&selection);
        } else {
            state.selections.insert(selection, (owner, time));
        }
        if let Some((previous_owner, _)) = previous.filter(|(previous_owner, _)| *previous_owner != owner) {
            let event = Event::SelectionClear(SelectionClearEvent {
                response_type: SELECTION_CLEAR_EVENT,
                sequence: 0,
                time,
                owner: previous_owner,
                selection,
            });
            state.deliver_to_creator(previous_owner, event);
        }
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnError> {
        self.log(Request::GetSelectionOwner(selection))?;
        Ok(self
            .state()
            .selections
            .get(&selection)
            .map_or(x11rb::NONE, |(owner, _)| *owner))
    }

    fn send_client_message(&self, destination: Window, event: ClientMessageEvent) -> Result<(), ConnError> {
        self.log(Request::SendClientMessage { destination, event })?;
        let mut state = self.state();
        state.window(destination)?;
        state.deliver_to_creator(destination, Event::ClientMessage(event));
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnError> {
        self.log(Request::SendSelectionNotify(event))?;
        let mut state = self.state();
        state.window(event.requestor)?;
        state.deliver_to_creator(event.requestor, Event::SelectionNotify(event));
        Ok(())
    }

    fn select_property_events(&self, window: Window) -> Result<(), ConnError> {
        self.log(Request::SelectPropertyEvents(window))?;
        let client = self.client;
        let mut state = self.state();
        let win = state.window_mut(window)?;
        if !win.listeners.contains(&client) {
            win.listeners.push(client);
        }
        Ok(())
    }

    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        x: i16,
        y: i16,
    ) -> Result<Translated, ConnError> {
        self.log(Request::TranslateCoordinates { src, dst })?;
        let state = self.state();
        let (src_x, src_y) = state.origin(src)?;
        let (dst_x, dst_y) = state.origin(dst)?;
        let local_x = i32::from(x) + src_x - dst_x;
        let local_y = i32::from(y) + src_y - dst_y;

        // topmost child containing the position
        let child = state
            .window(dst)?
            .children
            .iter()
            .rev()
            .copied()
            .find(|child| {
                state.windows.get(child).is_some_and(|win| {
                    local_x >= i32::from(win.x)
                        && local_y >= i32::from(win.y)
                        && local_x < i32::from(win.x) + i32::from(win.width)
                        && local_y < i32::from(win.y) + i32::from(win.height)
                })
            })
            .unwrap_or(x11rb::NONE);

        Ok(Translated {
            x: local_x as i16,
            y: local_y as i16,
            child,
        })
    }

    fn flush(&self) -> Result<(), ConnError> {
        Ok(())
    }
}
