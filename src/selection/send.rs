use std::{io::ErrorKind, rc::Rc};

use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, SelectionClearEvent, SelectionNotifyEvent, SelectionRequestEvent, Timestamp, Window,
    SELECTION_NOTIFY_EVENT,
};

use crate::{
    atoms::{atom_from_mime, mime_from_atom},
    conn::XConnection,
    data::{DataSource, InputStream},
    dispatcher::{Dispatcher, EventStatus},
    error::{ConnError, TransferError},
    task::{AsyncTask, ClipboardSend, TaskKind},
};

/// How a conversion request was answered
enum Reply {
    /// The data was stored in the property
    Stored,
    /// An `INCR` transfer was started
    Incremental(ClipboardSend),
    /// The conversion is refused
    Refused,
}

impl<C: XConnection> Dispatcher<C> {
    pub(crate) fn selection_request(&mut self, event: &SelectionRequestEvent) -> EventStatus {
        // obsolete clients ask for the data to be stored in a property named like the target
        let property = if event.property == x11rb::NONE {
            event.target
        } else {
            event.property
        };

        let reply = match self.selections.get(&event.selection) {
            Some(owned) if owned.window == event.owner => {
                let source = owned.source.clone();
                let time = owned.time;
                self.convert(event, property, source, time)
            }
            _ => {
                debug!(
                    selection = event.selection,
                    owner = event.owner,
                    "Request for a selection we do not own"
                );
                Ok(Reply::Refused)
            }
        };

        let reply = reply.unwrap_or_else(|err| {
            warn!(?err, requestor = event.requestor, "Failed to answer selection request");
            Reply::Refused
        });
        let property = match reply {
            Reply::Refused => x11rb::NONE,
            _ => property,
        };

        let notify = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: event.time,
            requestor: event.requestor,
            selection: event.selection,
            target: event.target,
            property,
        };
        if let Err(err) = self.conn.send_selection_notify(notify) {
            warn!(?err, requestor = event.requestor, "Failed to send SelectionNotify");
            if let Reply::Incremental(ClipboardSend {
                stream: Some(mut stream),
                ..
            }) = reply
            {
                stream.close();
            }
            return EventStatus::Handled;
        }

        if let Reply::Incremental(send) = reply {
            trace!(requestor = send.requestor, "Starting incremental transfer");
            self.tasks.insert(AsyncTask::new(TaskKind::ClipboardSend(send)));
        }
        EventStatus::Handled
    }

    fn convert(
        &self,
        event: &SelectionRequestEvent,
        property: Atom,
        source: Rc<dyn DataSource>,
        time: Timestamp,
    ) -> Result<Reply, TransferError> {
        let requestor = event.requestor;

        if event.target == self.atoms.TARGETS {
            let mut targets = vec![self.atoms.TARGETS, self.atoms.TIMESTAMP];
            for mime_type in source.mime_types() {
                targets.push(atom_from_mime(&mime_type, &self.conn, &self.atoms)?);
            }
            trace!(requestor, ?targets, "Answering TARGETS");
            self.conn
                .change_property32(requestor, property, AtomEnum::ATOM.into(), &targets)?;
            return Ok(Reply::Stored);
        }
        if event.target == self.atoms.TIMESTAMP {
            self.conn
                .change_property32(requestor, property, AtomEnum::INTEGER.into(), &[time])?;
            return Ok(Reply::Stored);
        }

        let Some(mime_type) = mime_from_atom(event.target, &self.conn, &self.atoms)? else {
            debug!(target = event.target, "Unsupported conversion target");
            return Ok(Reply::Refused);
        };
        if !source.mime_types().iter().any(|offered| *offered == mime_type) {
            debug!(%mime_type, "Requested type is not offered");
            return Ok(Reply::Refused);
        }
        let Some(mut stream) = source.open(&mime_type) else {
            debug!(%mime_type, "Data source failed to open");
            return Ok(Reply::Refused);
        };

        let chunk_size = self.config.chunk_size.max(1);
        let size_hint = stream.size_hint();
        let mut pending = Vec::new();
        if size_hint.is_some_and(|len| len <= chunk_size) {
            if let Err(err) = read_at_most(&mut *stream, &mut pending, chunk_size + 1) {
                warn!(?err, "Reading from data source failed");
                stream.close();
                return Ok(Reply::Refused);
            }
            if pending.len() <= chunk_size {
                trace!(requestor, len = pending.len(), "Answering with the whole data");
                let stored = self
                    .conn
                    .change_property(requestor, property, event.target, 8, &pending);
                stream.close();
                stored?;
                return Ok(Reply::Stored);
            }
            debug!(requestor, "Data source is bigger than announced");
        }

        if let Err(err) = self.start_incremental(requestor, property, size_hint) {
            stream.close();
            return Err(err.into());
        }
        Ok(Reply::Incremental(ClipboardSend {
            requestor,
            selection: event.selection,
            property,
            target: event.target,
            stream: Some(stream),
            pending,
            source,
        }))
    }

    fn start_incremental(
        &self,
        requestor: Window,
        property: Atom,
        size_hint: Option<usize>,
    ) -> Result<(), ConnError> {
        // must see the requestor deleting the property before announcing the transfer
        self.conn.select_property_events(requestor)?;
        let lower_bound = size_hint.map_or(0, |len| u32::try_from(len).unwrap_or(u32::MAX));
        self.conn
            .change_property32(requestor, property, self.atoms.INCR, &[lower_bound])
    }

    pub(crate) fn selection_clear(&mut self, event: &SelectionClearEvent) -> EventStatus {
        match self.selections.get(&event.selection) {
            Some(owned) if owned.window == event.owner => {
                debug!(selection = event.selection, "Lost selection ownership");
                self.selections.remove(&event.selection);
                EventStatus::Handled
            }
            _ => EventStatus::Ignored,
        }
    }
}

fn read_at_most(stream: &mut dyn InputStream, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<()> {
    let mut chunk = vec![0; limit];
    while buf.len() < limit {
        let want = limit - buf.len();
        match stream.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(len) => buf.extend_from_slice(&chunk[..len]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        io::{self, Cursor, Read},
        rc::Rc,
    };

    use x11rb::protocol::{xproto::Property as PropertyState, Event};

    use super::*;
    use crate::{
        atoms::Clipboard,
        buffer::read_property,
        data::{MemorySink, MemorySource},
        testing::{FakeServer, Request},
        TransferConfig,
    };

    /// Stream of unknown length remembering whether it was closed
    struct Tracked {
        data: Cursor<Vec<u8>>,
        closed: Rc<Cell<bool>>,
    }

    impl Read for Tracked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl InputStream for Tracked {
        fn close(&mut self) {
            self.closed.set(true);
        }
    }

    struct TrackedSource(Rc<Cell<bool>>);

    impl DataSource for TrackedSource {
        fn mime_types(&self) -> Vec<String> {
            vec!["text/plain".to_owned()]
        }

        fn open(&self, _mime_type: &str) -> Option<Box<dyn InputStream>> {
            Some(Box::new(Tracked {
                data: Cursor::new(b"streamed".to_vec()),
                closed: self.0.clone(),
            }))
        }
    }

    fn pair(
        server: &FakeServer,
        config: TransferConfig,
    ) -> (
        (crate::testing::FakeConn, Dispatcher<crate::testing::FakeConn>, u32),
        (crate::testing::FakeConn, Dispatcher<crate::testing::FakeConn>, u32),
    ) {
        let owner_conn = server.connect();
        let owner_window = server.create_window(&owner_conn, 0, 0, 10, 10);
        let owner = Dispatcher::new(owner_conn.clone(), config.clone()).unwrap();
        let paste_conn = server.connect();
        let paste_window = server.create_window(&paste_conn, 0, 0, 10, 10);
        let paster = Dispatcher::new(paste_conn.clone(), config).unwrap();
        ((owner_conn, owner, owner_window), (paste_conn, paster, paste_window))
    }

    #[test]
    fn small_paste_between_clients() {
        let server = FakeServer::new();
        let ((owner_conn, mut owner, owner_window), (paste_conn, mut paster, paste_window)) =
            pair(&server, TransferConfig::default());

        let source = MemorySource::new()
            .with("text/html", "<i>hello</i>")
            .with("text/plain;charset=utf-8", "hello");
        assert!(owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(source), 10)
            .unwrap());

        let (sink, received) = MemorySink::new(["text/plain;charset=utf-8"]);
        paster.get_clipboard(Clipboard::Clipboard, paste_window, Box::new(sink), 11);
        server.pump(&mut [(&owner_conn, &mut owner), (&paste_conn, &mut paster)]);

        let received = received.borrow();
        assert_eq!(received.mime_type.as_deref(), Some("text/plain;charset=utf-8"));
        assert_eq!(received.data, b"hello");
        assert_eq!(received.status, Some(Ok(())));
        assert_eq!(owner.pending_tasks().count(), 0);
        assert_eq!(paster.pending_tasks().count(), 0);
    }

    #[test]
    fn incremental_paste_between_clients() {
        crate::testing::init_logging();
        let server = FakeServer::new();
        let config = TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        };
        let ((owner_conn, mut owner, owner_window), (paste_conn, mut paster, paste_window)) =
            pair(&server, config);

        let data = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let source = MemorySource::new().with("application/octet-stream", data.clone());
        owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(source), 10)
            .unwrap();

        let (sink, received) = MemorySink::new(["application/octet-stream"]);
        paster.get_clipboard(Clipboard::Clipboard, paste_window, Box::new(sink), 11);
        server.pump(&mut [(&owner_conn, &mut owner), (&paste_conn, &mut paster)]);

        assert_eq!(received.borrow().data, data);
        assert_eq!(received.borrow().status, Some(Ok(())));
        // TARGETS reply, INCR marker, ten chunks and the terminating empty chunk
        let writes = server.count_requests(|req| req.is_change_property_on(paste_window));
        assert_eq!(writes, 1 + 1 + 10 + 1);
        assert_eq!(owner.pending_tasks().count(), 0);
        assert_eq!(paster.pending_tasks().count(), 0);
    }

    #[test]
    fn targets_and_timestamp_are_answered() {
        let server = FakeServer::new();
        let ((owner_conn, mut owner, owner_window), (paste_conn, _paster, paste_window)) =
            pair(&server, TransferConfig::default());
        let atoms = *owner.atoms();

        let source = MemorySource::new().with("text/plain", "x");
        owner
            .set_selection(Clipboard::Primary, owner_window, Rc::new(source), 42)
            .unwrap();

        let primary = u32::from(AtomEnum::PRIMARY);
        paste_conn
            .convert_selection(paste_window, primary, atoms.TIMESTAMP, 500, 43)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner)]);
        let prop = read_property(&paste_conn, paste_window, 500, true, 1024).unwrap();
        assert_eq!(prop.type_, u32::from(AtomEnum::INTEGER));
        assert_eq!(prop.value32(), Some(vec![42]));

        // obsolete requestor without a property
        paste_conn
            .convert_selection(paste_window, primary, atoms.TARGETS, x11rb::NONE, 44)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner)]);
        let prop = read_property(&paste_conn, paste_window, atoms.TARGETS, true, 1024).unwrap();
        assert_eq!(
            prop.value32(),
            Some(vec![atoms.TARGETS, atoms.TIMESTAMP, u32::from(AtomEnum::STRING)])
        );

        let notifies = server
            .take_events(&paste_conn)
            .into_iter()
            .filter_map(|event| match event {
                Event::SelectionNotify(notify) => Some(notify.property),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(notifies, vec![500, atoms.TARGETS]);
    }

    #[test]
    fn unknown_target_is_refused() {
        let server = FakeServer::new();
        let ((owner_conn, mut owner, owner_window), (paste_conn, _paster, paste_window)) =
            pair(&server, TransferConfig::default());

        let source = MemorySource::new().with("text/plain", "x");
        owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(source), 1)
            .unwrap();
        let png = paste_conn.intern_atom("image/png").unwrap();
        paste_conn
            .convert_selection(paste_window, owner.atoms().CLIPBOARD, png, 500, 2)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner)]);

        let refused = server.take_events(&paste_conn).into_iter().any(|event| {
            matches!(event, Event::SelectionNotify(notify)
                if notify.property == x11rb::NONE && notify.target == png)
        });
        assert!(refused);
        assert!(!read_property(&paste_conn, paste_window, 500, false, 1024).unwrap().exists());
    }

    #[test]
    fn stream_is_closed_when_the_reply_fails() {
        let server = FakeServer::new();
        let ((owner_conn, mut owner, owner_window), (paste_conn, _paster, paste_window)) =
            pair(&server, TransferConfig::default());

        let closed = Rc::new(Cell::new(false));
        owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(TrackedSource(closed.clone())), 1)
            .unwrap();
        server.fail_requests(|req| matches!(req, Request::SendSelectionNotify(_)));
        paste_conn
            .convert_selection(paste_window, owner.atoms().CLIPBOARD, AtomEnum::STRING.into(), 500, 2)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner)]);

        // the unknown length started an incremental transfer that never got announced
        let marker = read_property(&paste_conn, paste_window, 500, false, 1024).unwrap();
        assert_eq!(marker.type_, owner.atoms().INCR);
        assert!(closed.get());
        assert_eq!(owner.pending_tasks().count(), 0);
    }

    #[test]
    fn selection_clear_drops_ownership() {
        let server = FakeServer::new();
        let ((owner_conn, mut owner, owner_window), (paste_conn, mut paster, paste_window)) =
            pair(&server, TransferConfig::default());

        owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(MemorySource::new()), 1)
            .unwrap();
        paster
            .set_selection(Clipboard::Clipboard, paste_window, Rc::new(MemorySource::new()), 2)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner), (&paste_conn, &mut paster)]);

        assert!(!owner.owns_selection(Clipboard::Clipboard));
        assert!(paster.owns_selection(Clipboard::Clipboard));

        // a late duplicate changes nothing
        let clear = SelectionClearEvent {
            response_type: x11rb::protocol::xproto::SELECTION_CLEAR_EVENT,
            sequence: 0,
            time: 2,
            owner: owner_window,
            selection: owner.atoms().CLIPBOARD,
        };
        assert_eq!(owner.handle_event(&Event::SelectionClear(clear)), EventStatus::Ignored);
    }

    #[test]
    fn deleting_the_property_requests_the_next_chunk() {
        let server = FakeServer::new();
        let config = TransferConfig {
            chunk_size: 4,
            ..TransferConfig::default()
        };
        let ((owner_conn, mut owner, owner_window), (paste_conn, _paster, paste_window)) =
            pair(&server, config);
        let atoms = *owner.atoms();

        let source = MemorySource::new().with("text/plain", "abcdefg");
        owner
            .set_selection(Clipboard::Clipboard, owner_window, Rc::new(source), 1)
            .unwrap();
        paste_conn
            .convert_selection(paste_window, atoms.CLIPBOARD, AtomEnum::STRING.into(), 500, 2)
            .unwrap();
        server.pump(&mut [(&owner_conn, &mut owner)]);

        let marker = read_property(&paste_conn, paste_window, 500, false, 1024).unwrap();
        assert_eq!(marker.type_, atoms.INCR);
        assert_eq!(marker.value32(), Some(vec![7]));

        let mut chunks = Vec::new();
        loop {
            paste_conn.delete_property(paste_window, 500).unwrap();
            server.pump(&mut [(&owner_conn, &mut owner)]);
            let chunk = read_property(&paste_conn, paste_window, 500, false, 1024).unwrap();
            if chunk.data.is_empty() {
                break;
            }
            chunks.push(chunk.data);
        }
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efg".to_vec()]);
        assert_eq!(owner.pending_tasks().count(), 0);

        let states = server
            .take_events(&paste_conn)
            .into_iter()
            .filter(|event| {
                matches!(event, Event::PropertyNotify(notify) if notify.state == PropertyState::DELETE)
            })
            .count();
        assert!(states >= 3);
    }
}
