//! Access to the window system
//!
//! The engine never talks to the X server directly. Everything it needs is expressed by the
//! [`XConnection`] trait, which is implemented for x11rb's [`RustConnection`]. The requests are the
//! plain core protocol requests used for selections and XDND; no extension is required.

use std::sync::Arc;

use x11rb::{
    connection::Connection as _,
    protocol::xproto::{
        self, Atom, ChangeWindowAttributesAux, ClientMessageEvent, EventMask, GetPropertyReply, PropMode,
        SelectionNotifyEvent, Timestamp, Window,
    },
    rust_connection::RustConnection,
};

use crate::{atoms::Atoms, error::ConnError};

/// Result of a `TranslateCoordinates` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    /// Horizontal position relative to the destination window
    pub x: i16,
    /// Vertical position relative to the destination window
    pub y: i16,
    /// Child of the destination window containing the position, or `NONE`
    pub child: Window,
}

/// Requests the transfer engine sends to the window system.
///
/// All requests are fire-and-forget except the ones returning data, which wait for their reply.
pub trait XConnection {
    /// Root window of the screen the engine operates on.
    fn root_window(&self) -> Window;

    /// Interns `name` and returns its atom.
    fn intern_atom(&self, name: &str) -> Result<Atom, ConnError>;

    /// Interns the whole [`Atoms`] set.
    fn intern_atoms(&self) -> Result<Atoms, ConnError>;

    /// Looks up the name of `atom`.
    fn atom_name(&self, atom: Atom) -> Result<String, ConnError>;

    /// Reads (a part of) a property, optionally deleting it once fully read.
    fn get_property(
        &self,
        delete: bool,
        window: Window,
        property: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
    ) -> Result<GetPropertyReply, ConnError>;

    /// Replaces a property with `data`, interpreted in the given format (8, 16 or 32).
    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnError>;

    /// Replaces a property with a list of 32-bit values.
    fn change_property32(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), ConnError> {
        let bytes = data.iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<u8>>();
        self.change_property(window, property, type_, 32, &bytes)
    }

    /// Deletes a property.
    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnError>;

    /// Asks the owner of `selection` to convert it to `target` and store it in `property` on `requestor`.
    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnError>;

    /// Makes `owner` the owner of `selection`.
    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnError>;

    /// Returns the current owner of `selection`, or `NONE`.
    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnError>;

    /// Sends a synthetic client message to `destination`.
    fn send_client_message(&self, destination: Window, event: ClientMessageEvent) -> Result<(), ConnError>;

    /// Sends a synthetic `SelectionNotify` to the requestor named in the event.
    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnError>;

    /// Subscribes to property changes of a (possibly foreign) window.
    fn select_property_events(&self, window: Window) -> Result<(), ConnError>;

    /// Translates a position from `src` coordinates into `dst` coordinates.
    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        x: i16,
        y: i16,
    ) -> Result<Translated, ConnError>;

    /// Flushes buffered requests to the server.
    fn flush(&self) -> Result<(), ConnError>;
}

impl XConnection for RustConnection {
    fn root_window(&self) -> Window {
        self.setup().roots[0].root
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ConnError> {
        Ok(xproto::ConnectionExt::intern_atom(self, false, name.as_bytes())?
            .reply()?
            .atom)
    }

    fn intern_atoms(&self) -> Result<Atoms, ConnError> {
        Ok(Atoms::new(self)?.reply()?)
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ConnError> {
        let reply = xproto::ConnectionExt::get_atom_name(self, atom)?.reply()?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
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
        Ok(xproto::ConnectionExt::get_property(
            self,
            delete,
            window,
            property,
            type_,
            long_offset,
            long_length,
        )?
        .reply()?)
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnError> {
        let data_len = (data.len() / (usize::from(format) / 8)) as u32;
        xproto::ConnectionExt::change_property(
            self,
            PropMode::REPLACE,
            window,
            property,
            type_,
            format,
            data_len,
            data,
        )?;
        Ok(())
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnError> {
        xproto::ConnectionExt::delete_property(self, window, property)?;
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
        xproto::ConnectionExt::convert_selection(self, requestor, selection, target, property, time)?;
        Ok(())
    }

    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnError> {
        xproto::ConnectionExt::set_selection_owner(self, owner, selection, time)?;
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnError> {
        Ok(xproto::ConnectionExt::get_selection_owner(self, selection)?
            .reply()?
            .owner)
    }

    fn send_client_message(&self, destination: Window, event: ClientMessageEvent) -> Result<(), ConnError> {
        xproto::ConnectionExt::send_event(self, false, destination, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnError> {
        xproto::ConnectionExt::send_event(self, false, event.requestor, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn select_property_events(&self, window: Window) -> Result<(), ConnError> {
        xproto::ConnectionExt::change_window_attributes(
            self,
            window,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        Ok(())
    }

    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        x: i16,
        y: i16,
    ) -> Result<Translated, ConnError> {
        let reply = xproto::ConnectionExt::translate_coordinates(self, src, dst, x, y)?.reply()?;
        Ok(Translated {
            x: reply.dst_x,
            y: reply.dst_y,
            child: reply.child,
        })
    }

    fn flush(&self) -> Result<(), ConnError> {
        x11rb::connection::Connection::flush(self)?;
        Ok(())
    }
}

impl<T: XConnection + ?Sized> XConnection for Arc<T> {
    fn root_window(&self) -> Window {
        (**self).root_window()
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ConnError> {
        (**self).intern_atom(name)
    }

    fn intern_atoms(&self) -> Result<Atoms, ConnError> {
        (**self).intern_atoms()
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ConnError> {
        (**self).atom_name(atom)
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
        (**self).get_property(delete, window, property, type_, long_offset, long_length)
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<(), ConnError> {
        (**self).change_property(window, property, type_, format, data)
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), ConnError> {
        (**self).delete_property(window, property)
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), ConnError> {
        (**self).convert_selection(requestor, selection, target, property, time)
    }

    fn set_selection_owner(&self, owner: Window, selection: Atom, time: Timestamp) -> Result<(), ConnError> {
        (**self).set_selection_owner(owner, selection, time)
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window, ConnError> {
        (**self).selection_owner(selection)
    }

    fn send_client_message(&self, destination: Window, event: ClientMessageEvent) -> Result<(), ConnError> {
        (**self).send_client_message(destination, event)
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ConnError> {
        (**self).send_selection_notify(event)
    }

    fn select_property_events(&self, window: Window) -> Result<(), ConnError> {
        (**self).select_property_events(window)
    }

    fn translate_coordinates(
        &self,
        src: Window,
        dst: Window,
        x: i16,
        y: i16,
    ) -> Result<Translated, ConnError> {
        (**self).translate_coordinates(src, dst, x, y)
    }

    fn flush(&self) -> Result<(), ConnError> {
        (**self).flush()
    }
}
