//! Atoms of the selection and XDND protocols

use x11rb::protocol::xproto::{Atom, AtomEnum};

use crate::{conn::XConnection, error::ConnError};

/// MIME type of `UTF8_STRING`
pub const TEXT_PLAIN_UTF_8: &str = "text/plain;charset=utf-8";
/// MIME type of `STRING`
pub const TEXT_PLAIN: &str = "text/plain";

#[allow(missing_docs)]
mod generated {
    x11rb::atom_manager! {
        /// Atoms used by the transfer engine
        pub Atoms:
        AtomsCookie {
            // selections
            CLIPBOARD,

            // special targets
            TARGETS,
            MULTIPLE,
            TIMESTAMP,
            INCR,

            // data formats
            UTF8_STRING,

            // xdnd
            XdndAware,
            XdndProxy,
            XdndSelection,
            XdndTypeList,
            XdndEnter,
            XdndPosition,
            XdndStatus,
            XdndLeave,
            XdndDrop,
            XdndFinished,
            XdndActionCopy,
            XdndActionMove,
            XdndActionLink,
            XdndActionAsk,
            XdndActionPrivate,
            XdndActionDirectSave,
        }
    }
}

pub use self::generated::{Atoms, AtomsCookie};

/// A selection the engine can transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clipboard {
    /// The `PRIMARY` selection (usually the current text selection)
    Primary,
    /// The `SECONDARY` selection
    Secondary,
    /// The `CLIPBOARD` selection (explicit copy & paste)
    Clipboard,
}

impl Clipboard {
    /// Atom naming this selection
    pub fn atom(self, atoms: &Atoms) -> Atom {
        match self {
            Clipboard::Primary => AtomEnum::PRIMARY.into(),
            Clipboard::Secondary => AtomEnum::SECONDARY.into(),
            Clipboard::Clipboard => atoms.CLIPBOARD,
        }
    }

    /// Selection named by `atom`, if it is one of the three ICCCM selections
    pub fn from_atom(atom: Atom, atoms: &Atoms) -> Option<Clipboard> {
        match atom {
            x if x == Atom::from(AtomEnum::PRIMARY) => Some(Clipboard::Primary),
            x if x == Atom::from(AtomEnum::SECONDARY) => Some(Clipboard::Secondary),
            x if x == atoms.CLIPBOARD => Some(Clipboard::Clipboard),
            _ => None,
        }
    }
}

/// Drag and drop action negotiated over XDND
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DndAction {
    /// No action, the drop is not accepted
    None,
    /// Copy the data
    Copy,
    /// Move the data
    Move,
    /// Create a link to the data
    Link,
    /// Ask the user
    Ask,
    /// Application specific action
    Private,
    /// Direct save protocol
    DirectSave,
}

impl DndAction {
    /// Decodes an action atom, unknown atoms map to [`DndAction::None`]
    pub fn from_x(atom: Atom, atoms: &Atoms) -> DndAction {
        match atom {
            x if x == atoms.XdndActionCopy => DndAction::Copy,
            x if x == atoms.XdndActionMove => DndAction::Move,
            x if x == atoms.XdndActionLink => DndAction::Link,
            x if x == atoms.XdndActionAsk => DndAction::Ask,
            x if x == atoms.XdndActionPrivate => DndAction::Private,
            x if x == atoms.XdndActionDirectSave => DndAction::DirectSave,
            _ => DndAction::None,
        }
    }

    /// Encodes the action as its atom
    pub fn to_x(self, atoms: &Atoms) -> Atom {
        match self {
            DndAction::Copy => atoms.XdndActionCopy,
            DndAction::Move => atoms.XdndActionMove,
            DndAction::Link => atoms.XdndActionLink,
            DndAction::Ask => atoms.XdndActionAsk,
            DndAction::Private => atoms.XdndActionPrivate,
            DndAction::DirectSave => atoms.XdndActionDirectSave,
            DndAction::None => AtomEnum::NONE.into(),
        }
    }
}

/// MIME type advertised by a type atom.
///
/// Returns `None` for `NONE` and for the special targets that do not describe data.
pub fn mime_from_atom<C: XConnection + ?Sized>(
    atom: Atom,
    conn: &C,
    atoms: &Atoms,
) -> Result<Option<String>, ConnError> {
    match atom {
        x if x == x11rb::NONE => Ok(None),
        x if x == atoms.TARGETS || x == atoms.MULTIPLE || x == atoms.TIMESTAMP => Ok(None),
        x if x == atoms.UTF8_STRING => Ok(Some(TEXT_PLAIN_UTF_8.to_owned())),
        x if x == Atom::from(AtomEnum::STRING) => Ok(Some(TEXT_PLAIN.to_owned())),
        x => conn.atom_name(x).map(Some),
    }
}

/// Type atom used on the wire for a MIME type
pub fn atom_from_mime<C: XConnection + ?Sized>(
    mime: &str,
    conn: &C,
    atoms: &Atoms,
) -> Result<Atom, ConnError> {
    match mime {
        TEXT_PLAIN_UTF_8 => Ok(atoms.UTF8_STRING),
        TEXT_PLAIN => Ok(AtomEnum::STRING.into()),
        _ => conn.intern_atom(mime),
    }
}
