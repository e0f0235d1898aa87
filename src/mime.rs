use std::{fmt, ops::Index};

use x11rb::protocol::xproto::Atom;

use crate::{
    atoms::{mime_from_atom, Atoms},
    conn::XConnection,
    error::ConnError,
};

/// Ordered list of MIME types offered by a peer.
///
/// The order is the peer's order; the index a [`DataSink`](crate::data::DataSink) returns from
/// `open` refers to it. Each entry remembers the atom it was decoded from, so the
/// negotiated type is requested with exactly the atom the peer advertised.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct MimeTypeList {
    names: Vec<String>,
    atoms: Vec<Atom>,
}

impl MimeTypeList {
    /// Creates an empty list
    pub fn new() -> MimeTypeList {
        MimeTypeList::default()
    }

    /// Decodes a list of type atoms, skipping `NONE` and the special targets.
    pub fn from_atoms<C: XConnection + ?Sized>(
        conn: &C,
        atoms: &Atoms,
        types: impl IntoIterator<Item = Atom>,
    ) -> Result<MimeTypeList, ConnError> {
        let mut list = MimeTypeList::new();
        for atom in types {
            if let Some(name) = mime_from_atom(atom, conn, atoms)? {
                list.push(name, atom);
            }
        }
        Ok(list)
    }

    pub(crate) fn push(&mut self, name: String, atom: Atom) {
        self.names.push(name);
        self.atoms.push(atom);
    }

    /// Number of types in the list
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Type at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Atom the type at `index` was advertised with
    pub fn atom(&self, index: usize) -> Option<Atom> {
        self.atoms.get(index).copied()
    }

    /// Iterates the types in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Position of `mime` in the list
    pub fn position(&self, mime: &str) -> Option<usize> {
        self.names.iter().position(|name| name == mime)
    }

    /// Index of the first entry of `preferences` (most preferred first) contained in the list.
    pub fn best_match<S: AsRef<str>>(&self, preferences: &[S]) -> Option<usize> {
        preferences
            .iter()
            .find_map(|preferred| self.position(preferred.as_ref()))
    }
}

impl Index<usize> for MimeTypeList {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        &self.names[index]
    }
}

impl fmt::Debug for MimeTypeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.names).finish()
    }
}

impl<S: Into<String>> FromIterator<S> for MimeTypeList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let names = iter.into_iter().map(Into::into).collect::<Vec<_>>();
        let atoms = vec![x11rb::NONE; names.len()];
        MimeTypeList { names, atoms }
    }
}
