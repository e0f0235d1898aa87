//! Accumulation of property contents
//!
//! A single `GetProperty` only returns as much data as was requested. Properties bigger than
//! [`TransferConfig::property_read_length`](crate::TransferConfig::property_read_length) are read
//! in several requests and glued together in a [`TransferBuffer`]. This is unrelated to INCR,
//! where the *owner* splits the data.

use x11rb::protocol::xproto::{Atom, AtomEnum, Window};

use crate::{conn::XConnection, error::TransferError};

/// Growable byte buffer collecting the pieces of one property
#[derive(Debug, Default)]
pub struct TransferBuffer {
    data: Vec<u8>,
}

impl TransferBuffer {
    /// Creates an empty buffer
    pub fn new() -> TransferBuffer {
        TransferBuffer::default()
    }

    /// Appends `bytes`, failing with [`TransferError::NoMemory`] if the buffer cannot grow.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.data.try_reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was buffered yet
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the buffered bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Contents of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Type of the property, `NONE` if it did not exist
    pub type_: Atom,
    /// Format (8, 16 or 32) of the property
    pub format: u8,
    /// Raw value
    pub data: Vec<u8>,
}

impl Property {
    /// Whether the property existed
    pub fn exists(&self) -> bool {
        self.type_ != x11rb::NONE
    }

    /// Value interpreted as a list of 32-bit items (atoms, windows, ...).
    pub fn value32(&self) -> Option<Vec<u32>> {
        if self.format != 32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

/// Reads a whole property of any type, requesting `read_length` 32-bit units at a time.
///
/// With `delete` set the server deletes the property after its last piece was read.
pub fn read_property<C: XConnection + ?Sized>(
    conn: &C,
    window: Window,
    property: Atom,
    delete: bool,
    read_length: u32,
) -> Result<Property, TransferError> {
    let mut buffer = TransferBuffer::new();
    let mut offset = 0;
    loop {
        let reply = conn.get_property(
            delete,
            window,
            property,
            AtomEnum::ANY.into(),
            offset,
            read_length.max(1),
        )?;
        if reply.type_ == x11rb::NONE {
            return Ok(Property {
                type_: x11rb::NONE,
                format: 0,
                data: Vec::new(),
            });
        }

        buffer.extend(&reply.value)?;
        if reply.bytes_after == 0 {
            return Ok(Property {
                type_: reply.type_,
                format: reply.format,
                data: buffer.into_inner(),
            });
        }
        offset += (reply.value.len() / 4) as u32;
    }
}
