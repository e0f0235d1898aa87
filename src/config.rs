//! Tunables of the transfer engine

use std::time::Duration;

// copied from wlroots - docs say "maximum size can vary widely depending on the implementation"
// and there is no way to query the maximum size, you just get a non-descriptive `Length` error...
/// Default size of a single INCR chunk in bytes.
pub const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration of a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Largest payload written as a single property.
    ///
    /// Anything bigger (or of unknown size) is sent incrementally in chunks of this size.
    pub chunk_size: usize,
    /// Number of 32-bit units requested by a single `GetProperty`.
    ///
    /// Bigger properties are accumulated over several requests.
    pub property_read_length: u32,
    /// Fail transfers that made no progress for this long.
    ///
    /// `None` lets a transfer wait for its peer forever. Expiry only happens when
    /// [`Dispatcher::expire_stalled`](crate::Dispatcher::expire_stalled) is called.
    pub transfer_timeout: Option<Duration>,
    /// Name prefix of the properties used to receive selection data.
    pub property_prefix: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: INCR_CHUNK_SIZE,
            property_read_length: 64 * 1024,
            transfer_timeout: None,
            property_prefix: String::from("_XTRANSFER_SELECTION"),
        }
    }
}
