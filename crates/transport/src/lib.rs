//! Frame transport over TCP (or any async byte stream).
//!
//! A socket is split into a [`FrameReader`] owned by exactly one receive
//! loop and a shared [`Connection`] handle used by every sender. Writes
//! are serialized by the connection; closing is idempotent and wakes the
//! reader.

pub mod connection;
pub mod error;
pub mod wire;

pub use connection::{Connection, ConnectionId, FrameReader, connect, split_stream};
pub use error::TransportError;
pub use wire::{read_frame, write_frame};

/// Socket read/write buffer size (64 KB).
pub const BUFFER_SIZE: usize = 64 * 1024;
