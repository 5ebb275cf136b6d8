//! Wire protocol for Warden hub-agent communication.
//!
//! Every TCP connection carries a stream of typed, length-prefixed
//! [`Frame`]s. Control traffic travels as JSON sub-commands inside
//! [`Frame::Command`]; file data travels as [`Frame::FileChunk`].

pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;
pub mod types;

pub use envelope::{CommandEnvelope, SubCommand};
pub use frame::{Frame, FrameError, FrameHeader};
pub use types::{CommandKind, CommandStatus, Direction, FrameType, SessionStatus};
