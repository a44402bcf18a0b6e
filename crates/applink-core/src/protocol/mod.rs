//! The AppLink wire protocol: length-prefixed JSON frames.
//!
//! The first frame on every connection must be a [`ClientMessage::Hello`]
//! declaring the device the app runs on; the server answers with a
//! [`ServerMessage::HelloAck`] or a [`ServerMessage::Rejected`].

pub mod codec;
pub mod messages;

pub use codec::{decode_frame, encode_frame, ProtocolError, MAX_FRAME_LEN};
pub use messages::{ClientMessage, GoodbyeReason, RejectCode, ServerMessage};
