//! Wire framing and message codecs for the mosaic protocols.
//!
//! Every connection in the cluster speaks the same frame format: a 4-byte
//! role magic on connect, then `u8 kind | u32 length (big-endian) | body`
//! frames. Bodies are composed of big-endian integers, IEEE-754 doubles,
//! length-prefixed UTF-8 strings, cubes as `2·N` doubles and vectors as a
//! `u64` count followed by the items.
//!
//! A frame is always read whole into an immutable buffer before any of it is
//! decoded, so a slow peer can stall a connection but never leave a codec
//! mid-value. Read deadlines only ever apply between frames; hitting one
//! surfaces as the recoverable [`WireError::Timeout`].

mod codec;
mod error;
mod frame;
mod messages;

pub use self::codec::{decode_body, encode_body, WireDecode, WireEncode, WireReader};
pub use self::error::WireError;
pub use self::frame::{
    Framed, MAGIC_CLIENT, MAGIC_CONTROL, MAGIC_DELIVERY, MAGIC_WORKER, MAX_FRAME_LEN,
};
pub use self::messages::{
    read_worker_registration, send_worker_registration, ClientMsg, ControlMsg, DeliveryMsg,
    MoveItem, MoveResult, ReorgTask, WorkerMsg,
};

use std::time::Duration;

/// Deadline for reads on control and worker connections.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for reads on delivery connections, which move payloads.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Once a frame header arrived, the rest must follow within this window;
/// a mid-frame stall is a protocol error, not a recoverable timeout.
pub const FRAME_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
