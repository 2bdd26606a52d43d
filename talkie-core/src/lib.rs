//! JsonTalkie protocol engine.
//! Host-driven core: the host feeds frames and messages in and sends the
//! frames the core hands back. `runtime` wires a core to a transport on tokio.

pub mod checksum;
pub mod core;
pub mod field;
pub mod framer;
pub mod identity;
pub mod manifest;
pub mod message;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod wire;

pub use checksum::{checksum, Verification};
pub use crate::core::{OutboundFrame, Rejection, TalkieCore, DEFAULT_MAX_DELAY};
pub use framer::{Framer, DEFAULT_FRAME_CAPACITY};
pub use identity::{IdentityClock, ManualClock, MonotonicClock};
pub use manifest::{Group, Manifest, Talker};
pub use message::{Message, Value};
pub use protocol::{key, ErrorCode, MessageCode, RogerCode, Source, SystemCode, BROADCAST};
pub use runtime::{JsonTalkie, DEFAULT_POLL_INTERVAL};
pub use transport::{SimLink, SimTransport, Transport, TransportError, DEFAULT_PORT};
pub use wire::{decode, encode, DecodeError, EncodeError, MAX_MESSAGE_LEN};
