//! Wire protocol shared by the server core and its clients
//!
//! - [`entity`]: quantised entity state and immutable snapshots
//! - [`delta`]: snapshot delta compression
//! - [`channel`]: sequenced datagram channel with fragmentation
//! - [`packets`]: handshake and in-band packet bodies

pub mod channel;
pub mod delta;
pub mod entity;
pub mod packets;

pub use channel::{Received, SequencedChannel};
pub use delta::{DeltaPayload, EntityUpdate};
pub use entity::{EntityState, Snapshot};
pub use packets::{
    ClientMessage, ClientPacket, OobPacket, ReliableCommand, ServerBody, ServerPacket, UserCommand,
};

pub const PROTOCOL_VERSION: u32 = 26;

/// Header word marking a connectionless datagram
pub const OUT_OF_BAND: u32 = 0xFFFF_FFFF;
/// Header bit marking one fragment of a larger message
pub const FRAGMENT_BIT: u32 = 1 << 31;

/// Largest payload sent in a single datagram before fragmenting
pub const FRAGMENT_SIZE: usize = 1300;
pub const MAX_FRAGMENTS: usize = 64;

/// Reliable commands a peer may have outstanding
pub const MAX_RELIABLE_COMMANDS: usize = 64;
/// Sent snapshots remembered per client for delta baselines
pub const PACKET_BACKUP: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Datagram too short for its header")]
    Truncated,
    #[error("Bad fragment header: index {index} of {count}")]
    BadFragment { index: u16, count: u16 },
    #[error("Message of {len} bytes needs more than {max} fragments")]
    Oversized { len: usize, max: usize },
    #[error("Out-of-band packet on a sequenced channel")]
    UnexpectedOutOfBand,
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Delta baseline for tick {0} is not available")]
    MissingBaseline(u32),
    #[error("Delta references unknown entity {0}")]
    UnknownEntity(u32),
    #[error("Delta for entity {0} has fewer values than its mask")]
    ShortDelta(u32),
}
