//! Packet bodies exchanged between client and server
//!
//! Connectionless traffic (handshake, refusals) travels as [`OobPacket`]
//! behind the out-of-band marker. Everything after the handshake goes
//! through a [`crate::channel::SequencedChannel`] as [`ClientPacket`] or
//! [`ServerPacket`].

use crate::delta::DeltaPayload;
use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Connectionless packets, both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OobPacket {
    // Client -> server
    Connect { protocol_version: u32 },
    ChallengeResponse { challenge: u32 },

    // Server -> client
    Challenge { challenge: u32 },
    ConnectResponse { slot: u32 },
    Refused { reason: String },
    Disconnected { reason: String },
}

/// Player input for one client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserCommand {
    pub sequence: u32,
    pub server_time: u32,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Reliable client command, executed once per index
    Command { index: u32, text: String },
    /// Input issued against the gamestate with the given id
    Move {
        gamestate_id: u32,
        command: UserCommand,
    },
    Disconnect,
}

/// Body of every sequenced client datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPacket {
    /// Highest server sequence the client has accepted
    pub ack_sequence: u32,
    /// Highest reliable server command index the client has executed
    pub reliable_ack: u32,
    pub messages: Vec<ClientMessage>,
}

/// A reliable server command with its queue index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableCommand {
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerBody {
    /// Reliable commands only
    Empty,
    /// Full initial state for a freshly connected or restarted client
    Gamestate {
        gamestate_id: u32,
        snapshot: DeltaPayload,
    },
    Snapshot(DeltaPayload),
}

/// Body of every sequenced server datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPacket {
    /// Highest client sequence the server has accepted
    pub ack_sequence: u32,
    /// Highest client command index the server has executed
    pub client_command_ack: u32,
    pub server_time: u32,
    /// Every unacknowledged reliable command, in index order
    pub reliable: Vec<ReliableCommand>,
    pub body: ServerBody,
}

pub fn encode<T: Serialize>(packet: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}
