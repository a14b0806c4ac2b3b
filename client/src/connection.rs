//! Client half of the session protocol, without any I/O
//!
//! [`ServerConnection`] consumes datagrams from the server and produces the
//! datagrams to send back, tracking the handshake, channel acknowledgements,
//! reliable commands in both directions and the snapshot history needed to
//! decode deltas.

use log::{debug, info, trace, warn};
use shared::channel::{self, Header};
use shared::packets;
use shared::{
    delta, ClientMessage, ClientPacket, OobPacket, ProtocolError, Received, SequencedChannel,
    ServerBody, ServerPacket, Snapshot, UserCommand, MAX_RELIABLE_COMMANDS, PACKET_BACKUP,
    PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Connect sent, waiting for a challenge
    Connecting,
    /// Challenge answered, waiting for the slot assignment
    Challenging,
    /// Slot assigned, waiting for the gamestate
    Connected,
    /// Gamestate received, moves are being sent
    Primed,
    /// At least one in-game snapshot received
    Active,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Too many unacknowledged commands")]
    CommandOverflow,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Something the application should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { slot: u32 },
    Gamestate { gamestate_id: u32, snapshot: Snapshot },
    Snapshot(Snapshot),
    /// A reliable command other than `disconnect`, delivered once
    ServerCommand(String),
    Disconnected { reason: String },
}

pub struct ServerConnection {
    state: ConnectionState,
    slot: Option<u32>,
    challenge: Option<u32>,
    channel: SequencedChannel,

    gamestate_id: u32,
    /// Decoded snapshots by tick, newest last
    snapshots: BTreeMap<u32, Snapshot>,
    latest_tick: Option<u32>,
    server_time: u32,

    /// Highest reliable command index executed
    reliable_acknowledged: u32,
    /// Our reliable commands the server has not confirmed yet
    pending_commands: VecDeque<(u32, String)>,
    command_sequence: u32,

    outbox: Vec<Vec<u8>>,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConnection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            slot: None,
            challenge: None,
            channel: SequencedChannel::default(),
            gamestate_id: 0,
            snapshots: BTreeMap::new(),
            latest_tick: None,
            server_time: 0,
            reliable_acknowledged: 0,
            pending_commands: VecDeque::new(),
            command_sequence: 0,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn gamestate_id(&self) -> u32 {
        self.gamestate_id
    }

    pub fn server_time(&self) -> u32 {
        self.server_time
    }

    /// Most recent decoded snapshot
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest_tick.and_then(|tick| self.snapshots.get(&tick))
    }

    pub fn reliable_acknowledged(&self) -> u32 {
        self.reliable_acknowledged
    }

    /// Takes every datagram queued for the server
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Starts a new handshake, forgetting any previous session
    pub fn connect(&mut self) {
        *self = Self::new();
        self.state = ConnectionState::Connecting;
        self.queue_oob(&OobPacket::Connect {
            protocol_version: PROTOCOL_VERSION,
        });
    }

    /// Repeats the current handshake step, for use when a reply is overdue
    pub fn resend_handshake(&mut self) {
        match (self.state, self.challenge) {
            (ConnectionState::Connecting, _) => self.queue_oob(&OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
            (ConnectionState::Challenging, Some(challenge)) => {
                self.queue_oob(&OobPacket::ChallengeResponse { challenge })
            }
            _ => {}
        }
    }

    /// Processes one datagram from the server
    ///
    /// Malformed or stale datagrams yield no events. A refusal or a
    /// connectionless disconnect is returned as an error.
    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<Vec<ClientEvent>, ClientError> {
        match channel::read_header(data)? {
            Header::OutOfBand => {
                let packet: OobPacket = packets::decode(&data[4..])?;
                self.handle_out_of_band(packet)
            }
            Header::Sequenced { .. } => self.handle_sequenced(data),
        }
    }

    fn handle_out_of_band(&mut self, packet: OobPacket) -> Result<Vec<ClientEvent>, ClientError> {
        match packet {
            OobPacket::Challenge { challenge } if self.state == ConnectionState::Connecting => {
                debug!("Received challenge");
                self.challenge = Some(challenge);
                self.state = ConnectionState::Challenging;
                self.queue_oob(&OobPacket::ChallengeResponse { challenge });
                Ok(Vec::new())
            }
            OobPacket::ConnectResponse { slot } if self.state == ConnectionState::Challenging => {
                info!("Connected in slot {}", slot);
                self.slot = Some(slot);
                self.state = ConnectionState::Connected;
                Ok(vec![ClientEvent::Connected { slot }])
            }
            OobPacket::Refused { reason } => {
                self.state = ConnectionState::Disconnected;
                Err(ClientError::Refused(reason))
            }
            OobPacket::Disconnected { reason } => {
                self.state = ConnectionState::Disconnected;
                Err(ClientError::Disconnected(reason))
            }
            other => {
                trace!("Ignoring {:?} while {:?}", other, self.state);
                Ok(Vec::new())
            }
        }
    }

    fn handle_sequenced(&mut self, data: &[u8]) -> Result<Vec<ClientEvent>, ClientError> {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            return Ok(Vec::new());
        }

        let payload = match self.channel.receive(data)? {
            Received::Complete { payload, .. } => payload,
            Received::Pending | Received::Rejected => return Ok(Vec::new()),
        };
        let packet: ServerPacket = packets::decode(&payload)?;

        // A sequenced packet proves the connect response was only lost
        if self.state == ConnectionState::Challenging {
            self.state = ConnectionState::Connected;
        }

        self.server_time = packet.server_time;
        self.pending_commands
            .retain(|(index, _)| *index > packet.client_command_ack);

        let mut events = Vec::new();
        for command in packet.reliable {
            if command.index <= self.reliable_acknowledged {
                continue;
            }
            self.reliable_acknowledged = command.index;

            if let Some(reason) = disconnect_reason(&command.text) {
                info!("Server disconnected us: {}", reason);
                self.state = ConnectionState::Disconnected;
                events.push(ClientEvent::Disconnected { reason });
                return Ok(events);
            }
            events.push(ClientEvent::ServerCommand(command.text));
        }

        match packet.body {
            ServerBody::Empty => {}
            ServerBody::Gamestate {
                gamestate_id,
                snapshot,
            } => {
                let snapshot = delta::apply(None, &snapshot)?;
                if gamestate_id != self.gamestate_id {
                    info!("Received gamestate {}", gamestate_id);
                }
                self.gamestate_id = gamestate_id;
                self.snapshots.clear();
                self.latest_tick = None;
                self.state = ConnectionState::Primed;
                events.push(ClientEvent::Gamestate {
                    gamestate_id,
                    snapshot,
                });
            }
            ServerBody::Snapshot(payload) => {
                if self.state == ConnectionState::Primed {
                    self.state = ConnectionState::Active;
                }
                let baseline = match payload.baseline_tick {
                    Some(tick) => Some(
                        self.snapshots
                            .get(&tick)
                            .ok_or(ProtocolError::MissingBaseline(tick))?,
                    ),
                    None => None,
                };
                let snapshot = delta::apply(baseline, &payload)?;
                self.store_snapshot(snapshot.clone());
                events.push(ClientEvent::Snapshot(snapshot));
            }
        }

        Ok(events)
    }

    fn store_snapshot(&mut self, snapshot: Snapshot) {
        let tick = snapshot.tick();
        self.snapshots.insert(tick, snapshot);
        if self.latest_tick.map_or(true, |latest| tick > latest) {
            self.latest_tick = Some(tick);
        }
        while self.snapshots.len() > PACKET_BACKUP {
            self.snapshots.pop_first();
        }
    }

    /// Queues a reliable command for the server
    pub fn send_command(&mut self, text: impl Into<String>) -> Result<u32, ClientError> {
        if !self.is_joined() {
            return Err(ClientError::NotConnected);
        }
        if self.pending_commands.len() >= MAX_RELIABLE_COMMANDS {
            return Err(ClientError::CommandOverflow);
        }
        self.command_sequence += 1;
        self.pending_commands
            .push_back((self.command_sequence, text.into()));
        Ok(self.command_sequence)
    }

    /// Sends one input frame along with every unconfirmed command
    ///
    /// Before the gamestate arrives only acknowledgements and commands go
    /// out.
    pub fn send_move(&mut self, command: UserCommand) -> Result<(), ClientError> {
        if !self.is_joined() {
            return Err(ClientError::NotConnected);
        }

        let mut messages: Vec<ClientMessage> = self
            .pending_commands
            .iter()
            .map(|(index, text)| ClientMessage::Command {
                index: *index,
                text: text.clone(),
            })
            .collect();
        if matches!(
            self.state,
            ConnectionState::Primed | ConnectionState::Active
        ) {
            messages.push(ClientMessage::Move {
                gamestate_id: self.gamestate_id,
                command,
            });
        }

        self.queue_packet(messages)
    }

    /// Tells the server we are leaving
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        if !self.is_joined() {
            return Err(ClientError::NotConnected);
        }
        self.queue_packet(vec![ClientMessage::Disconnect])?;
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn is_joined(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Primed | ConnectionState::Active
        )
    }

    fn queue_packet(&mut self, messages: Vec<ClientMessage>) -> Result<(), ClientError> {
        let packet = ClientPacket {
            ack_sequence: self.channel.incoming_sequence(),
            reliable_ack: self.reliable_acknowledged,
            messages,
        };
        let bytes = packets::encode(&packet)?;
        let (_, datagrams) = self.channel.send(&bytes)?;
        self.outbox.extend(datagrams);
        Ok(())
    }

    fn queue_oob(&mut self, packet: &OobPacket) {
        match packets::encode(packet) {
            Ok(body) => self.outbox.push(channel::write_out_of_band(&body)),
            Err(e) => warn!("Failed to encode out-of-band packet: {}", e),
        }
    }
}

/// Extracts the reason from a `disconnect "reason"` command
fn disconnect_reason(text: &str) -> Option<String> {
    let rest = text.strip_prefix("disconnect")?;
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim().trim_matches('"').to_string())
}
