//! Single-threaded tick driver
//!
//! The driver owns every session, the simulation and the deferred-event
//! queue. Inbound datagrams and scheduled actions are handed to it; it
//! never blocks and never performs I/O itself. Outbound datagrams collect in
//! an outbox that the network shell drains after each call.
//!
//! Time inside the driver is the fixed-step server clock: every
//! [`TickDriver::run_tick`] advances it by exactly one frame, and timeouts,
//! rate limits and deferred events are all measured against it.

use log::{debug, error, info, trace, warn};
use rand::Rng;
use shared::channel::{self, Header};
use shared::packets;
use shared::{
    delta, ClientMessage, ClientPacket, OobPacket, ProtocolError, Received, ServerBody,
    ServerPacket, Snapshot, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::deferred::{DeferredAction, DeferredQueue, DeferredSender};
use crate::policy::BanPolicy;
use crate::session::{ClientState, Session};
use crate::simulation::Simulation;

/// Frames the host clock may run ahead of server time before we complain
const LAG_WARN_FRAMES: u64 = 10;

/// Reasons a connect attempt is refused before any session exists
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Banned from this server")]
    Banned,
    #[error("{0}")]
    Denied(String),
    #[error("Server is full")]
    ServerFull,
    #[error("Server uses protocol version {expected}, client sent {got}")]
    ProtocolMismatch { expected: u32, got: u32 },
}

/// A datagram waiting to be written to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

pub struct TickDriver<S, P> {
    config: ServerConfig,
    clients: ClientManager,
    simulation: S,
    policy: P,
    deferred: DeferredQueue,

    server_time: u64,
    tick: u32,
    gamestate_id: u32,
    /// Host clock reading that corresponds to server time zero
    host_origin: Option<u64>,
    lagging: bool,

    outbox: Vec<Outbound>,
}

impl<S: Simulation, P: BanPolicy> TickDriver<S, P> {
    pub fn new(config: ServerConfig, simulation: S, policy: P) -> Self {
        Self {
            clients: ClientManager::new(config.max_clients),
            config,
            simulation,
            policy,
            deferred: DeferredQueue::new(),
            server_time: 0,
            tick: 0,
            gamestate_id: 1,
            host_origin: None,
            lagging: false,
            outbox: Vec::new(),
        }
    }

    pub fn server_time(&self) -> u64 {
        self.server_time
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn gamestate_id(&self) -> u32 {
        self.gamestate_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn session(&self, slot: usize) -> Option<&Session> {
        self.clients.get(slot)
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    /// Handle for scheduling deferred actions from other tasks
    pub fn deferred_sender(&self) -> DeferredSender {
        self.deferred.sender()
    }

    /// Takes every datagram produced since the last call
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Overrides the snapshot spacing and bandwidth budget for one client
    pub fn set_send_rate(&mut self, slot: usize, snapshot_msec: u64, rate: u32) {
        if let Some(session) = self.clients.get_mut(slot) {
            session.snapshot_msec = snapshot_msec;
            session.rate = rate.max(1);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Processes one datagram received from `addr`
    ///
    /// Malformed, stale and unexpected datagrams are dropped without any
    /// change to connection state.
    pub fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        match channel::read_header(data) {
            Err(e) => debug!("Malformed datagram from {}: {}", addr, e),
            Ok(Header::OutOfBand) => match packets::decode::<OobPacket>(&data[4..]) {
                Ok(packet) => self.handle_out_of_band(addr, packet),
                Err(e) => debug!("Malformed out-of-band packet from {}: {}", addr, e),
            },
            Ok(Header::Sequenced { .. }) => self.handle_sequenced(addr, data),
        }
    }

    fn handle_out_of_band(&mut self, addr: SocketAddr, packet: OobPacket) {
        match packet {
            OobPacket::Connect { protocol_version } => {
                if let Err(e) = self.direct_connect(addr, protocol_version) {
                    warn!("Refused connection from {}: {}", addr, e);
                    self.send_oob(
                        addr,
                        &OobPacket::Refused {
                            reason: e.to_string(),
                        },
                    );
                }
            }
            OobPacket::ChallengeResponse { challenge } => self.challenge_response(addr, challenge),
            other => debug!("Unexpected out-of-band packet from {}: {:?}", addr, other),
        }
    }

    /// FREE -> CONNECTING -> CHALLENGING for a new peer
    fn direct_connect(&mut self, addr: SocketAddr, protocol_version: u32) -> Result<usize, ConnectError> {
        info!("Client connecting from {} (protocol {})", addr, protocol_version);

        if protocol_version != PROTOCOL_VERSION {
            return Err(ConnectError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            });
        }
        if self.policy.is_banned(addr.ip()) {
            return Err(ConnectError::Banned);
        }

        if let Some(slot) = self.clients.find_client_by_addr(addr) {
            let now = self.server_time;
            let session = self.session_mut(slot);
            if matches!(
                session.state(),
                ClientState::Connecting | ClientState::Challenging
            ) {
                // Our challenge was lost, resend it
                session.last_packet_time = now;
                let challenge = session.challenge;
                self.send_oob(addr, &OobPacket::Challenge { challenge });
                return Ok(slot);
            }
            info!("Slot {} reconnecting from {}", slot, addr);
            self.discard(slot);
        }

        let slot = self
            .clients
            .allocate(
                addr,
                protocol_version,
                self.server_time,
                self.config.fragment_size,
            )
            .ok_or(ConnectError::ServerFull)?;

        let challenge = rand::thread_rng().gen::<u32>();
        let session = self.session_mut(slot);
        session.challenge = challenge;
        if let Err(e) = session.transition(ClientState::Challenging) {
            error!("Slot {}: {}", slot, e);
        }
        self.send_oob(addr, &OobPacket::Challenge { challenge });

        Ok(slot)
    }

    /// CHALLENGING -> CONNECTED, or back to FREE if the simulation refuses
    fn challenge_response(&mut self, addr: SocketAddr, challenge: u32) {
        let Some(slot) = self.clients.find_client_by_addr(addr) else {
            debug!("Challenge response from unknown address {}", addr);
            return;
        };

        let now = self.server_time;
        let session = self.session_mut(slot);
        if session.challenge != challenge {
            debug!("Slot {}: challenge mismatch from {}", slot, addr);
            return;
        }

        match session.state() {
            ClientState::Challenging => {}
            state if state.is_joined() => {
                // Our connect response was lost
                self.send_oob(addr, &OobPacket::ConnectResponse { slot: slot as u32 });
                return;
            }
            state => {
                debug!("Slot {}: unexpected challenge response in {}", slot, state);
                return;
            }
        }
        self.session_mut(slot).last_packet_time = now;

        if let Some(reason) = self.simulation.client_connect(slot, true, false) {
            info!("Slot {} denied by game: {}", slot, reason);
            if let Err(e) = self.session_mut(slot).release() {
                error!("Slot {}: {}", slot, e);
            }
            self.send_oob(addr, &OobPacket::Refused { reason });
            return;
        }

        let (snapshot_msec, rate) = (self.config.snapshot_msec, self.config.rate);
        let session = self.session_mut(slot);
        if let Err(e) = session.transition(ClientState::Connected) {
            error!("Slot {}: {}", slot, e);
            return;
        }
        session.snapshot_msec = snapshot_msec;
        session.rate = rate.max(1);
        info!("Slot {} connected from {}", slot, addr);

        self.send_oob(addr, &OobPacket::ConnectResponse { slot: slot as u32 });
    }

    fn handle_sequenced(&mut self, addr: SocketAddr, data: &[u8]) {
        let Some(slot) = self.clients.find_client_by_addr(addr) else {
            debug!("Sequenced datagram from unknown address {}", addr);
            return;
        };

        let now = self.server_time;
        let session = self.session_mut(slot);
        if !session.state().accepts_sequenced() {
            debug!(
                "Slot {}: sequenced datagram while {}",
                slot,
                session.state()
            );
            return;
        }

        let payload = match session.channel.receive(data) {
            Ok(Received::Complete { payload, .. }) => {
                session.last_packet_time = now;
                payload
            }
            Ok(Received::Pending) => {
                session.last_packet_time = now;
                return;
            }
            Ok(Received::Rejected) => {
                trace!("Slot {}: rejected stale datagram", slot);
                return;
            }
            Err(e) => {
                debug!("Slot {}: malformed datagram: {}", slot, e);
                return;
            }
        };

        match packets::decode::<ClientPacket>(&payload) {
            Ok(packet) => self.process_client_packet(slot, packet),
            Err(e) => debug!("Slot {}: malformed client packet: {}", slot, e),
        }
    }

    fn process_client_packet(&mut self, slot: usize, packet: ClientPacket) {
        let session = self.session_mut(slot);

        // Both acknowledgements are checked before either is applied
        if packet.ack_sequence >= session.channel.outgoing_sequence()
            || packet.reliable_ack > session.reliable.sequence()
        {
            debug!(
                "Slot {}: acknowledgement out of range ({} / {})",
                slot, packet.ack_sequence, packet.reliable_ack
            );
            return;
        }
        if let Err(e) = session.acknowledge_sequence(packet.ack_sequence) {
            debug!("Slot {}: {}", slot, e);
        }
        if let Err(e) = session.reliable.acknowledge(packet.reliable_ack) {
            debug!("Slot {}: {}", slot, e);
        }

        for message in packet.messages {
            if !self.session_mut(slot).state().is_joined() {
                break;
            }

            match message {
                ClientMessage::Command { index, text } => {
                    let session = self.session_mut(slot);
                    if index <= session.last_client_command {
                        continue;
                    }
                    if index != session.last_client_command + 1 {
                        self.drop_client(slot, "Lost reliable commands");
                        return;
                    }
                    session.last_client_command = index;
                    self.simulation.client_command(slot, &text);
                }
                ClientMessage::Move {
                    gamestate_id,
                    command,
                } => {
                    let session = self.session_mut(slot);
                    if gamestate_id != session.gamestate_id {
                        trace!("Slot {}: move for stale gamestate {}", slot, gamestate_id);
                        continue;
                    }
                    match session.state() {
                        ClientState::Primed => {
                            if let Err(e) = session.transition(ClientState::Active) {
                                error!("Slot {}: {}", slot, e);
                                continue;
                            }
                            info!("Slot {} entered the game", slot);
                        }
                        ClientState::Active => {}
                        _ => continue,
                    }
                    self.simulation.client_input(slot, &command);
                }
                ClientMessage::Disconnect => {
                    self.drop_client(slot, "disconnected");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advances the server by one fixed step
    ///
    /// `current_time_ms` is the host clock. It never drives simulation time;
    /// it is only compared against server time to report a host that cannot
    /// keep up with the tick rate.
    pub fn run_tick(&mut self, current_time_ms: u64) {
        self.check_host_clock(current_time_ms);

        self.server_time += self.config.frame_msec;
        self.tick += 1;

        self.apply_deferred();
        self.simulation.run_frame(self.server_time);
        self.check_timeouts();
        self.send_client_messages();

        trace!("Tick {} at {}ms", self.tick, self.server_time);
    }

    fn check_host_clock(&mut self, current_time_ms: u64) {
        let origin = *self
            .host_origin
            .get_or_insert(current_time_ms.saturating_sub(self.server_time));
        let host_elapsed = current_time_ms.saturating_sub(origin);
        let behind = host_elapsed.saturating_sub(self.server_time);

        let lagging = behind > LAG_WARN_FRAMES * self.config.frame_msec;
        if lagging && !self.lagging {
            warn!(
                "Server time is {}ms behind the host clock; ticks are running late",
                behind
            );
        }
        self.lagging = lagging;
    }

    fn apply_deferred(&mut self) {
        while let Some(scheduled) = self.deferred.receive() {
            let generation = match scheduled.action.slot() {
                Some(slot) => match self.live_generation(slot) {
                    Some(generation) => Some(generation),
                    None => {
                        debug!("Discarding deferred action for empty slot {}", slot);
                        continue;
                    }
                },
                None => None,
            };
            self.deferred.push(
                self.server_time.saturating_add(scheduled.delay_msec),
                generation,
                scheduled.action,
            );
        }

        while let Some(event) = self.deferred.pop_due(self.server_time) {
            if let Some(slot) = event.action.slot() {
                if self.live_generation(slot) != event.generation {
                    debug!("Discarding deferred action for departed client in slot {}", slot);
                    continue;
                }
            }
            self.apply_action(event.action);
        }
    }

    fn live_generation(&self, slot: usize) -> Option<u32> {
        self.clients
            .get(slot)
            .filter(|s| !matches!(s.state(), ClientState::Free | ClientState::Zombie))
            .map(|s| s.generation)
    }

    fn apply_action(&mut self, action: DeferredAction) {
        match action {
            DeferredAction::ServerCommand { slot, text } => {
                self.send_server_command(slot, &text);
            }
            DeferredAction::ClientCommand { slot, text } => {
                if self.session_mut(slot).state().is_joined() {
                    self.simulation.client_command(slot, &text);
                }
            }
            DeferredAction::Drop { slot, reason } => self.drop_client(slot, &reason),
            DeferredAction::ResetWorld => self.reset_world(),
        }
    }

    fn check_timeouts(&mut self) {
        let now = self.server_time;
        for slot in self.clients.check_timeouts(now, self.config.timeout_msec) {
            info!("Slot {} timed out", slot);
            self.drop_client(slot, "timed out");
        }

        for slot in self.clients.expired_zombies(now, self.config.zombie_msec) {
            if let Err(e) = self.session_mut(slot).release() {
                error!("Slot {}: {}", slot, e);
            } else {
                debug!("Slot {} is free", slot);
            }
        }
    }

    fn send_client_messages(&mut self) {
        if !self.clients.iter().any(|s| s.state().is_joined()) {
            return;
        }

        let snapshot = Arc::new(Snapshot::new(self.tick, self.simulation.entities()));
        for slot in 0..self.clients.max_clients() {
            self.send_client_message(slot, &snapshot);
        }
    }

    /// Builds the datagram one client gets this tick, if any
    fn send_client_message(&mut self, slot: usize, snapshot: &Arc<Snapshot>) {
        let now = self.server_time;
        let gamestate_id = self.gamestate_id;
        let Some(session) = self.clients.get_mut(slot) else {
            return;
        };
        let Some(addr) = session.addr else {
            return;
        };

        let snapshot_due = now >= session.next_snapshot_time;
        let body = match session.state() {
            ClientState::Connected => {
                if let Err(e) = session.transition(ClientState::Primed) {
                    error!("Slot {}: {}", slot, e);
                    return;
                }
                session.gamestate_id = gamestate_id;
                ServerBody::Gamestate {
                    gamestate_id,
                    snapshot: delta::encode(None, snapshot),
                }
            }
            ClientState::Primed if snapshot_due => ServerBody::Gamestate {
                gamestate_id: session.gamestate_id,
                snapshot: delta::encode(None, snapshot),
            },
            ClientState::Active if snapshot_due => ServerBody::Snapshot(delta::encode(
                session.baseline().map(|b| &**b),
                snapshot,
            )),
            // Throttled: reliable commands still go out on time
            ClientState::Primed | ClientState::Active if session.reliable.pending_len() > 0 => {
                ServerBody::Empty
            }
            _ => return,
        };

        let is_snapshot = matches!(body, ServerBody::Snapshot(_));
        let carries_state = !matches!(body, ServerBody::Empty);

        let (sequence, datagrams) = match Self::build_datagrams(session, body, now) {
            Ok(built) => built,
            Err(e @ ProtocolError::Oversized { .. }) => {
                warn!("Slot {}: {}", slot, e);
                self.drop_client(slot, "Server message overflow");
                return;
            }
            Err(e) => {
                error!("Slot {}: failed to encode packet: {}", slot, e);
                return;
            }
        };

        if is_snapshot {
            session.record_frame(sequence, Arc::clone(snapshot));
        }
        if carries_state {
            let bytes: usize = datagrams.iter().map(Vec::len).sum();
            let rate_delay = bytes as u64 * 1000 / u64::from(session.rate.max(1));
            session.last_snapshot_time = now;
            session.next_snapshot_time = now + session.snapshot_msec.max(rate_delay);
        }

        self.outbox
            .extend(datagrams.into_iter().map(|data| Outbound { addr, data }));
    }

    fn build_datagrams(
        session: &mut Session,
        body: ServerBody,
        server_time: u64,
    ) -> Result<(u32, Vec<Vec<u8>>), ProtocolError> {
        let packet = ServerPacket {
            ack_sequence: session.channel.incoming_sequence(),
            client_command_ack: session.last_client_command,
            server_time: server_time as u32,
            reliable: session.reliable.pending(),
            body,
        };
        let bytes = packets::encode(&packet)?;
        session.channel.send(&bytes)
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Queues a reliable command for one joined client
    ///
    /// A full queue cannot be reconciled, so it drops the client. Returns
    /// the command index when queued.
    pub fn send_server_command(&mut self, slot: usize, text: &str) -> Option<u32> {
        let session = self.clients.get_mut(slot)?;
        if !session.state().is_joined() {
            return None;
        }

        match session.reliable.enqueue(text) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("Slot {}: {}", slot, e);
                self.drop_client(slot, "Server command overflow");
                None
            }
        }
    }

    /// Queues a reliable command for every joined client
    pub fn broadcast_server_command(&mut self, text: &str) {
        for slot in 0..self.clients.max_clients() {
            self.send_server_command(slot, text);
        }
    }

    /// Moves a client to ZOMBIE, delivering the reason one last time
    pub fn drop_client(&mut self, slot: usize, reason: &str) {
        let now = self.server_time;
        let Some(session) = self.clients.get_mut(slot) else {
            return;
        };
        let state = session.state();
        if matches!(state, ClientState::Free | ClientState::Zombie) {
            return;
        }
        let Some(addr) = session.addr else {
            return;
        };

        info!("Dropping slot {} ({}): {}", slot, state, reason);

        let mut delivered = false;
        if state.is_joined()
            && session
                .reliable
                .enqueue(format!("disconnect \"{}\"", reason))
                .is_ok()
        {
            match Self::build_datagrams(session, ServerBody::Empty, now) {
                Ok((_, datagrams)) => {
                    self.outbox
                        .extend(datagrams.into_iter().map(|data| Outbound { addr, data }));
                    delivered = true;
                }
                Err(e) => error!("Slot {}: failed to encode final packet: {}", slot, e),
            }
        }

        if let Err(e) = self.session_mut(slot).zombify(now) {
            error!("Slot {}: {}", slot, e);
        }
        if !delivered {
            self.send_oob(
                addr,
                &OobPacket::Disconnected {
                    reason: reason.to_string(),
                },
            );
        }
        if state.is_joined() {
            self.simulation.client_disconnect(slot);
        }
    }

    /// Frees a slot at once, without a grace period or final message
    fn discard(&mut self, slot: usize) {
        let now = self.server_time;
        let session = self.session_mut(slot);
        let state = session.state();
        if state == ClientState::Free {
            return;
        }
        if state != ClientState::Zombie {
            if let Err(e) = session.zombify(now) {
                error!("Slot {}: {}", slot, e);
            }
        }
        if let Err(e) = session.release() {
            error!("Slot {}: {}", slot, e);
        }
        if state.is_joined() {
            self.simulation.client_disconnect(slot);
        }
    }

    /// Restarts the world without tearing down connections
    ///
    /// Every joined client is told to `map_restart`, re-admitted by the
    /// simulation as a returning player and sent back through priming with
    /// no delta baseline. Zombie slots are freed outright.
    pub fn reset_world(&mut self) {
        self.gamestate_id += 1;
        info!("World reset, gamestate {}", self.gamestate_id);

        for slot in 0..self.clients.max_clients() {
            match self.session_mut(slot).state() {
                ClientState::Zombie => self.discard(slot),
                state if state.is_joined() => {
                    if self.send_server_command(slot, "map_restart").is_none() {
                        continue;
                    }
                    if let Some(reason) = self.simulation.client_connect(slot, false, false) {
                        warn!("Slot {} denied after reset: {}", slot, reason);
                        self.drop_client(slot, &reason);
                        continue;
                    }
                    let gamestate_id = self.gamestate_id;
                    self.session_mut(slot).restart(gamestate_id);
                }
                _ => {}
            }
        }
    }

    /// Drops every client and frees all slots
    pub fn shutdown(&mut self) {
        info!("Server shutting down");
        for slot in 0..self.clients.max_clients() {
            self.drop_client(slot, "Server shutting down");
            self.discard(slot);
        }
    }

    fn send_oob(&mut self, addr: SocketAddr, packet: &OobPacket) {
        match packets::encode(packet) {
            Ok(body) => self.outbox.push(Outbound {
                addr,
                data: channel::write_out_of_band(&body),
            }),
            Err(e) => error!("Failed to encode out-of-band packet: {}", e),
        }
    }

    /// Slots passed here come from the client table itself
    fn session_mut(&mut self, slot: usize) -> &mut Session {
        &mut self.clients[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BanList, NoBans};
    use shared::{EntityState, EntityUpdate, ReliableCommand, UserCommand};

    #[derive(Default)]
    struct MockSimulation {
        entities: Vec<EntityState>,
        deny: Option<String>,
        frames: Vec<u64>,
        connects: Vec<(usize, bool)>,
        disconnects: Vec<usize>,
        commands: Vec<(usize, String)>,
        inputs: Vec<(usize, UserCommand)>,
    }

    impl Simulation for MockSimulation {
        fn client_connect(&mut self, slot: usize, first_time: bool, _is_bot: bool) -> Option<String> {
            self.connects.push((slot, first_time));
            self.deny.clone()
        }

        fn run_frame(&mut self, server_time: u64) {
            self.frames.push(server_time);
        }

        fn client_disconnect(&mut self, slot: usize) {
            self.disconnects.push(slot);
        }

        fn client_command(&mut self, slot: usize, command: &str) {
            self.commands.push((slot, command.to_string()));
        }

        fn client_input(&mut self, slot: usize, input: &UserCommand) {
            self.inputs.push((slot, *input));
        }

        fn entities(&self) -> Vec<EntityState> {
            self.entities.clone()
        }
    }

    type Driver = TickDriver<MockSimulation, NoBans>;

    /// Minimal peer speaking the wire protocol by hand
    struct Peer {
        addr: SocketAddr,
        channel: shared::SequencedChannel,
        reliable_ack: u32,
    }

    impl Peer {
        fn new(port: u16) -> Self {
            Self {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                channel: shared::SequencedChannel::default(),
                reliable_ack: 0,
            }
        }

        fn oob(&self, packet: OobPacket) -> Vec<u8> {
            channel::write_out_of_band(&packets::encode(&packet).unwrap())
        }

        fn packet(&mut self, messages: Vec<ClientMessage>) -> Vec<u8> {
            let packet = ClientPacket {
                ack_sequence: self.channel.incoming_sequence(),
                reliable_ack: self.reliable_ack,
                messages,
            };
            let (_, mut datagrams) = self.channel.send(&packets::encode(&packet).unwrap()).unwrap();
            datagrams.remove(0)
        }

        /// Feeds every datagram addressed to us, returning decoded packets
        fn receive(&mut self, outbound: &[Outbound]) -> Vec<ServerPacket> {
            outbound
                .iter()
                .filter(|o| o.addr == self.addr)
                .filter_map(|o| match self.channel.receive(&o.data) {
                    Ok(Received::Complete { payload, .. }) => packets::decode(&payload).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    fn oob_replies(outbound: &[Outbound], addr: SocketAddr) -> Vec<OobPacket> {
        outbound
            .iter()
            .filter(|o| o.addr == addr)
            .filter(|o| matches!(channel::read_header(&o.data), Ok(Header::OutOfBand)))
            .map(|o| packets::decode(&o.data[4..]).unwrap())
            .collect()
    }

    fn driver() -> Driver {
        let config = ServerConfig {
            max_clients: 4,
            frame_msec: 50,
            timeout_msec: 1000,
            zombie_msec: 200,
            snapshot_msec: 50,
            ..ServerConfig::default()
        };
        TickDriver::new(config, MockSimulation::default(), NoBans)
    }

    /// Runs the handshake and returns the slot in CONNECTED
    fn connect(driver: &mut Driver, peer: &Peer) -> usize {
        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        let challenge = match oob_replies(&driver.take_outbound(), peer.addr).pop() {
            Some(OobPacket::Challenge { challenge }) => challenge,
            other => panic!("expected challenge, got {:?}", other),
        };
        driver.handle_datagram(peer.addr, &peer.oob(OobPacket::ChallengeResponse { challenge }));
        match oob_replies(&driver.take_outbound(), peer.addr).pop() {
            Some(OobPacket::ConnectResponse { slot }) => slot as usize,
            other => panic!("expected connect response, got {:?}", other),
        }
    }

    /// Connects, primes and activates a peer
    fn activate(driver: &mut Driver, peer: &mut Peer) -> usize {
        let slot = connect(driver, peer);
        driver.run_tick(0);
        let packets = peer.receive(&driver.take_outbound());
        let gamestate_id = match &packets[0].body {
            ServerBody::Gamestate { gamestate_id, .. } => *gamestate_id,
            other => panic!("expected gamestate, got {:?}", other),
        };
        let datagram = peer.packet(vec![ClientMessage::Move {
            gamestate_id,
            command: UserCommand::default(),
        }]);
        driver.handle_datagram(peer.addr, &datagram);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Active);
        slot
    }

    fn entity(id: u32, x: i32) -> EntityState {
        let mut state = EntityState::new(id);
        state.origin = [x, 0, 0];
        state
    }

    #[test]
    fn test_handshake_states() {
        let mut driver = driver();
        let peer = Peer::new(5000);

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        assert_eq!(driver.session(0).unwrap().state(), ClientState::Challenging);

        let slot = connect(&mut driver, &peer);
        assert_eq!(slot, 0);
        assert_eq!(driver.session(0).unwrap().state(), ClientState::Connected);
        assert_eq!(driver.simulation().connects, vec![(0, true)]);
        assert_eq!(driver.clients().len(), 1);
    }

    #[test]
    fn test_banned_peer_gets_no_session() {
        let mut bans = BanList::default();
        bans.ban("127.0.0.0".parse().unwrap(), 8);
        let mut driver = TickDriver::new(ServerConfig::default(), MockSimulation::default(), bans);
        let peer = Peer::new(5000);

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );

        assert!(driver.clients().is_empty());
        assert_eq!(
            oob_replies(&driver.take_outbound(), peer.addr),
            vec![OobPacket::Refused {
                reason: ConnectError::Banned.to_string()
            }]
        );
    }

    #[test]
    fn test_protocol_mismatch_refused() {
        let mut driver = driver();
        let peer = Peer::new(5000);

        driver.handle_datagram(peer.addr, &peer.oob(OobPacket::Connect { protocol_version: 1 }));

        assert!(driver.clients().is_empty());
        assert!(matches!(
            oob_replies(&driver.take_outbound(), peer.addr).as_slice(),
            [OobPacket::Refused { .. }]
        ));
    }

    #[test]
    fn test_server_full() {
        let mut driver = driver();
        for port in 0..4 {
            connect(&mut driver, &Peer::new(6000 + port));
        }
        let late = Peer::new(7000);

        driver.handle_datagram(
            late.addr,
            &late.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        assert_eq!(
            oob_replies(&driver.take_outbound(), late.addr),
            vec![OobPacket::Refused {
                reason: "Server is full".to_string()
            }]
        );
    }

    #[test]
    fn test_game_denial_returns_slot_to_free() {
        let mut driver = driver();
        driver.simulation_mut().deny = Some("Team is full".to_string());
        let peer = Peer::new(5000);

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        let challenge = match oob_replies(&driver.take_outbound(), peer.addr).pop() {
            Some(OobPacket::Challenge { challenge }) => challenge,
            other => panic!("expected challenge, got {:?}", other),
        };
        driver.handle_datagram(peer.addr, &peer.oob(OobPacket::ChallengeResponse { challenge }));

        assert_eq!(driver.session(0).unwrap().state(), ClientState::Free);
        assert_eq!(
            oob_replies(&driver.take_outbound(), peer.addr),
            vec![OobPacket::Refused {
                reason: "Team is full".to_string()
            }]
        );
    }

    #[test]
    fn test_wrong_challenge_is_ignored() {
        let mut driver = driver();
        let peer = Peer::new(5000);

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        let challenge = driver.session(0).unwrap().challenge;
        driver.take_outbound();

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::ChallengeResponse {
                challenge: challenge.wrapping_add(1),
            }),
        );
        assert_eq!(driver.session(0).unwrap().state(), ClientState::Challenging);
        assert!(driver.take_outbound().is_empty());
    }

    #[test]
    fn test_malformed_and_early_datagrams_change_nothing() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);

        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );
        driver.take_outbound();

        // Sequenced traffic before the handshake completes
        let early = peer.packet(vec![ClientMessage::Disconnect]);
        driver.handle_datagram(peer.addr, &early);
        driver.handle_datagram(peer.addr, &[1, 2]);
        driver.handle_datagram(peer.addr, &[0xFF, 0xFF, 0xFF, 0xFF, 9, 9]);

        assert_eq!(driver.session(0).unwrap().state(), ClientState::Challenging);
        assert!(driver.take_outbound().is_empty());
    }

    #[test]
    fn test_connected_cannot_skip_to_active() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = connect(&mut driver, &peer);

        let datagram = peer.packet(vec![ClientMessage::Move {
            gamestate_id: driver.gamestate_id(),
            command: UserCommand::default(),
        }]);
        driver.handle_datagram(peer.addr, &datagram);

        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Connected);
        assert!(driver.simulation().inputs.is_empty());
    }

    #[test]
    fn test_priming_then_active() {
        let mut driver = driver();
        driver.simulation_mut().entities = vec![entity(1, 0), entity(2, 0)];
        let mut peer = Peer::new(5000);
        let slot = connect(&mut driver, &peer);

        driver.run_tick(0);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Primed);
        let packets = peer.receive(&driver.take_outbound());
        assert_eq!(packets.len(), 1);
        match &packets[0].body {
            ServerBody::Gamestate { snapshot, .. } => {
                assert!(snapshot.is_full());
                assert_eq!(snapshot.updates.len(), 2);
            }
            other => panic!("expected gamestate, got {:?}", other),
        }

        let stale = peer.packet(vec![ClientMessage::Move {
            gamestate_id: 99,
            command: UserCommand::default(),
        }]);
        driver.handle_datagram(peer.addr, &stale);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Primed);

        let datagram = peer.packet(vec![ClientMessage::Move {
            gamestate_id: driver.gamestate_id(),
            command: UserCommand {
                sequence: 1,
                right: true,
                ..Default::default()
            },
        }]);
        driver.handle_datagram(peer.addr, &datagram);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Active);
        assert_eq!(driver.simulation().inputs.len(), 1);
    }

    #[test]
    fn test_delta_against_acknowledged_baseline() {
        let mut driver = driver();
        driver.simulation_mut().entities = vec![entity(1, 0), entity(2, 0)];
        let mut peer = Peer::new(5000);
        activate(&mut driver, &mut peer);

        driver.run_tick(50);
        let packets = peer.receive(&driver.take_outbound());
        match &packets[0].body {
            ServerBody::Snapshot(payload) => assert!(payload.is_full()),
            other => panic!("expected snapshot, got {:?}", other),
        }
        let ack = peer.packet(vec![]);
        driver.handle_datagram(peer.addr, &ack);

        driver.simulation_mut().entities[1].origin[0] = 16;
        driver.run_tick(100);
        let packets = peer.receive(&driver.take_outbound());
        match &packets[0].body {
            ServerBody::Snapshot(payload) => {
                assert!(!payload.is_full());
                assert_eq!(
                    payload.updates,
                    vec![EntityUpdate::Delta {
                        id: 2,
                        changed: 1,
                        values: vec![16]
                    }]
                );
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_reliable_resent_until_acknowledged() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        let index = driver.send_server_command(slot, "print hello").unwrap();
        for tick in 1..=3 {
            driver.run_tick(tick * 50);
            let packets = peer.receive(&driver.take_outbound());
            assert_eq!(
                packets[0].reliable,
                vec![ReliableCommand {
                    index,
                    text: "print hello".to_string()
                }]
            );
        }

        peer.reliable_ack = index;
        let ack = peer.packet(vec![]);
        driver.handle_datagram(peer.addr, &ack);

        driver.run_tick(200);
        let packets = peer.receive(&driver.take_outbound());
        assert!(packets[0].reliable.is_empty());
    }

    #[test]
    fn test_queue_full_drops_client() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        for i in 0..shared::MAX_RELIABLE_COMMANDS {
            assert!(driver.send_server_command(slot, &format!("cmd {}", i)).is_some());
        }
        assert!(driver.send_server_command(slot, "one too many").is_none());

        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Zombie);
        assert_eq!(driver.simulation().disconnects, vec![slot]);
        assert_eq!(
            oob_replies(&driver.take_outbound(), peer.addr),
            vec![OobPacket::Disconnected {
                reason: "Server command overflow".to_string()
            }]
        );
    }

    #[test]
    fn test_timeout_zombie_then_free() {
        let mut driver = driver();
        let mut quiet = Peer::new(5000);
        let mut chatty = Peer::new(5001);
        let quiet_slot = activate(&mut driver, &mut quiet);
        let chatty_slot = activate(&mut driver, &mut chatty);

        let mut now = 0;
        while driver.session(quiet_slot).unwrap().state() == ClientState::Active {
            now += 50;
            driver.run_tick(now);
            let outbound = driver.take_outbound();
            chatty.receive(&outbound);
            let keepalive = chatty.packet(vec![]);
            driver.handle_datagram(chatty.addr, &keepalive);
            assert!(now <= 2000, "client never timed out");
        }

        assert_eq!(driver.session(quiet_slot).unwrap().state(), ClientState::Zombie);
        assert!(driver.server_time() > 1000);

        driver.run_tick(now + 50);
        let outbound = driver.take_outbound();
        assert!(outbound.iter().all(|o| o.addr != quiet.addr));
        assert!(!chatty.receive(&outbound).is_empty());
        assert_eq!(driver.session(chatty_slot).unwrap().state(), ClientState::Active);

        for _ in 0..5 {
            now += 50;
            driver.run_tick(now);
        }
        assert_eq!(driver.session(quiet_slot).unwrap().state(), ClientState::Free);
    }

    #[test]
    fn test_handshake_timeout_goes_through_zombie() {
        let mut driver = driver();
        let peer = Peer::new(5000);
        driver.handle_datagram(
            peer.addr,
            &peer.oob(OobPacket::Connect {
                protocol_version: PROTOCOL_VERSION,
            }),
        );

        for tick in 1..=21 {
            driver.run_tick(tick * 50);
        }
        assert_eq!(driver.session(0).unwrap().state(), ClientState::Zombie);
        assert!(driver.simulation().disconnects.is_empty());
    }

    #[test]
    fn test_client_commands_run_once_per_index() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        let say = ClientMessage::Command {
            index: 1,
            text: "say hi".to_string(),
        };
        let first = peer.packet(vec![say.clone()]);
        driver.handle_datagram(peer.addr, &first);
        let resend = peer.packet(vec![say]);
        driver.handle_datagram(peer.addr, &resend);

        assert_eq!(driver.simulation().commands, vec![(slot, "say hi".to_string())]);

        let gap = peer.packet(vec![ClientMessage::Command {
            index: 5,
            text: "lost".to_string(),
        }]);
        driver.handle_datagram(peer.addr, &gap);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Zombie);
    }

    #[test]
    fn test_ack_out_of_range_is_ignored() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        peer.reliable_ack = 40;
        let bogus = peer.packet(vec![ClientMessage::Disconnect]);
        driver.handle_datagram(peer.addr, &bogus);

        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Active);
        assert_eq!(driver.session(slot).unwrap().reliable.acknowledged(), 0);
    }

    #[test]
    fn test_throttled_client_still_gets_reliable() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);
        driver.set_send_rate(slot, 200, 1_000_000);

        driver.run_tick(50);
        let packets = peer.receive(&driver.take_outbound());
        assert!(matches!(packets[0].body, ServerBody::Snapshot(_)));

        driver.run_tick(100);
        assert!(peer.receive(&driver.take_outbound()).is_empty());

        driver.send_server_command(slot, "print urgent");
        driver.run_tick(150);
        let packets = peer.receive(&driver.take_outbound());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, ServerBody::Empty);
        assert_eq!(packets[0].reliable.len(), 1);
    }

    #[test]
    fn test_deferred_actions_wait_for_due_time() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);
        let sender = driver.deferred_sender();

        sender.schedule(
            100,
            DeferredAction::ClientCommand {
                slot,
                text: "kill".to_string(),
            },
        );
        driver.run_tick(50);
        assert!(driver.simulation().commands.is_empty());

        driver.run_tick(100);
        driver.run_tick(150);
        assert_eq!(driver.simulation().commands, vec![(slot, "kill".to_string())]);
    }

    #[test]
    fn test_deferred_action_skips_reused_slot() {
        let mut driver = driver();
        let mut first = Peer::new(5000);
        let slot = activate(&mut driver, &mut first);
        let sender = driver.deferred_sender();

        sender.schedule(
            500,
            DeferredAction::Drop {
                slot,
                reason: "delayed kick".to_string(),
            },
        );
        driver.run_tick(50);

        let disconnect = first.packet(vec![ClientMessage::Disconnect]);
        driver.handle_datagram(first.addr, &disconnect);
        driver.reset_world();
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Free);

        let mut second = Peer::new(5001);
        assert_eq!(activate(&mut driver, &mut second), slot);

        for tick in 0..12 {
            driver.run_tick(100 + tick * 50);
            let outbound = driver.take_outbound();
            second.receive(&outbound);
            let keepalive = second.packet(vec![]);
            driver.handle_datagram(second.addr, &keepalive);
        }
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Active);
    }

    #[test]
    fn test_reset_world_reprimes_clients() {
        let mut driver = driver();
        driver.simulation_mut().entities = vec![entity(1, 0)];
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        driver.run_tick(50);
        peer.receive(&driver.take_outbound());
        let ack = peer.packet(vec![]);
        driver.handle_datagram(peer.addr, &ack);
        assert!(driver.session(slot).unwrap().baseline().is_some());
        let sequence_before = driver.session(slot).unwrap().channel.outgoing_sequence();

        driver.reset_world();
        let session = driver.session(slot).unwrap();
        assert_eq!(session.state(), ClientState::Connected);
        assert!(session.baseline().is_none());
        assert_eq!(session.incoming_acknowledged(), sequence_before - 1);
        assert_eq!(session.channel.outgoing_sequence(), sequence_before);
        assert_eq!(driver.simulation().connects, vec![(slot, true), (slot, false)]);

        driver.run_tick(100);
        let packets = peer.receive(&driver.take_outbound());
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Primed);
        assert!(packets[0].reliable.iter().any(|c| c.text == "map_restart"));
        assert!(matches!(
            packets[0].body,
            ServerBody::Gamestate { gamestate_id: 2, .. }
        ));
    }

    #[test]
    fn test_drop_sends_reason_reliably() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        driver.drop_client(slot, "kicked");
        let packets = peer.receive(&driver.take_outbound());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, ServerBody::Empty);
        assert_eq!(
            packets[0].reliable.last().map(|c| c.text.as_str()),
            Some("disconnect \"kicked\"")
        );

        driver.run_tick(50);
        assert!(driver.take_outbound().is_empty());
    }

    #[test]
    fn test_oversized_gamestate_drops_client() {
        let mut driver = driver();
        driver.simulation_mut().entities = (1..=2000).map(|id| entity(id, id as i32)).collect();
        let mut peer = Peer::new(5000);
        let slot = connect(&mut driver, &peer);

        driver.run_tick(0);
        let packets = peer.receive(&driver.take_outbound());

        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Zombie);
        assert_eq!(driver.simulation().disconnects, vec![slot]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, ServerBody::Empty);
        assert_eq!(
            packets[0].reliable.last().map(|c| c.text.as_str()),
            Some("disconnect \"Server message overflow\"")
        );
    }

    #[test]
    fn test_far_future_deferred_action_never_fires() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);

        driver.deferred_sender().schedule(u64::MAX - 10, DeferredAction::ResetWorld);
        driver.run_tick(50);
        driver.run_tick(100);

        assert_eq!(driver.gamestate_id(), 1);
        assert_eq!(driver.session(slot).unwrap().state(), ClientState::Active);
    }

    #[test]
    fn test_reconnect_from_same_address_frees_old_session() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        let slot = activate(&mut driver, &mut peer);
        let generation = driver.session(slot).unwrap().generation;

        let again = Peer::new(5000);
        let new_slot = connect(&mut driver, &again);

        assert_eq!(new_slot, slot);
        assert_eq!(driver.session(slot).unwrap().generation, generation + 1);
        assert_eq!(driver.simulation().disconnects, vec![slot]);
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let mut driver = driver();
        let mut peer = Peer::new(5000);
        activate(&mut driver, &mut peer);
        connect(&mut driver, &Peer::new(5001));

        driver.shutdown();
        assert!(driver.clients().is_empty());
        assert_eq!(driver.simulation().disconnects.len(), 2);
    }
}
