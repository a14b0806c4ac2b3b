//! Per-slot client session and its connection state machine
//!
//! A session moves through its states only by [`Session::transition`], which
//! refuses any edge not in the table below. The single exception is
//! [`Session::restart`], used by a world reset to send every joined client
//! back through priming without tearing the slot down.
//!
//! ```text
//! FREE -> CONNECTING -> CHALLENGING -> CONNECTED -> PRIMED -> ACTIVE
//!                            |                                  |
//!                            +--> FREE (join denied)            |
//! CONNECTING..ACTIVE ----------------------------------------> ZOMBIE -> FREE
//! ```

use log::debug;
use shared::{SequencedChannel, Snapshot, PACKET_BACKUP};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::reliable::ReliableQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Free,
    Connecting,
    Challenging,
    Connected,
    Primed,
    Active,
    Zombie,
}

impl ClientState {
    /// Whether `next` is reachable from `self` in one step
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Free, Connecting)
                | (Connecting, Challenging)
                | (Challenging, Connected)
                | (Challenging, Free)
                | (Connected, Primed)
                | (Primed, Active)
                | (Connecting | Challenging | Connected | Primed | Active, Zombie)
                | (Zombie, Free)
        )
    }

    /// States in which the simulation knows about the client
    pub fn is_joined(self) -> bool {
        matches!(
            self,
            ClientState::Connected | ClientState::Primed | ClientState::Active
        )
    }

    /// States in which sequenced traffic is accepted
    pub fn accepts_sequenced(self) -> bool {
        self.is_joined()
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Free => "FREE",
            ClientState::Connecting => "CONNECTING",
            ClientState::Challenging => "CHALLENGING",
            ClientState::Connected => "CONNECTED",
            ClientState::Primed => "PRIMED",
            ClientState::Active => "ACTIVE",
            ClientState::Zombie => "ZOMBIE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Reliable command queue is full")]
    QueueFull,
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: ClientState, to: ClientState },
    #[error("Acknowledgement {ack} is beyond latest {latest}")]
    AckOutOfRange { ack: u32, latest: u32 },
}

/// A snapshot sent in a particular outbound datagram
#[derive(Debug, Clone)]
struct SentFrame {
    sequence: u32,
    snapshot: Arc<Snapshot>,
}

/// State kept for one client slot
#[derive(Debug)]
pub struct Session {
    /// Fixed slot index
    pub slot: usize,
    /// Bumped on every allocation so stale references to the slot can be told apart
    pub generation: u32,
    pub addr: Option<SocketAddr>,
    pub protocol_version: u32,
    state: ClientState,
    /// Token the client must echo while CHALLENGING
    pub challenge: u32,

    /// Tick-driver time of the last accepted datagram
    pub last_packet_time: u64,
    pub last_snapshot_time: u64,
    /// Earliest tick-driver time the next snapshot may go out
    pub next_snapshot_time: u64,
    pub zombie_since: u64,
    /// Minimum spacing between snapshots in ms
    pub snapshot_msec: u64,
    /// Bandwidth budget in bytes per second
    pub rate: u32,

    pub channel: SequencedChannel,
    /// Highest outbound sequence the client has acknowledged
    incoming_acknowledged: u32,
    pub reliable: ReliableQueue,
    frames: Vec<Option<SentFrame>>,
    baseline: Option<Arc<Snapshot>>,

    /// Gamestate the client was last primed with
    pub gamestate_id: u32,
    /// Highest client command index executed
    pub last_client_command: u32,
}

impl Session {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            generation: 0,
            addr: None,
            protocol_version: 0,
            state: ClientState::Free,
            challenge: 0,
            last_packet_time: 0,
            last_snapshot_time: 0,
            next_snapshot_time: 0,
            zombie_since: 0,
            snapshot_msec: 0,
            rate: 0,
            channel: SequencedChannel::default(),
            incoming_acknowledged: 0,
            reliable: ReliableQueue::new(),
            frames: vec![None; PACKET_BACKUP],
            baseline: None,
            gamestate_id: 0,
            last_client_command: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Moves to `next` if the state table allows it
    pub fn transition(&mut self, next: ClientState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        debug!("Slot {}: {} -> {}", self.slot, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Claims a free slot for a new peer and enters CONNECTING
    pub fn allocate(
        &mut self,
        addr: SocketAddr,
        protocol_version: u32,
        now: u64,
        fragment_size: usize,
    ) -> Result<(), SessionError> {
        self.transition(ClientState::Connecting)?;

        let slot = self.slot;
        let generation = self.generation.wrapping_add(1);
        *self = Session::new(slot);
        self.state = ClientState::Connecting;
        self.generation = generation;
        self.addr = Some(addr);
        self.protocol_version = protocol_version;
        self.last_packet_time = now;
        self.channel = SequencedChannel::new(fragment_size);
        Ok(())
    }

    /// Returns the slot to FREE, dropping every snapshot reference it held
    pub fn release(&mut self) -> Result<(), SessionError> {
        self.transition(ClientState::Free)?;

        let slot = self.slot;
        let generation = self.generation;
        *self = Session::new(slot);
        self.generation = generation;
        Ok(())
    }

    /// Enters ZOMBIE, cancelling any further snapshot dispatch
    pub fn zombify(&mut self, now: u64) -> Result<(), SessionError> {
        self.transition(ClientState::Zombie)?;
        self.zombie_since = now;
        self.clear_snapshots();
        Ok(())
    }

    /// Synthetic reconnect after a world reset
    ///
    /// Keeps slot, address, channel and reliable queue; forgets every sent
    /// frame and the baseline, and ignores acknowledgements of datagrams sent
    /// before this point.
    pub fn restart(&mut self, gamestate_id: u32) {
        debug!("Slot {}: {} -> {} (restart)", self.slot, self.state, ClientState::Connected);
        self.state = ClientState::Connected;
        self.gamestate_id = gamestate_id;
        self.next_snapshot_time = 0;
        self.clear_snapshots();
        self.incoming_acknowledged = self.channel.outgoing_sequence() - 1;
    }

    fn clear_snapshots(&mut self) {
        self.frames.iter_mut().for_each(|f| *f = None);
        self.baseline = None;
    }

    pub fn is_timed_out(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.last_packet_time) > timeout
    }

    pub fn incoming_acknowledged(&self) -> u32 {
        self.incoming_acknowledged
    }

    pub fn baseline(&self) -> Option<&Arc<Snapshot>> {
        self.baseline.as_ref()
    }

    /// Remembers the snapshot sent in the datagram with `sequence`
    pub fn record_frame(&mut self, sequence: u32, snapshot: Arc<Snapshot>) {
        self.frames[sequence as usize % PACKET_BACKUP] = Some(SentFrame { sequence, snapshot });
    }

    /// Number of sent snapshots still waiting on an acknowledgement
    pub fn unacknowledged_frames(&self) -> usize {
        self.frames.iter().flatten().count()
    }

    /// Applies the client's acknowledgement of an outbound sequence
    ///
    /// Advancing the acknowledgement replaces the baseline with the snapshot
    /// sent in that datagram, when it is still in the window, and retires all
    /// frames at or below it. Acknowledging something never sent is an error
    /// and changes nothing.
    pub fn acknowledge_sequence(&mut self, ack: u32) -> Result<(), SessionError> {
        let latest = self.channel.outgoing_sequence() - 1;
        if ack > latest {
            return Err(SessionError::AckOutOfRange { ack, latest });
        }
        if ack <= self.incoming_acknowledged {
            return Ok(());
        }
        self.incoming_acknowledged = ack;

        if let Some(frame) = &self.frames[ack as usize % PACKET_BACKUP] {
            if frame.sequence == ack {
                self.baseline = Some(Arc::clone(&frame.snapshot));
            }
        }

        for frame in self.frames.iter_mut() {
            if frame.as_ref().is_some_and(|f| f.sequence <= ack) {
                *frame = None;
            }
        }

        Ok(())
    }
}
