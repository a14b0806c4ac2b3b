//! Fixed-capacity slot table of client sessions
//!
//! This module owns every [`Session`] the server can host, including:
//! - Slot allocation for new peers and reclamation of zombie slots
//! - Address lookup for routing inbound datagrams
//! - Timeout and grace-period detection in tick-driver time
//!
//! Slots are never removed from the table; a departed client simply leaves
//! its slot in the FREE state with a bumped generation on the next reuse.

use log::info;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};

use crate::session::{ClientState, Session};

/// Manages all client slots
///
/// The ClientManager only answers questions and hands out sessions. State
/// changes with side effects (callbacks into the simulation, final
/// datagrams) belong to the tick driver.
pub struct ClientManager {
    /// One session per slot, indexed by slot number
    sessions: Vec<Session>,
}

impl ClientManager {
    /// Creates a table with `max_clients` FREE slots
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: (0..max_clients).map(Session::new).collect(),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.sessions.len()
    }

    /// Attempts to claim a slot for a new peer
    ///
    /// Prefers the lowest FREE slot. When none is free, the zombie that has
    /// lingered longest is released and reused at once. Returns None if
    /// every slot holds a live client.
    pub fn allocate(
        &mut self,
        addr: SocketAddr,
        protocol_version: u32,
        now: u64,
        fragment_size: usize,
    ) -> Option<usize> {
        let slot = match self
            .sessions
            .iter()
            .position(|s| s.state() == ClientState::Free)
        {
            Some(slot) => slot,
            None => {
                let slot = self
                    .sessions
                    .iter()
                    .filter(|s| s.state() == ClientState::Zombie)
                    .min_by_key(|s| s.zombie_since)
                    .map(|s| s.slot)?;
                info!("Reclaiming zombie slot {} for {}", slot, addr);
                self.sessions[slot].release().ok()?;
                slot
            }
        };

        let session = &mut self.sessions[slot];
        session
            .allocate(addr, protocol_version, now, fragment_size)
            .ok()?;
        info!("Slot {} allocated to {}", slot, addr);

        Some(slot)
    }

    /// Finds the occupied slot a network address belongs to
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.sessions
            .iter()
            .find(|s| s.state() != ClientState::Free && s.addr == Some(addr))
            .map(|s| s.slot)
    }

    pub fn get(&self, slot: usize) -> Option<&Session> {
        self.sessions.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.sessions.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    /// Slots whose peer has gone quiet for longer than `timeout`
    ///
    /// Covers every live state, including clients still in the handshake.
    pub fn check_timeouts(&self, now: u64, timeout: u64) -> Vec<usize> {
        self.sessions
            .iter()
            .filter(|s| !matches!(s.state(), ClientState::Free | ClientState::Zombie))
            .filter(|s| s.is_timed_out(now, timeout))
            .map(|s| s.slot)
            .collect()
    }

    /// Zombie slots whose grace period has elapsed
    pub fn expired_zombies(&self, now: u64, grace: u64) -> Vec<usize> {
        self.sessions
            .iter()
            .filter(|s| s.state() == ClientState::Zombie)
            .filter(|s| now.saturating_sub(s.zombie_since) >= grace)
            .map(|s| s.slot)
            .collect()
    }

    pub fn count_in(&self, state: ClientState) -> usize {
        self.sessions.iter().filter(|s| s.state() == state).count()
    }

    /// Returns the number of occupied slots
    pub fn len(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state() != ClientState::Free)
            .count()
    }

    /// Returns true if every slot is free
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Index<usize> for ClientManager {
    type Output = Session;

    fn index(&self, slot: usize) -> &Session {
        &self.sessions[slot]
    }
}

impl IndexMut<usize> for ClientManager {
    fn index_mut(&mut self, slot: usize) -> &mut Session {
        &mut self.sessions[slot]
    }
}
