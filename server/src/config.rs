//! Server configuration

use shared::FRAGMENT_SIZE;
use std::time::Duration;

/// Tunables for the tick driver and network shell
///
/// All times are milliseconds of tick-driver time unless the name says
/// otherwise.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_clients: usize,
    /// Length of one fixed simulation step
    pub frame_msec: u64,
    /// Silence after which a client is dropped
    pub timeout_msec: u64,
    /// How long a dropped client lingers as a zombie
    pub zombie_msec: u64,
    /// Default minimum spacing between snapshots to one client
    pub snapshot_msec: u64,
    /// Default bandwidth budget per client in bytes per second
    pub rate: u32,
    /// Largest datagram payload before fragmenting
    pub fragment_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:27960".to_string(),
            max_clients: 32,
            frame_msec: 50,
            timeout_msec: 30_000,
            zombie_msec: 2_000,
            snapshot_msec: 50,
            rate: 25_000,
            fragment_size: FRAGMENT_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.frame_msec)
    }

    /// Derives the frame length from a tick rate in Hz
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.frame_msec = (1000 / u64::from(hz.max(1))).max(1);
        self
    }
}
