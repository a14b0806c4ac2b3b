//! Boundary between the network core and the game logic
//!
//! The core drives the simulation through this trait and never looks
//! inside it. All calls happen on the tick driver, one at a time.

use shared::{EntityState, UserCommand};

pub trait Simulation {
    /// A client is joining, or rejoining after a world reset when
    /// `first_time` is false. Returning a reason refuses the join.
    fn client_connect(&mut self, slot: usize, first_time: bool, is_bot: bool) -> Option<String>;

    /// Advances the game to `server_time`
    fn run_frame(&mut self, server_time: u64);

    fn client_disconnect(&mut self, slot: usize);

    /// A reliable client command, delivered once per command index
    fn client_command(&mut self, _slot: usize, _command: &str) {}

    /// Input from an ACTIVE client
    fn client_input(&mut self, _slot: usize, _input: &UserCommand) {}

    /// Quantised state of every networked entity, used to build snapshots
    fn entities(&self) -> Vec<EntityState>;
}
