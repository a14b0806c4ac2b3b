//! Demo platformer simulation
//!
//! A minimal game behind the [`Simulation`] trait so the server binary has
//! something to network: every joined client controls one box that runs,
//! jumps and falls onto a floor. Positions are kept in world units and
//! quantised to fixed point only when a snapshot is taken.

use log::{debug, info};
use shared::entity::ORIGIN_SCALE;
use shared::{EntityState, UserCommand};
use std::collections::BTreeMap;

use crate::simulation::Simulation;

pub const GRAVITY: f32 = 980.0;
pub const PLAYER_SPEED: f32 = 300.0;
pub const JUMP_VELOCITY: f32 = -400.0;
pub const FLOOR_Y: f32 = 550.0;
pub const WORLD_WIDTH: f32 = 800.0;
pub const PLAYER_SIZE: f32 = 32.0;

/// Model index carried by player entities
const PLAYER_MODEL: i32 = 1;
/// Entity flag set while standing on the floor
pub const FLAG_ON_GROUND: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub on_ground: bool,
    /// Movement keys from the latest input
    input: UserCommand,
}

impl Player {
    fn spawn(slot: usize) -> Self {
        Self {
            x: 100.0 + (slot as f32 * 60.0) % (WORLD_WIDTH - 200.0),
            y: FLOOR_Y - PLAYER_SIZE,
            vel_x: 0.0,
            vel_y: 0.0,
            on_ground: true,
            input: UserCommand::default(),
        }
    }

    fn center(&self) -> (f32, f32) {
        (self.x + PLAYER_SIZE / 2.0, self.y + PLAYER_SIZE / 2.0)
    }

    fn overlaps(&self, other: &Player) -> bool {
        self.x < other.x + PLAYER_SIZE
            && self.x + PLAYER_SIZE > other.x
            && self.y < other.y + PLAYER_SIZE
            && self.y + PLAYER_SIZE > other.y
    }

    fn to_entity(&self, slot: usize) -> EntityState {
        let mut state = EntityState::new(slot as u32 + 1);
        state.origin = [quantize(self.x), quantize(self.y), 0];
        state.velocity = [quantize(self.vel_x), quantize(self.vel_y), 0];
        state.model_index = PLAYER_MODEL;
        if self.on_ground {
            state.flags |= FLAG_ON_GROUND;
        }
        state
    }
}

fn quantize(value: f32) -> i32 {
    (value * ORIGIN_SCALE).round() as i32
}

/// Authoritative world state, one player per joined slot
#[derive(Debug, Default)]
pub struct GameState {
    pub players: BTreeMap<usize, Player>,
    last_frame_time: u64,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_physics(&mut self, dt: f32) {
        for player in self.players.values_mut() {
            player.vel_x = 0.0;
            if player.input.left {
                player.vel_x -= PLAYER_SPEED;
            }
            if player.input.right {
                player.vel_x += PLAYER_SPEED;
            }
            if player.input.jump && player.on_ground {
                player.vel_y = JUMP_VELOCITY;
                player.on_ground = false;
            }

            if !player.on_ground {
                player.vel_y += GRAVITY * dt;
            }

            player.x += player.vel_x * dt;
            player.y += player.vel_y * dt;
            player.x = player.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);

            if player.y + PLAYER_SIZE >= FLOOR_Y {
                player.y = FLOOR_Y - PLAYER_SIZE;
                player.vel_y = 0.0;
                player.on_ground = true;
            }
            if player.y <= 0.0 {
                player.y = 0.0;
                player.vel_y = 0.0;
            }
        }

        self.handle_collisions();
    }

    /// Pushes overlapping players apart along the line between their centres
    fn handle_collisions(&mut self) {
        let slots: Vec<usize> = self.players.keys().copied().collect();

        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                let (Some(p1), Some(p2)) = (self.players.get(a), self.players.get(b)) else {
                    continue;
                };
                if !p1.overlaps(p2) {
                    continue;
                }

                let (cx1, cy1) = p1.center();
                let (cx2, cy2) = p2.center();
                let (dx, dy) = (cx2 - cx1, cy2 - cy1);
                let distance = (dx * dx + dy * dy).sqrt();

                let (push_x, push_y) = if distance < 0.001 {
                    (PLAYER_SIZE / 2.0, 0.0)
                } else {
                    let separation = (PLAYER_SIZE - distance).max(0.0) / 2.0;
                    (dx / distance * separation, dy / distance * separation)
                };

                if let Some(p1) = self.players.get_mut(a) {
                    p1.x = (p1.x - push_x).clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);
                    p1.y = (p1.y - push_y).min(FLOOR_Y - PLAYER_SIZE);
                }
                if let Some(p2) = self.players.get_mut(b) {
                    p2.x = (p2.x + push_x).clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);
                    p2.y = (p2.y + push_y).min(FLOOR_Y - PLAYER_SIZE);
                }
            }
        }
    }
}

impl Simulation for GameState {
    fn client_connect(&mut self, slot: usize, first_time: bool, _is_bot: bool) -> Option<String> {
        let player = Player::spawn(slot);
        info!(
            "Player {} {} at ({}, {})",
            slot,
            if first_time { "joined" } else { "respawned" },
            player.x,
            player.y
        );
        self.players.insert(slot, player);
        None
    }

    fn run_frame(&mut self, server_time: u64) {
        let dt = server_time.saturating_sub(self.last_frame_time) as f32 / 1000.0;
        self.last_frame_time = server_time;
        if dt > 0.0 {
            self.update_physics(dt);
        }
    }

    fn client_disconnect(&mut self, slot: usize) {
        if self.players.remove(&slot).is_some() {
            info!("Removed player {}", slot);
        }
    }

    fn client_command(&mut self, slot: usize, command: &str) {
        match command.split_whitespace().next() {
            Some("kill") => {
                if self.players.contains_key(&slot) {
                    self.players.insert(slot, Player::spawn(slot));
                }
            }
            _ => debug!("Player {}: ignoring command '{}'", slot, command),
        }
    }

    fn client_input(&mut self, slot: usize, input: &UserCommand) {
        if let Some(player) = self.players.get_mut(&slot) {
            if input.sequence >= player.input.sequence {
                player.input = *input;
            }
        }
    }

    fn entities(&self) -> Vec<EntityState> {
        self.players
            .iter()
            .map(|(slot, player)| player.to_entity(*slot))
            .collect()
    }
}
