//! Authoritative per-client state

use super::combat::Facing;
use super::input::InputCommand;
use super::Uid;
use crate::ws::connection::Outbound;

/// Starting and maximum health
pub const DEFAULT_MAX_HP: i32 = 100;

/// Name used until the client sends a join request
pub const DEFAULT_PLAYER_NAME: &str = "Player";

/// Display names are cut to this many characters
pub const MAX_NAME_CHARS: usize = 24;

/// Charge-and-release attack state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChargeState {
    pub charging: bool,
    /// Server time (Unix ms) of the rising edge
    pub started_at_ms: u64,
    pub facing: Facing,
}

/// Player state in a room (authoritative)
#[derive(Debug)]
pub struct Player {
    pub uid: Uid,
    pub name: String,

    // Position and movement
    pub x: f64,
    pub y: f64,
    pub speed: f64,

    // Combat
    pub hp: i32,
    pub max_hp: i32,
    pub is_dead: bool,
    pub charge: ChargeState,

    // Input tracking
    pub pending: Vec<InputCommand>,
    pub last_processed_tick: u64,

    /// Outgoing packet queue of this player's connection
    pub outbound: Outbound,
}

impl Player {
    pub fn new(uid: Uid, name: String, speed: f64, outbound: Outbound) -> Self {
        Self {
            uid,
            name,
            x: 0.0,
            y: 0.0,
            speed,
            hp: DEFAULT_MAX_HP,
            max_hp: DEFAULT_MAX_HP,
            is_dead: false,
            charge: ChargeState::default(),
            pending: Vec::new(),
            last_processed_tick: 0,
            outbound,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead
    }

    /// Subtract damage, clamping at zero. Returns true only on the hit that
    /// moves the player from alive to dead.
    pub fn apply_damage(&mut self, damage: i32) -> bool {
        if self.is_dead {
            return false;
        }

        self.hp = (self.hp - damage.max(0)).clamp(0, self.max_hp);
        if self.hp == 0 {
            self.is_dead = true;
            self.charge.charging = false;
            return true;
        }
        false
    }
}

/// Trim and shorten a client-supplied display name. Returns None when
/// nothing printable is left.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_CHARS)
        .collect();
    (!name.is_empty()).then_some(name)
}
