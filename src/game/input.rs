//! Input buffering and lag-compensated application

use crate::util::time::{millis_to_tick, tick_delta};
use crate::ws::protocol::{ChargeToggle, InputPacket, MoveDelta};

use super::combat::{BeamShot, Facing};
use super::player::Player;

/// Inputs are applied this many ticks behind the room clock
pub const DELAY_COMPENSATION_TICKS: i64 = 2;

/// Max distance (in ticks) between an input's target and the execution tick
pub const ACCEPTABLE_LAG_TICKS: i64 = 2;

/// One buffered client action, immutable once enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct InputCommand {
    pub target_tick: Option<u64>,
    pub timestamp: u64,
    pub movement: Option<MoveDelta>,
    pub charge: Option<ChargeToggle>,
}

impl From<InputPacket> for InputCommand {
    fn from(packet: InputPacket) -> Self {
        Self {
            target_tick: packet.target_tick,
            timestamp: packet.timestamp,
            movement: packet.movement,
            charge: packet.charge,
        }
    }
}

impl InputCommand {
    /// Explicit target tick, or the tick the timestamp falls into
    pub fn resolved_tick(&self) -> u64 {
        self.target_tick.unwrap_or_else(|| millis_to_tick(self.timestamp))
    }
}

/// Tick at which buffered input is applied for the given room tick
pub fn execution_tick(current_tick: u64) -> i64 {
    current_tick as i64 - DELAY_COMPENSATION_TICKS
}

/// Targets that do not fit in an `i64` are never inside the window
pub fn within_window(target_tick: u64, execution_tick: i64) -> bool {
    let Ok(target) = i64::try_from(target_tick) else {
        return false;
    };
    target
        .checked_sub(execution_tick)
        .is_some_and(|diff| (-ACCEPTABLE_LAG_TICKS..=ACCEPTABLE_LAG_TICKS).contains(&diff))
}

/// Clean up one movement axis: non-finite becomes 0, the rest is clamped
fn axis(value: f32) -> f64 {
    if value.is_finite() {
        (value as f64).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Drain the player's buffer and apply everything inside the lag window.
///
/// Survivors are stably sorted by target tick, so inputs aimed at the same
/// tick keep their arrival order. Returns the beams released this tick, each
/// capturing the owner's position at the moment of release.
pub fn process_player_inputs(
    player: &mut Player,
    execution_tick: i64,
    now_ms: u64,
    map_size: f64,
) -> Vec<BeamShot> {
    let mut valid: Vec<(u64, InputCommand)> = player
        .pending
        .drain(..)
        .map(|cmd| (cmd.resolved_tick(), cmd))
        .filter(|(target, _)| within_window(*target, execution_tick))
        .collect();
    valid.sort_by_key(|(target, _)| *target);

    let mut shots = Vec::new();
    let step = player.speed * tick_delta();

    for (target, cmd) in &valid {
        if let Some(delta) = cmd.movement {
            if !player.is_dead {
                player.x = (player.x + axis(delta.dx) * step).clamp(0.0, map_size);
                player.y = (player.y + axis(delta.dy) * step).clamp(0.0, map_size);
            }
        }

        if let Some(toggle) = cmd.charge {
            if let Some(shot) = apply_charge(player, toggle, now_ms) {
                shots.push(shot);
            }
        }

        player.last_processed_tick = *target;
    }

    shots
}

fn apply_charge(player: &mut Player, toggle: ChargeToggle, now_ms: u64) -> Option<BeamShot> {
    let facing = Facing::from_index(toggle.facing);

    if player.is_dead {
        player.charge.facing = facing;
        return None;
    }

    if toggle.is_charging {
        if !player.charge.charging {
            player.charge.charging = true;
            player.charge.started_at_ms = now_ms;
            player.charge.facing = facing;
        }
        return None;
    }

    if !player.charge.charging {
        return None;
    }

    player.charge.charging = false;
    Some(BeamShot {
        owner: player.uid,
        x: player.x,
        y: player.y,
        facing: player.charge.facing,
        charge_ms: now_ms.saturating_sub(player.charge.started_at_ms),
    })
}
