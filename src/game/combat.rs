//! Combat system - beam charge scaling, geometry, hit detection

use std::collections::BTreeMap;

use uuid::Uuid;

use super::player::Player;
use super::Uid;

/// Beam reach from the owner's position
pub const BEAM_LENGTH: f64 = 800.0;
/// Visual lifetime of a beam, independent of its gameplay effect
pub const BEAM_LIFETIME_MS: u64 = 300;
/// Player hitbox radius
pub const PLAYER_RADIUS: f64 = 20.0;

pub const MIN_DAMAGE: i32 = 5;
pub const MAX_DAMAGE: i32 = 50;
pub const BASE_BEAM_WIDTH: f64 = 20.0;

/// One of the four cardinal directions a beam can be fired in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Facing(u8);

impl Facing {
    const DIRECTIONS: [(f64, f64); 4] = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];

    /// Client facing index, wrapped into 0..4
    pub fn from_index(index: i32) -> Self {
        Self(index.rem_euclid(4) as u8)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Unit vector for this facing
    pub fn direction(self) -> (f64, f64) {
        Self::DIRECTIONS[self.0 as usize]
    }
}

/// Beam stats derived from how long the attack was charged
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamStats {
    pub damage: i32,
    pub width: f64,
    pub length: f64,
    pub lifetime_ms: u64,
}

impl BeamStats {
    pub fn for_charge(duration_ms: u64) -> Self {
        Self {
            damage: CombatSystem::charge_damage(duration_ms),
            width: CombatSystem::beam_width(duration_ms),
            length: BEAM_LENGTH,
            lifetime_ms: BEAM_LIFETIME_MS,
        }
    }
}

/// A completed charge release, captured when the button went up
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamShot {
    pub owner: Uid,
    pub x: f64,
    pub y: f64,
    pub facing: Facing,
    pub charge_ms: u64,
}

/// Active beam effect in the room
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    pub id: Uuid,
    pub owner: Uid,
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    pub width: f64,
    /// Absolute expiry, Unix ms
    pub expires_at_ms: u64,
}

impl Beam {
    /// Lay out the beam for a shot fired at `now_ms`
    pub fn from_shot(shot: &BeamShot, stats: &BeamStats, now_ms: u64) -> Self {
        let (dx, dy) = shot.facing.direction();
        Self {
            id: Uuid::new_v4(),
            owner: shot.owner,
            start_x: shot.x,
            start_y: shot.y,
            end_x: shot.x + stats.length * dx,
            end_y: shot.y + stats.length * dy,
            width: stats.width,
            expires_at_ms: now_ms + stats.lifetime_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u32 {
        self.expires_at_ms.saturating_sub(now_ms).min(u32::MAX as u64) as u32
    }

    /// Check collision with a circular target
    pub fn hits(&self, target_x: f64, target_y: f64, target_radius: f64) -> bool {
        CombatSystem::is_hit(
            (self.start_x, self.start_y),
            (self.end_x, self.end_y),
            self.width,
            (target_x, target_y),
            target_radius,
        )
    }
}

/// Hit result from combat resolution
#[derive(Debug, Clone, PartialEq)]
pub struct HitResult {
    pub shooter_id: Uid,
    pub target_id: Uid,
    pub damage: i32,
    pub target_killed: bool,
}

/// Combat system for charge scaling and damage
pub struct CombatSystem;

impl CombatSystem {
    /// 10 ms of charge per point of damage, clamped to 5..=50
    pub fn charge_damage(duration_ms: u64) -> i32 {
        let raw = (duration_ms / 10).min(MAX_DAMAGE as u64) as i32;
        raw.clamp(MIN_DAMAGE, MAX_DAMAGE)
    }

    /// Beam width grows by one unit per 20 ms of charge
    pub fn beam_width(duration_ms: u64) -> f64 {
        BASE_BEAM_WIDTH + duration_ms as f64 / 20.0
    }

    /// Circle vs. thick segment test.
    ///
    /// The beam is a rectangle of the given width around the segment
    /// `start..end`. The point is projected into the beam's own frame, clamped
    /// onto the rectangle, and the target hits when that closest point lies
    /// within `radius`. For axis-aligned beams this is the classic AABB
    /// closest-point test; diagonal beams use the same rule rotated.
    pub fn is_hit(
        start: (f64, f64),
        end: (f64, f64),
        width: f64,
        point: (f64, f64),
        radius: f64,
    ) -> bool {
        let half = width / 2.0;
        let (seg_x, seg_y) = (end.0 - start.0, end.1 - start.1);
        let len = (seg_x * seg_x + seg_y * seg_y).sqrt();
        let (rel_x, rel_y) = (point.0 - start.0, point.1 - start.1);

        // Zero-length beam degrades to a disc of diameter `width`
        if len < 1e-6 {
            let reach = half + radius;
            return rel_x * rel_x + rel_y * rel_y <= reach * reach;
        }

        let (ux, uy) = (seg_x / len, seg_y / len);
        let along = rel_x * ux + rel_y * uy;
        let across = rel_y * ux - rel_x * uy;

        let off_along = along - along.clamp(0.0, len);
        let off_across = across - across.clamp(-half, half);
        off_along * off_along + off_across * off_across <= radius * radius
    }

    /// Fire a beam and apply its damage to every other living player.
    /// Returns the beam effect and one entry per player hit.
    pub fn resolve_shot(
        shot: &BeamShot,
        now_ms: u64,
        players: &mut BTreeMap<Uid, Player>,
    ) -> (Beam, Vec<HitResult>) {
        let stats = BeamStats::for_charge(shot.charge_ms);
        let beam = Beam::from_shot(shot, &stats, now_ms);

        let mut hits = Vec::new();
        for target in players.values_mut() {
            if target.uid == shot.owner || target.is_dead {
                continue;
            }

            if beam.hits(target.x, target.y, PLAYER_RADIUS) {
                let killed = target.apply_damage(stats.damage);
                hits.push(HitResult {
                    shooter_id: shot.owner,
                    target_id: target.uid,
                    damage: stats.damage,
                    target_killed: killed,
                });
            }
        }

        (beam, hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::Outbound;

    fn player_at(uid: Uid, x: f64, y: f64) -> Player {
        let (outbound, _rx) = Outbound::channel(uid, 4);
        let mut p = Player::new(uid, format!("p{uid}"), 10.0, outbound);
        p.x = x;
        p.y = y;
        p
    }

    #[test]
    fn damage_scales_with_charge() {
        assert_eq!(CombatSystem::charge_damage(0), 5);
        assert_eq!(CombatSystem::charge_damage(49), 5);
        assert_eq!(CombatSystem::charge_damage(100), 10);
        assert_eq!(CombatSystem::charge_damage(250), 25);
        assert_eq!(CombatSystem::charge_damage(500), 50);
        assert_eq!(CombatSystem::charge_damage(60_000), 50);
        assert_eq!(CombatSystem::charge_damage(u64::MAX), 50);
    }

    #[test]
    fn width_scales_with_charge() {
        assert_eq!(CombatSystem::beam_width(0), 20.0);
        assert_eq!(CombatSystem::beam_width(100), 25.0);
    }

    #[test]
    fn facing_wraps_around() {
        assert_eq!(Facing::from_index(4), Facing::from_index(0));
        assert_eq!(Facing::from_index(-1), Facing::from_index(3));
        assert_eq!(Facing::from_index(1).direction(), (0.0, 1.0));
    }

    #[test]
    fn horizontal_beam_hits_inside_and_near_the_edge() {
        // Beam from (0,0) to (800,0), width 20 => covers y in [-10, 10]
        let hit = |x, y| CombatSystem::is_hit((0.0, 0.0), (800.0, 0.0), 20.0, (x, y), 20.0);
        assert!(hit(400.0, 0.0));
        assert!(hit(400.0, 30.0));
        assert!(!hit(400.0, 30.1));
        assert!(hit(-20.0, 0.0));
        assert!(!hit(-20.1, 0.0));
        assert!(!hit(900.0, 0.0));
    }

    #[test]
    fn vertical_beam_pointing_down_hits() {
        let hit = |x, y| CombatSystem::is_hit((100.0, 900.0), (100.0, 100.0), 30.0, (x, y), 20.0);
        assert!(hit(100.0, 500.0));
        assert!(hit(134.0, 500.0));
        assert!(!hit(136.0, 500.0));
    }

    #[test]
    fn diagonal_beam_is_tested_geometrically() {
        let start = (0.0, 0.0);
        let end = (100.0, 100.0);
        assert!(CombatSystem::is_hit(start, end, 10.0, (50.0, 50.0), 1.0));
        assert!(!CombatSystem::is_hit(start, end, 10.0, (100.0, 0.0), 1.0));
    }

    #[test]
    fn degenerate_beam_acts_like_a_disc() {
        assert!(CombatSystem::is_hit((10.0, 10.0), (10.0, 10.0), 20.0, (35.0, 10.0), 20.0));
        assert!(!CombatSystem::is_hit((10.0, 10.0), (10.0, 10.0), 20.0, (45.0, 10.0), 20.0));
    }

    #[test]
    fn shot_damages_targets_in_line_but_not_owner_or_dead() {
        let mut players = BTreeMap::new();
        players.insert(1, player_at(1, 100.0, 100.0));
        players.insert(2, player_at(2, 500.0, 100.0));
        players.insert(3, player_at(3, 500.0, 500.0));
        let mut corpse = player_at(4, 300.0, 100.0);
        corpse.hp = 0;
        corpse.is_dead = true;
        players.insert(4, corpse);

        let shot = BeamShot {
            owner: 1,
            x: 100.0,
            y: 100.0,
            facing: Facing::from_index(0),
            charge_ms: 200,
        };
        let (beam, hits) = CombatSystem::resolve_shot(&shot, 1_000, &mut players);

        assert_eq!(beam.end_x, 900.0);
        assert_eq!(beam.end_y, 100.0);
        assert_eq!(beam.expires_at_ms, 1_300);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target_id, 2);
        assert_eq!(hits[0].damage, 20);
        assert_eq!(players[&2].hp, 80);
        assert_eq!(players[&1].hp, 100);
        assert_eq!(players[&3].hp, 100);
        assert_eq!(players[&4].hp, 0);
    }

    #[test]
    fn beam_expiry_is_inclusive() {
        let shot = BeamShot {
            owner: 1,
            x: 0.0,
            y: 0.0,
            facing: Facing::default(),
            charge_ms: 0,
        };
        let beam = Beam::from_shot(&shot, &BeamStats::for_charge(0), 1_000);
        assert!(!beam.is_expired(1_299));
        assert!(beam.is_expired(1_300));
        assert_eq!(beam.remaining_ms(1_100), 200);
        assert_eq!(beam.remaining_ms(5_000), 0);
    }
}
