//! Snapshot building and fan-out

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::warn;

use crate::ws::protocol::{BeamSnapshot, EventPacket, GamePacket, PlayerSnapshot, SnapshotPacket};

use super::combat::Beam;
use super::player::Player;
use super::Uid;

/// Per-recipient view of a snapshot.
///
/// Returning `None` means the recipient gets the shared payload that was
/// encoded once for everyone.
pub trait Visibility: Send + Sync {
    fn filter(&self, recipient: &Player, snapshot: &SnapshotPacket) -> Option<SnapshotPacket>;
}

/// Everybody sees everything
#[derive(Debug, Default, Clone, Copy)]
pub struct FullVisibility;

impl Visibility for FullVisibility {
    fn filter(&self, _recipient: &Player, _snapshot: &SnapshotPacket) -> Option<SnapshotPacket> {
        None
    }
}

/// Builds snapshots for network transmission
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Immutable view of the room at `tick`
    pub fn build(
        tick: u64,
        now_ms: u64,
        players: &BTreeMap<Uid, Player>,
        beams: &[Beam],
    ) -> SnapshotPacket {
        let players = players
            .values()
            .map(|p| PlayerSnapshot {
                uid: p.uid,
                x: p.x as f32,
                y: p.y as f32,
                hp: p.hp,
                max_hp: p.max_hp,
                is_dead: p.is_dead,
                is_charging: p.charge.charging,
                username: p.name.clone(),
            })
            .collect();

        let beams = beams
            .iter()
            .map(|b| BeamSnapshot {
                id: b.id,
                owner_uid: b.owner,
                start_x: b.start_x as f32,
                start_y: b.start_y as f32,
                end_x: b.end_x as f32,
                end_y: b.end_y as f32,
                width: b.width as f32,
                remaining_ms: b.remaining_ms(now_ms),
            })
            .collect();

        SnapshotPacket {
            server_time: now_ms,
            tick,
            players,
            beams,
        }
    }
}

/// Encodes each packet once and hands the shared bytes to every player
pub struct Broadcaster {
    visibility: Box<dyn Visibility>,
}

impl Broadcaster {
    pub fn new(visibility: Box<dyn Visibility>) -> Self {
        Self { visibility }
    }

    /// Send this tick's snapshot. Returns the shared payload size in bytes,
    /// or `None` when the snapshot could not be encoded.
    pub fn broadcast_snapshot(
        &self,
        snapshot: SnapshotPacket,
        players: &BTreeMap<Uid, Player>,
    ) -> Option<usize> {
        let packet = GamePacket::Snapshot(snapshot);
        let shared = match packet.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to encode snapshot");
                return None;
            }
        };
        let GamePacket::Snapshot(snapshot) = &packet else {
            return None;
        };

        for player in players.values() {
            match self.visibility.filter(player, snapshot) {
                Some(view) => {
                    player.outbound.send(&GamePacket::Snapshot(view));
                }
                None => {
                    player.outbound.send_bytes(shared.clone());
                }
            }
        }

        Some(shared.len())
    }

    /// Send one event to every player in the room
    pub fn broadcast_event(&self, event: EventPacket, players: &BTreeMap<Uid, Player>) {
        let shared = match GamePacket::Event(event).encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to encode event");
                return;
            }
        };

        for player in players.values() {
            player.outbound.send_bytes(shared.clone());
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(Box::new(FullVisibility))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::{BeamShot, BeamStats, Facing};
    use crate::ws::connection::Outbound;
    use crate::ws::protocol::EventKind;
    use tokio::sync::mpsc;

    fn room_with(uids: &[Uid]) -> (BTreeMap<Uid, Player>, Vec<mpsc::Receiver<Bytes>>) {
        let mut players = BTreeMap::new();
        let mut receivers = Vec::new();
        for &uid in uids {
            let (outbound, rx) = Outbound::channel(uid, 8);
            let mut p = Player::new(uid, format!("p{uid}"), 10.0, outbound);
            p.x = uid as f64 * 100.0;
            p.y = 50.0;
            players.insert(uid, p);
            receivers.push(rx);
        }
        (players, receivers)
    }

    fn beam() -> Beam {
        let shot = BeamShot {
            owner: 1,
            x: 100.0,
            y: 50.0,
            facing: Facing::from_index(0),
            charge_ms: 100,
        };
        Beam::from_shot(&shot, &BeamStats::for_charge(100), 1_000)
    }

    #[test]
    fn snapshot_round_trip_keeps_tick_and_counts() {
        let (players, _rx) = room_with(&[1, 2, 3]);
        let snapshot = SnapshotBuilder::build(77, 1_100, &players, &[beam()]);

        let bytes = GamePacket::Snapshot(snapshot).encode().unwrap();
        let GamePacket::Snapshot(parsed) = GamePacket::decode(&bytes).unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(parsed.tick, 77);
        assert_eq!(parsed.server_time, 1_100);
        assert_eq!(parsed.players.len(), 3);
        assert_eq!(parsed.beams.len(), 1);
        assert_eq!(parsed.beams[0].remaining_ms, 200);
        assert_eq!(parsed.players[1].username, "p2");
    }

    #[tokio::test]
    async fn every_player_receives_identical_bytes() {
        let (players, mut receivers) = room_with(&[1, 2]);
        let broadcaster = Broadcaster::default();
        let snapshot = SnapshotBuilder::build(3, 0, &players, &[]);

        let size = broadcaster.broadcast_snapshot(snapshot, &players).unwrap();
        let a = receivers[0].recv().await.unwrap();
        let b = receivers[1].recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), size);
    }

    struct HideOthers;

    impl Visibility for HideOthers {
        fn filter(&self, recipient: &Player, snapshot: &SnapshotPacket) -> Option<SnapshotPacket> {
            let mut own = snapshot.clone();
            own.players.retain(|p| p.uid == recipient.uid);
            Some(own)
        }
    }

    #[tokio::test]
    async fn visibility_can_tailor_a_recipient_view() {
        let (players, mut receivers) = room_with(&[1, 2]);
        let broadcaster = Broadcaster::new(Box::new(HideOthers));
        let snapshot = SnapshotBuilder::build(3, 0, &players, &[]);
        broadcaster.broadcast_snapshot(snapshot, &players);

        let bytes = receivers[1].recv().await.unwrap();
        let GamePacket::Snapshot(view) = GamePacket::decode(&bytes).unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(view.players.len(), 1);
        assert_eq!(view.players[0].uid, 2);
    }

    #[tokio::test]
    async fn events_reach_everyone() {
        let (players, mut receivers) = room_with(&[4, 9]);
        let broadcaster = Broadcaster::default();
        broadcaster.broadcast_event(
            EventPacket::new(EventKind::PlayerDeath, Some(9), "wasted"),
            &players,
        );

        for rx in receivers.iter_mut() {
            let bytes = rx.recv().await.unwrap();
            match GamePacket::decode(&bytes).unwrap() {
                GamePacket::Event(event) => {
                    assert_eq!(event.kind, EventKind::PlayerDeath);
                    assert_eq!(event.target_uid, Some(9));
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }
    }
}
