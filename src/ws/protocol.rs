//! WebSocket protocol message definitions
//! These are the wire types for client-server communication. Every packet
//! travels as one binary WebSocket frame holding a bincode-encoded `GamePacket`.

use bincode::Options;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::Uid;

/// Upper bound for any encoded packet
pub const MAX_PACKET_BYTES: u64 = 1024 * 1024;

/// Inbound frames larger than this are dropped before decoding
pub const MAX_INBOUND_FRAME_BYTES: usize = 4096;

/// Tagged packet union shared by both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GamePacket {
    /// Client -> server: one input command
    Input(InputPacket),
    /// Client -> server: join request (display name)
    Join(JoinRequest),
    /// Server -> client: world snapshot
    Snapshot(SnapshotPacket),
    /// Server -> client: discrete game event
    Event(EventPacket),
}

/// Player input for a single tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPacket {
    /// Tick the client wants this input applied at
    pub target_tick: Option<u64>,
    /// Client estimate of the room clock in ms (used when `target_tick` is absent)
    pub timestamp: u64,
    /// Movement axis input, each component in -1.0..=1.0
    pub movement: Option<MoveDelta>,
    /// Charge button state change
    pub charge: Option<ChargeToggle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveDelta {
    pub dx: f32,
    pub dy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeToggle {
    /// True while the charge button is held
    pub is_charging: bool,
    /// Facing index (0 = +x, 1 = +y, 2 = -x, 3 = -y)
    pub facing: i32,
}

/// Join request sent after the socket opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub username: String,
}

/// Game state snapshot (sent every tick)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPacket {
    /// Server wall clock in Unix ms
    pub server_time: u64,
    /// Server tick number
    pub tick: u64,
    pub players: Vec<PlayerSnapshot>,
    pub beams: Vec<BeamSnapshot>,
}

/// Player state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub uid: Uid,
    pub x: f32,
    pub y: f32,
    pub hp: i32,
    pub max_hp: i32,
    pub is_dead: bool,
    pub is_charging: bool,
    pub username: String,
}

/// Beam effect in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSnapshot {
    pub id: Uuid,
    pub owner_uid: Uid,
    pub start_x: f32,
    pub start_y: f32,
    pub end_x: f32,
    pub end_y: f32,
    pub width: f32,
    /// Visual lifetime left, may be zero but never negative
    pub remaining_ms: u32,
}

/// Discrete events pushed outside the snapshot stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    PlayerJoined,
    PlayerLeft,
    HostChanged,
    PlayerDeath,
    GameOver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    pub kind: EventKind,
    /// Subject of the event (winner for `GameOver`, `None` when nobody survived)
    pub target_uid: Option<Uid>,
    pub message: String,
}

impl EventPacket {
    pub fn new(kind: EventKind, target_uid: Option<Uid>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target_uid,
            message: message.into(),
        }
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_BYTES)
        .reject_trailing_bytes()
}

impl GamePacket {
    /// Serialize to the binary frame payload
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        codec().serialize(self).map_err(ProtocolError::Encode)
    }

    /// Parse a binary frame payload
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        codec().deserialize(bytes).map_err(ProtocolError::Decode)
    }
}

/// Wire format errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode packet: {0}")]
    Encode(bincode::Error),

    #[error("Failed to decode packet: {0}")]
    Decode(bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_the_wire() {
        let packet = GamePacket::Snapshot(SnapshotPacket {
            server_time: 1_700_000_000_000,
            tick: 42,
            players: vec![PlayerSnapshot {
                uid: 7,
                x: 120.5,
                y: 900.0,
                hp: 80,
                max_hp: 100,
                is_dead: false,
                is_charging: true,
                username: "nova".to_string(),
            }],
            beams: vec![BeamSnapshot {
                id: Uuid::new_v4(),
                owner_uid: 7,
                start_x: 120.5,
                start_y: 900.0,
                end_x: 920.5,
                end_y: 900.0,
                width: 25.0,
                remaining_ms: 280,
            }],
        });

        let bytes = packet.encode().unwrap();
        let parsed = GamePacket::decode(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn input_without_target_tick_decodes() {
        let packet = GamePacket::Input(InputPacket {
            target_tick: None,
            timestamp: 3_125,
            movement: Some(MoveDelta { dx: 1.0, dy: -1.0 }),
            charge: None,
        });

        let parsed = GamePacket::decode(&packet.encode().unwrap()).unwrap();
        match parsed {
            GamePacket::Input(input) => {
                assert_eq!(input.target_tick, None);
                assert_eq!(input.timestamp, 3_125);
                assert_eq!(input.movement, Some(MoveDelta { dx: 1.0, dy: -1.0 }));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(GamePacket::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
        assert!(GamePacket::decode(&[]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = GamePacket::Join(JoinRequest {
            username: "ava".to_string(),
        })
        .encode()
        .unwrap();
        bytes.push(0);
        assert!(GamePacket::decode(&bytes).is_err());
    }
}
