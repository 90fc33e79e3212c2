//! Per-client duplex transport
//!
//! The room never touches a socket. It holds an [`Outbound`] per player and
//! pushes pre-encoded frames into it; a single writer task owns the sink and
//! drains that queue, so each socket has exactly one writer. The read side
//! decodes frames and forwards them to the room as commands.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::game::input::InputCommand;
use crate::game::room::{RoomError, RoomHandle};
use crate::game::Uid;
use crate::util::rate_limit::ConnectionRateLimiter;

use super::protocol::{GamePacket, MAX_INBOUND_FRAME_BYTES};

/// Identifies one socket, so a stale connection cannot unregister a newer one
/// that reused the same UID
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport deadlines and queue sizing
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Connection is dropped when nothing arrives for this long
    pub read_deadline: Duration,
    /// A single frame write must finish within this
    pub write_deadline: Duration,
    /// Keepalive ping period, shorter than the client's read deadline
    pub ping_period: Duration,
    /// Frames queued for the writer before new ones are dropped
    pub outbound_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            ping_period: Duration::from_secs(30),
            outbound_capacity: 256,
        }
    }
}

/// Sending half of a connection, owned by the room's player entry
#[derive(Debug, Clone)]
pub struct Outbound {
    uid: Uid,
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    /// Create a fresh outbound queue and the receiver its writer drains
    pub fn channel(uid: Uid, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { uid, id, tx }, rx)
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Encode and enqueue a packet. Packets that fail to encode are dropped.
    pub fn send(&self, packet: &GamePacket) -> bool {
        match packet.encode() {
            Ok(bytes) => self.send_bytes(Bytes::from(bytes)),
            Err(e) => {
                warn!(uid = self.uid, error = %e, "Dropping packet that failed to encode");
                false
            }
        }
    }

    /// Enqueue an already encoded frame without blocking the caller.
    /// A full queue drops the frame; the next snapshot supersedes it.
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(uid = self.uid, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writer side failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Write deadline exceeded")]
    WriteTimeout,

    #[error("Socket send failed: {0}")]
    Send(String),
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a close frame
    ClientClosed,
    /// Socket stream ended without a close frame
    StreamEnded,
    /// Nothing received within the read deadline
    ReadTimeout,
    /// Socket reported an error while reading
    ReadFailed,
    /// Writer could not deliver a frame in time
    WriteFailed,
    /// The room stopped or dropped this player
    RoomClosed,
}

/// Owns the sink: drains the outbound queue and sends keepalive pings.
/// Returns `Ok` once every sender is gone (player removed or room stopped).
pub async fn run_writer<S>(
    uid: Uid,
    mut sink: S,
    mut rx: mpsc::Receiver<Bytes>,
    settings: TransportSettings,
) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            frame = rx.recv() => match frame {
                Some(bytes) => Message::Binary(bytes.to_vec()),
                None => {
                    let _ = timeout(settings.write_deadline, sink.close()).await;
                    debug!(uid, "Outbound queue closed, writer exiting");
                    return Ok(());
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(settings.write_deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Send(e.to_string())),
            Err(_) => return Err(TransportError::WriteTimeout),
        }
    }
}

/// Reads frames until the socket ends, the read deadline passes, or the room
/// goes away. Every received frame, pongs included, refreshes the deadline.
pub async fn run_reader<St, E>(
    uid: Uid,
    mut stream: St,
    room: &RoomHandle,
    limiter: &ConnectionRateLimiter,
    read_deadline: Duration,
) -> DisconnectReason
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let message = match timeout(read_deadline, stream.next()).await {
            Err(_) => return DisconnectReason::ReadTimeout,
            Ok(None) => return DisconnectReason::StreamEnded,
            Ok(Some(Err(e))) => {
                debug!(uid, error = %e, "WebSocket read error");
                return DisconnectReason::ReadFailed;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => {
                if !limiter.check_frame() {
                    warn!(uid, "Rate limited inbound frame");
                    continue;
                }
                if data.len() > MAX_INBOUND_FRAME_BYTES {
                    debug!(uid, len = data.len(), "Oversized frame dropped");
                    continue;
                }

                match GamePacket::decode(&data) {
                    Ok(packet) => {
                        if forward_packet(room, uid, packet).await.is_err() {
                            return DisconnectReason::RoomClosed;
                        }
                    }
                    Err(e) => {
                        debug!(uid, error = %e, "Malformed packet dropped");
                    }
                }
            }
            Message::Text(_) => {
                debug!(uid, "Text frame ignored");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return DisconnectReason::ClientClosed,
        }
    }
}

/// Route a decoded client packet to the room
pub async fn forward_packet(
    room: &RoomHandle,
    uid: Uid,
    packet: GamePacket,
) -> Result<(), RoomError> {
    match packet {
        GamePacket::Input(input) => room.submit_input(uid, InputCommand::from(input)).await,
        GamePacket::Join(join) => room.rename(uid, join.username).await,
        GamePacket::Snapshot(_) | GamePacket::Event(_) => {
            debug!(uid, "Ignoring server-only packet from client");
            Ok(())
        }
    }
}

/// Drive both halves of an already registered connection until either side
/// ends, then unregister the player from the room.
pub async fn serve<S, St, E>(
    outbound_id: ConnectionId,
    uid: Uid,
    sink: S,
    stream: St,
    rx: mpsc::Receiver<Bytes>,
    room: RoomHandle,
    settings: TransportSettings,
) -> DisconnectReason
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let limiter = ConnectionRateLimiter::new();
    let mut writer = tokio::spawn(run_writer(uid, sink, rx, settings.clone()));

    let reason = tokio::select! {
        reason = run_reader(uid, stream, &room, &limiter, settings.read_deadline) => reason,
        result = &mut writer => match result {
            Ok(Ok(())) => DisconnectReason::RoomClosed,
            Ok(Err(e)) => {
                debug!(uid, error = %e, "Writer failed");
                DisconnectReason::WriteFailed
            }
            Err(e) => {
                warn!(uid, error = %e, "Writer task aborted");
                DisconnectReason::WriteFailed
            }
        },
    };

    writer.abort();

    if room.disconnect(uid, outbound_id).await.is_err() {
        debug!(uid, room_id = %room.id(), "Room already gone at disconnect");
    }

    info!(uid, room_id = %room.id(), reason = ?reason, "Connection closed");
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::room::RoomCommand;
    use crate::ws::protocol::{InputPacket, JoinRequest, MoveDelta};
    use futures::channel::mpsc as fmpsc;
    use futures::stream;

    fn input_frame(tick: u64) -> Message {
        let packet = GamePacket::Input(InputPacket {
            target_tick: Some(tick),
            timestamp: 0,
            movement: Some(MoveDelta { dx: 1.0, dy: 0.0 }),
            charge: None,
        });
        Message::Binary(packet.encode().unwrap())
    }

    #[tokio::test]
    async fn outbound_drops_when_queue_is_full() {
        let (outbound, mut rx) = Outbound::channel(3, 1);
        assert!(outbound.send_bytes(Bytes::from_static(b"a")));
        assert!(!outbound.send_bytes(Bytes::from_static(b"b")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));

        drop(rx);
        assert!(outbound.is_closed());
        assert!(!outbound.send_bytes(Bytes::from_static(b"c")));
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _ra) = Outbound::channel(1, 1);
        let (b, _rb) = Outbound::channel(1, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.uid(), b.uid());
    }

    #[tokio::test]
    async fn writer_forwards_frames_and_exits_when_senders_drop() {
        let (outbound, rx) = Outbound::channel(1, 8);
        let (sink, mut written) = fmpsc::unbounded::<Message>();

        let writer = tokio::spawn(run_writer(1, sink, rx, TransportSettings::default()));
        let packet = GamePacket::Join(JoinRequest {
            username: "ava".to_string(),
        });
        assert!(outbound.send(&packet));
        drop(outbound);

        assert!(writer.await.unwrap().is_ok());
        match written.next().await {
            Some(Message::Binary(bytes)) => {
                assert_eq!(GamePacket::decode(&bytes).unwrap(), packet)
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_when_idle() {
        let (_outbound, rx) = Outbound::channel(1, 8);
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let settings = TransportSettings::default();

        let writer = tokio::spawn(run_writer(1, sink, rx, settings.clone()));
        tokio::time::sleep(settings.ping_period + Duration::from_millis(1)).await;

        assert!(matches!(written.next().await, Some(Message::Ping(_))));
        writer.abort();
    }

    #[tokio::test]
    async fn writer_reports_a_dead_sink() {
        let (outbound, rx) = Outbound::channel(1, 8);
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);

        outbound.send_bytes(Bytes::from_static(b"x"));
        let result = run_writer(1, sink, rx, TransportSettings::default()).await;
        assert!(matches!(result, Err(TransportError::Send(_))));
    }

    #[tokio::test]
    async fn reader_forwards_inputs_and_skips_garbage() {
        let (room, mut commands) = RoomHandle::detached("r1", 16);
        let frames = vec![
            Ok::<_, std::io::Error>(Message::Binary(vec![0xff, 0x00])),
            Ok(Message::Text("hello".to_string())),
            Ok(input_frame(7)),
            Ok(Message::Binary(
                GamePacket::Join(JoinRequest {
                    username: "nova".to_string(),
                })
                .encode()
                .unwrap(),
            )),
            Ok(Message::Close(None)),
            Ok(input_frame(8)),
        ];

        let reason = run_reader(
            5,
            stream::iter(frames),
            &room,
            &ConnectionRateLimiter::new(),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(reason, DisconnectReason::ClientClosed);

        match commands.try_recv().unwrap() {
            RoomCommand::Input { uid, command } => {
                assert_eq!(uid, 5);
                assert_eq!(command.target_tick, Some(7));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(
            commands.try_recv().unwrap(),
            RoomCommand::Rename { uid: 5, .. }
        ));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn reader_drops_oversized_frames() {
        let (room, mut commands) = RoomHandle::detached("r1", 16);
        let frames = vec![Ok::<_, std::io::Error>(Message::Binary(vec![
            0u8;
            MAX_INBOUND_FRAME_BYTES + 1
        ]))];

        let reason = run_reader(
            5,
            stream::iter(frames),
            &room,
            &ConnectionRateLimiter::new(),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(reason, DisconnectReason::StreamEnded);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_the_read_deadline() {
        let (room, _commands) = RoomHandle::detached("r1", 16);
        let reason = run_reader(
            5,
            stream::pending::<Result<Message, std::io::Error>>(),
            &room,
            &ConnectionRateLimiter::new(),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(reason, DisconnectReason::ReadTimeout);
    }

    #[tokio::test]
    async fn reader_stops_when_the_room_is_gone() {
        let (room, commands) = RoomHandle::detached("r1", 16);
        drop(commands);

        let reason = run_reader(
            5,
            stream::iter(vec![Ok::<_, std::io::Error>(input_frame(1))]),
            &room,
            &ConnectionRateLimiter::new(),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(reason, DisconnectReason::RoomClosed);
    }

    #[tokio::test]
    async fn serve_unregisters_on_exit() {
        let (room, mut commands) = RoomHandle::detached("r1", 16);
        let (outbound, rx) = Outbound::channel(9, 8);
        let (sink, _written) = fmpsc::unbounded::<Message>();

        let reason = serve(
            outbound.id(),
            9,
            sink,
            stream::iter(vec![Ok::<_, std::io::Error>(Message::Close(None))]),
            rx,
            room,
            TransportSettings::default(),
        )
        .await;
        assert_eq!(reason, DisconnectReason::ClientClosed);

        match commands.try_recv().unwrap() {
            RoomCommand::Leave { uid, connection } => {
                assert_eq!(uid, 9);
                assert_eq!(connection, Some(outbound.id()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
