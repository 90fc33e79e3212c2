//! Room state and authoritative tick loop
//!
//! Each room is a single task that owns its players and beams. Connection
//! tasks talk to it only through [`RoomHandle`], so every mutation for a tick
//! completes before that tick's snapshot goes out.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::GameConfig;
use crate::store::results::{MatchResult, ResultPublisher};
use crate::util::time::{unix_millis, TICK_DURATION};
use crate::ws::connection::{ConnectionId, Outbound};
use crate::ws::protocol::{EventKind, EventPacket};

use super::combat::{Beam, BeamShot, CombatSystem, PLAYER_RADIUS};
use super::input::{execution_tick, process_player_inputs, InputCommand};
use super::player::{sanitize_name, Player, DEFAULT_PLAYER_NAME};
use super::snapshot::{Broadcaster, FullVisibility, SnapshotBuilder, Visibility};
use super::Uid;

/// Room lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Created, loop not attached yet
    Idle,
    /// Loop active
    Running,
    /// Loop exiting
    Stopping,
    /// Directory entry gone
    Removed,
}

/// Per-room tuning
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub map_size: f64,
    pub player_speed: f64,
    /// Time between game over and teardown
    pub game_over_grace: Duration,
    /// Bound of the command channel
    pub command_capacity: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::from(&GameConfig::default())
    }
}

impl From<&GameConfig> for RoomSettings {
    fn from(game: &GameConfig) -> Self {
        Self {
            map_size: game.map_size,
            player_speed: game.player_speed,
            game_over_grace: game.game_over_grace,
            command_capacity: 256,
        }
    }
}

/// Collaborators a room talks to
pub struct RoomContext {
    pub publisher: ResultPublisher,
    pub visibility: Box<dyn Visibility>,
}

impl RoomContext {
    pub fn new(publisher: ResultPublisher) -> Self {
        Self {
            publisher,
            visibility: Box::new(FullVisibility),
        }
    }
}

/// Commands serviced by the room loop, one at a time in arrival order
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        uid: Uid,
        name: String,
        outbound: Outbound,
    },
    /// `connection` set means only that socket's registration is removed
    Leave {
        uid: Uid,
        connection: Option<ConnectionId>,
    },
    Input {
        uid: Uid,
        command: InputCommand,
    },
    Rename {
        uid: Uid,
        name: String,
    },
    Start,
}

/// Read-only view of a room, refreshed by the loop
#[derive(Debug, Clone, Copy)]
pub struct RoomStatus {
    pub phase: RoomPhase,
    pub player_count: usize,
    pub host: Option<Uid>,
    pub tick: u64,
    pub running: bool,
    pub last_active: Instant,
    pub created_at: Instant,
}

impl RoomStatus {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: RoomPhase::Idle,
            player_count: 0,
            host: None,
            tick: 1,
            running: false,
            last_active: now,
            created_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room is closed")]
    Closed,
}

/// Cloneable handle to a room task
#[derive(Clone)]
pub struct RoomHandle {
    id: Arc<str>,
    commands: mpsc::Sender<RoomCommand>,
    stop: Arc<watch::Sender<bool>>,
    status: Arc<RwLock<RoomStatus>>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RoomError::Closed)
    }

    /// Register a player; `outbound` becomes the room's only way to reach it
    pub async fn join(&self, uid: Uid, name: String, outbound: Outbound) -> Result<(), RoomError> {
        self.send(RoomCommand::Join {
            uid,
            name,
            outbound,
        })
        .await
    }

    /// Unregister a player regardless of which connection registered it
    pub async fn leave(&self, uid: Uid) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave {
            uid,
            connection: None,
        })
        .await
    }

    /// Unregister a player only if `connection` is still its registration
    pub async fn disconnect(&self, uid: Uid, connection: ConnectionId) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave {
            uid,
            connection: Some(connection),
        })
        .await
    }

    pub async fn submit_input(&self, uid: Uid, command: InputCommand) -> Result<(), RoomError> {
        self.send(RoomCommand::Input { uid, command }).await
    }

    pub async fn rename(&self, uid: Uid, name: String) -> Result<(), RoomError> {
        self.send(RoomCommand::Rename { uid, name }).await
    }

    /// Flip the running flag on. Returns false once the loop has exited.
    pub async fn start(&self) -> bool {
        self.send(RoomCommand::Start).await.is_ok()
    }

    /// Ask the loop to exit. Never blocks, safe to repeat after exit.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn status(&self) -> RoomStatus {
        *self.status.read()
    }

    pub fn player_count(&self) -> usize {
        self.status.read().player_count
    }

    /// Time since the last join or leave
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.status.read().last_active)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Whether both handles point at the same room instance
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        Arc::ptr_eq(&self.status, &other.status)
    }

    pub(crate) fn mark_removed(&self) {
        self.status.write().phase = RoomPhase::Removed;
    }

    /// Handle with no loop behind it; commands land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached(id: &str, capacity: usize) -> (Self, mpsc::Receiver<RoomCommand>) {
        let (commands, rx) = mpsc::channel(capacity);
        let (stop, _) = watch::channel(false);
        let handle = Self {
            id: Arc::from(id),
            commands,
            stop: Arc::new(stop),
            status: Arc::new(RwLock::new(RoomStatus::new())),
        };
        (handle, rx)
    }
}

/// Result of a leave command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// No such player, or a stale connection
    Ignored,
    Left,
    /// The last player left
    Empty,
}

/// A finished round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameOver {
    pub winner: Option<Uid>,
}

/// Authoritative room state (owned by the room task)
pub struct RoomState {
    pub id: Arc<str>,
    pub players: BTreeMap<Uid, Player>,
    pub beams: Vec<Beam>,
    pub map_size: f64,
    pub player_speed: f64,
    pub tick: u64,
    pub host: Option<Uid>,
    pub running: bool,
    pub game_over: bool,
    /// Joins since the room opened; a round needs at least two
    pub joined_this_round: usize,
    rng: ChaCha8Rng,
    broadcaster: Broadcaster,
}

impl RoomState {
    pub fn new(id: Arc<str>, settings: &RoomSettings, visibility: Box<dyn Visibility>) -> Self {
        Self {
            id,
            players: BTreeMap::new(),
            beams: Vec::new(),
            map_size: settings.map_size,
            player_speed: settings.player_speed,
            tick: 1,
            host: None,
            running: false,
            game_over: false,
            joined_this_round: 0,
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
            broadcaster: Broadcaster::new(visibility),
        }
    }

    /// Random point at least one player radius away from the walls
    fn spawn_position(&mut self) -> (f64, f64) {
        let (lo, hi) = (PLAYER_RADIUS, self.map_size - PLAYER_RADIUS);
        if hi <= lo {
            return (self.map_size / 2.0, self.map_size / 2.0);
        }
        (self.rng.gen_range(lo..=hi), self.rng.gen_range(lo..=hi))
    }

    pub fn alive_count(&self) -> usize {
        self.players.values().filter(|p| p.is_alive()).count()
    }

    fn broadcast_event(&self, kind: EventKind, target: Option<Uid>, message: impl Into<String>) {
        self.broadcaster
            .broadcast_event(EventPacket::new(kind, target, message), &self.players);
    }

    pub fn add_player(&mut self, uid: Uid, name: String, outbound: Outbound) {
        let name = sanitize_name(&name).unwrap_or_else(|| DEFAULT_PLAYER_NAME.to_string());
        let mut player = Player::new(uid, name, self.player_speed, outbound);
        (player.x, player.y) = self.spawn_position();

        if self.players.insert(uid, player).is_some() {
            warn!(room_id = %self.id, uid, "Player joined twice, replacing old connection");
        } else {
            self.joined_this_round += 1;
        }
        if self.host.is_none() {
            self.host = Some(uid);
        }

        info!(
            room_id = %self.id,
            uid,
            player_count = self.players.len(),
            "Player joined room"
        );
        let name = self.players.get(&uid).map(|p| p.name.clone()).unwrap_or_default();
        self.broadcast_event(EventKind::PlayerJoined, Some(uid), name);
    }

    pub fn remove_player(&mut self, uid: Uid, connection: Option<ConnectionId>) -> LeaveOutcome {
        match (self.players.get(&uid), connection) {
            (None, _) => return LeaveOutcome::Ignored,
            (Some(p), Some(conn)) if p.outbound.id() != conn => {
                debug!(room_id = %self.id, uid, "Stale connection leave ignored");
                return LeaveOutcome::Ignored;
            }
            _ => {}
        }

        self.players.remove(&uid);
        info!(
            room_id = %self.id,
            uid,
            player_count = self.players.len(),
            "Player left room"
        );
        self.broadcast_event(EventKind::PlayerLeft, Some(uid), "left");

        if self.players.is_empty() {
            self.running = false;
            self.host = None;
            return LeaveOutcome::Empty;
        }

        if self.host == Some(uid) {
            // BTreeMap keys are ordered, so this is the lowest remaining UID
            self.host = self.players.keys().next().copied();
            info!(room_id = %self.id, from = uid, to = ?self.host, "Host transferred");
            self.broadcast_event(EventKind::HostChanged, self.host, "host changed");
        }

        LeaveOutcome::Left
    }

    /// Buffer an input for the next tick. Unknown players are ignored.
    pub fn enqueue_input(&mut self, uid: Uid, command: InputCommand) {
        if let Some(player) = self.players.get_mut(&uid) {
            player.pending.push(command);
        }
    }

    pub fn rename(&mut self, uid: Uid, name: &str) {
        let (Some(player), Some(name)) = (self.players.get_mut(&uid), sanitize_name(name)) else {
            return;
        };
        player.name = name;
    }

    pub fn start(&mut self) {
        if self.game_over {
            debug!(room_id = %self.id, "Start ignored after game over");
            return;
        }
        self.running = true;
    }

    fn fire(&mut self, shot: BeamShot, now_ms: u64) {
        let (beam, hits) = CombatSystem::resolve_shot(&shot, now_ms, &mut self.players);
        self.beams.push(beam);

        for hit in hits {
            debug!(
                room_id = %self.id,
                shooter = hit.shooter_id,
                target = hit.target_id,
                damage = hit.damage,
                "Beam hit"
            );
            if hit.target_killed {
                self.broadcast_event(EventKind::PlayerDeath, Some(hit.target_id), "wasted");
            }
        }
    }

    /// One simulation step: inputs, beam expiry, win check, snapshot
    pub fn step(&mut self, now_ms: u64) -> Option<GameOver> {
        self.tick += 1;
        let exec_tick = execution_tick(self.tick);

        let uids: Vec<Uid> = self.players.keys().copied().collect();
        for uid in uids {
            let Some(player) = self.players.get_mut(&uid) else {
                continue;
            };
            let shots = process_player_inputs(player, exec_tick, now_ms, self.map_size);
            for shot in shots {
                self.fire(shot, now_ms);
            }
        }

        self.beams.retain(|b| !b.is_expired(now_ms));

        let over = self.check_win();

        let snapshot = SnapshotBuilder::build(self.tick, now_ms, &self.players, &self.beams);
        self.broadcaster.broadcast_snapshot(snapshot, &self.players);

        over
    }

    /// Ends the round once at most one player is left standing
    pub fn check_win(&mut self) -> Option<GameOver> {
        if !self.running || self.game_over || self.joined_this_round < 2 {
            return None;
        }

        let mut alive = self.players.values().filter(|p| p.is_alive());
        let survivor = alive.next().map(|p| p.uid);
        if alive.next().is_some() {
            return None;
        }

        self.running = false;
        self.game_over = true;
        self.broadcast_event(EventKind::GameOver, survivor, "Game Over");
        Some(GameOver { winner: survivor })
    }
}

/// Why a room loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomExit {
    Stopped,
    Empty,
    GameOver,
    Panicked,
}

/// The room actor
pub struct Room {
    state: RoomState,
    commands: mpsc::Receiver<RoomCommand>,
    stop: watch::Receiver<bool>,
    status: Arc<RwLock<RoomStatus>>,
    publisher: ResultPublisher,
    game_over_grace: Duration,
    teardown_at: Option<Instant>,
}

impl Room {
    pub fn new(id: &str, settings: &RoomSettings, ctx: RoomContext) -> (Self, RoomHandle) {
        let id: Arc<str> = Arc::from(id);
        let (command_tx, commands) = mpsc::channel(settings.command_capacity.max(1));
        let (stop_tx, stop) = watch::channel(false);
        let status = Arc::new(RwLock::new(RoomStatus::new()));

        let handle = RoomHandle {
            id: id.clone(),
            commands: command_tx,
            stop: Arc::new(stop_tx),
            status: status.clone(),
        };

        let room = Self {
            state: RoomState::new(id, settings, ctx.visibility),
            commands,
            stop,
            status,
            publisher: ctx.publisher,
            game_over_grace: settings.game_over_grace,
            teardown_at: None,
        };

        (room, handle)
    }

    /// Run the loop, turning a panic into [`RoomExit::Panicked`]
    pub async fn run_isolated(self) -> RoomExit {
        let id = self.state.id.clone();
        match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(exit) => exit,
            Err(_) => {
                error!(room_id = %id, "Room loop panicked");
                RoomExit::Panicked
            }
        }
    }

    /// Run the authoritative tick loop until stop, empty room, or teardown
    pub async fn run(mut self) -> RoomExit {
        info!(room_id = %self.state.id, "Room loop started");
        self.state.running = true;
        self.sync_status(RoomPhase::Running);

        let mut ticker = interval(TICK_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            if *self.stop.borrow() {
                break RoomExit::Stopped;
            }
            let teardown_at = self.teardown_at;

            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break RoomExit::Stopped;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.handle_command(command) {
                            break exit;
                        }
                    }
                    None => break RoomExit::Stopped,
                },
                _ = ticker.tick(), if !self.state.game_over => self.on_tick(),
                _ = wait_until(teardown_at), if teardown_at.is_some() => {
                    break RoomExit::GameOver;
                }
            }
        };

        self.state.running = false;
        self.sync_status(RoomPhase::Stopping);
        info!(room_id = %self.state.id, exit = ?exit, tick = self.state.tick, "Room loop exited");
        exit
    }

    fn handle_command(&mut self, command: RoomCommand) -> Option<RoomExit> {
        let mut exit = None;
        match command {
            RoomCommand::Join {
                uid,
                name,
                outbound,
            } => {
                self.state.add_player(uid, name, outbound);
                self.touch();
            }
            RoomCommand::Leave { uid, connection } => {
                let outcome = self.state.remove_player(uid, connection);
                if outcome != LeaveOutcome::Ignored {
                    self.touch();
                }
                if outcome == LeaveOutcome::Empty {
                    info!(room_id = %self.state.id, "Room empty, closing");
                    exit = Some(RoomExit::Empty);
                }
            }
            RoomCommand::Input { uid, command } => self.state.enqueue_input(uid, command),
            RoomCommand::Rename { uid, name } => self.state.rename(uid, &name),
            RoomCommand::Start => self.state.start(),
        }

        self.sync_status(RoomPhase::Running);
        exit
    }

    fn on_tick(&mut self) {
        if let Some(over) = self.state.step(unix_millis()) {
            info!(room_id = %self.state.id, winner = ?over.winner, "Game over");
            self.publisher
                .publish(MatchResult::new(self.state.id.to_string(), over.winner));
            self.teardown_at = Some(Instant::now() + self.game_over_grace);
        }
        self.sync_status(RoomPhase::Running);
    }

    fn touch(&mut self) {
        self.status.write().last_active = Instant::now();
    }

    fn sync_status(&self, phase: RoomPhase) {
        let mut status = self.status.write();
        if status.phase != RoomPhase::Removed {
            status.phase = phase;
        }
        status.player_count = self.state.players.len();
        status.host = self.state.host;
        status.tick = self.state.tick;
        status.running = self.state.running;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
