//! Process-wide directory of live rooms

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::GameConfig;
use crate::store::results::ResultPublisher;

use super::room::{Room, RoomContext, RoomHandle, RoomSettings};

/// Lifecycle tuning for the directory
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub room: RoomSettings,
    /// Empty rooms idle longer than this are reaped
    pub idle_timeout: Duration,
    /// Sweep period of the reaper
    pub reaper_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&GameConfig::default())
    }
}

impl From<&GameConfig> for RegistrySettings {
    fn from(game: &GameConfig) -> Self {
        Self {
            room: RoomSettings::from(game),
            idle_timeout: game.room_idle_timeout,
            reaper_interval: game.reaper_interval,
        }
    }
}

/// Registry of all live rooms
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    settings: RegistrySettings,
    publisher: ResultPublisher,
}

impl RoomRegistry {
    pub fn new(settings: RegistrySettings, publisher: ResultPublisher) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            settings,
            publisher,
        })
    }

    /// Existing room, or a freshly registered one with its loop spawned
    pub fn create(self: &Arc<Self>, id: &str) -> RoomHandle {
        if let Some(handle) = self.get(id) {
            return handle;
        }

        let mut rooms = self.rooms.write();
        if let Some(handle) = rooms.get(id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (room, handle) = Room::new(
            id,
            &self.settings.room,
            RoomContext::new(self.publisher.clone()),
        );
        rooms.insert(id.to_string(), handle.clone());
        drop(rooms);

        let registry = Arc::downgrade(self);
        let watched = handle.clone();
        tokio::spawn(async move {
            let exit = room.run_isolated().await;
            debug!(room_id = %watched.id(), exit = ?exit, "Room task finished");
            release(&registry, &watched);
        });

        info!(room_id = %id, "Room created");
        handle
    }

    /// Live room by id. Rooms whose loop already exited count as missing.
    pub fn get(&self, id: &str) -> Option<RoomHandle> {
        self.rooms
            .read()
            .get(id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Flip a room's running flag on. False when the room does not exist.
    pub async fn start(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => handle.start().await,
            None => false,
        }
    }

    /// Delete the directory entry
    pub fn remove(&self, id: &str) -> Option<RoomHandle> {
        let handle = self.rooms.write().remove(id)?;
        handle.mark_removed();
        info!(room_id = %id, "Room removed");
        Some(handle)
    }

    /// Delete the entry only if it still points at `handle`'s room
    pub fn remove_instance(&self, handle: &RoomHandle) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get(handle.id()) {
            Some(current) if current.same_room(handle) => {
                rooms.remove(handle.id());
                drop(rooms);
                handle.mark_removed();
                info!(room_id = %handle.id(), "Room removed");
                true
            }
            _ => false,
        }
    }

    /// Stop and remove every empty room idle for longer than the timeout
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        // Snapshot the handles, then inspect each room without the directory lock
        let handles: Vec<RoomHandle> = self.rooms.read().values().cloned().collect();

        let mut reaped = 0;
        for handle in handles {
            if handle.player_count() == 0 && handle.idle_for(now) > self.settings.idle_timeout {
                info!(room_id = %handle.id(), "Reaping idle room");
                handle.stop();
                if self.remove_instance(&handle) {
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Background sweep, runs until the registry is dropped
    pub async fn run_reaper(self: Arc<Self>) {
        let period = self.settings.reaper_interval;
        let registry = Arc::downgrade(&self);
        drop(self);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                debug!("Registry dropped, reaper exiting");
                return;
            };
            let reaped = registry.sweep_idle();
            if reaped > 0 {
                info!(reaped, active = registry.active_rooms(), "Idle rooms reaped");
            }
        }
    }

    /// Stop every room and empty the directory
    pub fn clear(&self) {
        let rooms: Vec<RoomHandle> = self.rooms.write().drain().map(|(_, h)| h).collect();
        for handle in &rooms {
            handle.stop();
            handle.mark_removed();
        }
        info!(count = rooms.len(), "All rooms stopped");
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn total_players(&self) -> usize {
        let handles: Vec<RoomHandle> = self.rooms.read().values().cloned().collect();
        handles.iter().map(|h| h.player_count()).sum()
    }
}

fn release(registry: &Weak<RoomRegistry>, handle: &RoomHandle) {
    if let Some(registry) = registry.upgrade() {
        registry.remove_instance(handle);
    }
}
