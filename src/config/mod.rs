//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Where room tokens and match results live
    pub store: StoreBackend,

    /// Allowed client origin for CORS
    pub client_origin: String,

    /// Gameplay and room lifecycle tuning
    pub game: GameConfig,
}

/// External store selection, `TOKEN_STORE=supabase|memory`
#[derive(Clone, Debug)]
pub enum StoreBackend {
    /// Supabase REST (room_tokens and match_results tables)
    Supabase {
        url: String,
        /// Service role key (bypasses RLS - server only!)
        service_role_key: String,
    },
    /// Process-local tokens from `DEV_ROOM_TOKENS="room:token,..."`, results
    /// are only logged
    Memory { room_tokens: Vec<(String, String)> },
}

impl StoreBackend {
    fn from_env() -> Result<Self, ConfigError> {
        let kind = env::var("TOKEN_STORE").unwrap_or_else(|_| "supabase".to_string());
        match kind.trim().to_ascii_lowercase().as_str() {
            "supabase" => Ok(Self::Supabase {
                url: env::var("SUPABASE_URL").map_err(|_| ConfigError::Missing("SUPABASE_URL"))?,
                service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                    .map_err(|_| ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?,
            }),
            "memory" => Ok(Self::Memory {
                room_tokens: parse_room_tokens(
                    &env::var("DEV_ROOM_TOKENS").unwrap_or_default(),
                )?,
            }),
            _ => Err(ConfigError::Invalid("TOKEN_STORE")),
        }
    }
}

/// Parse `room:token` pairs separated by commas
fn parse_room_tokens(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((room, token)) if !room.trim().is_empty() && !token.trim().is_empty() => {
                Ok((room.trim().to_string(), token.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid("DEV_ROOM_TOKENS")),
        })
        .collect()
}

/// Room tuning, defaults match the shipped client
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Side length of the square arena
    pub map_size: f64,
    /// Player movement speed (units per second at full input)
    pub player_speed: f64,
    /// Empty rooms idle longer than this are reaped
    pub room_idle_timeout: Duration,
    /// How often the reaper sweeps the registry
    pub reaper_interval: Duration,
    /// Time between game over and room teardown
    pub game_over_grace: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            map_size: 2000.0,
            player_speed: 10.0,
            room_idle_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
            game_over_grace: Duration::from_secs(5),
        }
    }
}

impl GameConfig {
    /// Reject values the simulation cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.map_size.is_finite() || self.map_size <= 0.0 {
            return Err(ConfigError::Invalid("MAP_SIZE"));
        }
        if !self.player_speed.is_finite() || self.player_speed < 0.0 {
            return Err(ConfigError::Invalid("PLAYER_SPEED"));
        }
        if self.room_idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("ROOM_IDLE_SECS"));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid("REAPER_INTERVAL_SECS"));
        }
        if self.game_over_grace.is_zero() {
            return Err(ConfigError::Invalid("GAME_OVER_GRACE_SECS"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = GameConfig::default();
        let game = GameConfig {
            map_size: parse_or("MAP_SIZE", defaults.map_size)?,
            player_speed: parse_or("PLAYER_SPEED", defaults.player_speed)?,
            room_idle_timeout: Duration::from_secs(parse_or(
                "ROOM_IDLE_SECS",
                defaults.room_idle_timeout.as_secs(),
            )?),
            reaper_interval: Duration::from_secs(parse_or(
                "REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )?),
            game_over_grace: Duration::from_secs(parse_or(
                "GAME_OVER_GRACE_SECS",
                defaults.game_over_grace.as_secs(),
            )?),
        };

        game.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            store: StoreBackend::from_env()?,

            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            game,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
