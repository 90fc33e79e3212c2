//! Room token lookups against the external token store

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use super::supabase::{SupabaseClient, SupabaseError};

/// Room tokens are issued by match-making and only read here
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Whether `token` is the token issued for `room_id`. Unknown rooms are
    /// simply invalid.
    async fn validate(&self, room_id: &str, token: &str) -> Result<bool, StoreError>;

    /// Reachability check run once at startup
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Supabase(#[from] SupabaseError),

    #[error("Token store unavailable: {0}")]
    Unavailable(String),
}

/// Row of the room_tokens table
#[derive(Debug, Clone, Deserialize)]
pub struct RoomTokenRow {
    pub room_id: String,
    pub token: String,
}

const ROOM_TOKENS_TABLE: &str = "room_tokens";

/// Tokens stored in Supabase
#[derive(Clone)]
pub struct SupabaseTokenStore {
    client: SupabaseClient,
}

impl SupabaseTokenStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    pub async fn get_token(&self, room_id: &str) -> Result<Option<RoomTokenRow>, SupabaseError> {
        let filter = format!("eq.{room_id}");
        self.client
            .get_one(
                ROOM_TOKENS_TABLE,
                &[("room_id", filter.as_str()), ("select", "room_id,token")],
            )
            .await
    }
}

#[async_trait]
impl TokenStore for SupabaseTokenStore {
    async fn validate(&self, room_id: &str, token: &str) -> Result<bool, StoreError> {
        let row = self.get_token(room_id).await?;
        Ok(row.is_some_and(|row| row.token == token))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .get::<RoomTokenRow>(
                ROOM_TOKENS_TABLE,
                &[("select", "room_id,token"), ("limit", "1")],
            )
            .await?;
        Ok(())
    }
}

/// Process-local tokens for development and tests
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<String, String>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let store = Self::new();
        for (room_id, token) in tokens {
            store.insert(room_id, token);
        }
        store
    }

    pub fn insert(&self, room_id: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(room_id.into(), token.into());
    }

}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn validate(&self, room_id: &str, token: &str) -> Result<bool, StoreError> {
        Ok(self
            .tokens
            .get(room_id)
            .is_some_and(|stored| stored.value() == token))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_matches_room_and_token() {
        let store = MemoryTokenStore::with_tokens([("lobby".to_string(), "abc".to_string())]);
        assert!(store.validate("lobby", "abc").await.unwrap());
        assert!(!store.validate("lobby", "abd").await.unwrap());
        assert!(!store.validate("duel", "abc").await.unwrap());

        store.insert("lobby", "rotated");
        assert!(!store.validate("lobby", "abc").await.unwrap());
        assert!(store.validate("lobby", "rotated").await.unwrap());
        assert!(store.ping().await.is_ok());
    }
}
